//! Session orchestration
//!
//! The [`SessionController`] composes permission gating, the connection
//! manager, audio devices and tool dispatch into the commands a UI issues.

pub mod controller;
pub mod log;
pub mod memory;
pub mod state;

pub use controller::{SessionBuilder, SessionController};
pub use log::{EventLog, EventSource, LoggedEvent};
pub use memory::{MemoryWriter, SharedMemory};
pub use state::{SessionState, TurnDetectionMode};
