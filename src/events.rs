//! Session events published for UI consumption
//!
//! State should be queried directly from the owning components; events only
//! tell the UI that something changed.

use crate::connection::ConnectionState;
use crate::error_report::ErrorRecord;
use crate::permission::PermissionState;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

/// Events emitted by the session components
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Connection state machine moved to a new state
    ConnectionChanged(ConnectionState),
    /// Microphone permission changed (explicitly or from the platform)
    PermissionChanged(PermissionState),
    /// Push-to-talk or streaming capture toggled
    RecordingChanged(bool),
    /// Shared memory contents changed
    MemoryUpdated,
    /// A new user-facing error replaced the current one
    ErrorRaised(ErrorRecord),
    /// The current error was cleared
    ErrorCleared,
    /// A backend tool call finished
    ToolCompleted { name: String, success: bool },
}

/// Non-blocking publisher side of the session event channel
///
/// A full channel drops the event rather than stalling the session.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus and the receiver the UI polls
    pub fn new(capacity: usize) -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }

    /// Publish an event, dropping it if nobody keeps up
    pub fn publish(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Session event channel full, dropping {:?}", event);
            }
            // No receiver left; the UI went away
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
