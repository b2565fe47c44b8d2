//! Parley - client-side session manager for realtime voice assistants
//!
//! Keeps a realtime voice session with a remote assistant consistent with the
//! local audio devices: connection lifecycle with bounded reconnects,
//! microphone permission gating, push-to-talk and server-side turn detection,
//! and dispatch of assistant-invoked tool calls into a shared memory store.

pub mod audio;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error_report;
pub mod events;
pub mod permission;
pub mod session;
pub mod tools;

pub use config::SessionConfig;
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use error_report::{ErrorKind, ErrorRecord, ErrorReporter};
pub use events::{EventBus, SessionEvent};
pub use permission::{PermissionGate, PermissionState};
pub use session::{SessionController, SharedMemory, TurnDetectionMode};
pub use tools::{ToolCallResult, ToolDispatcher};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Microphone error: {0}")]
    Microphone(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::IOError(e.to_string())
    }
}

impl SessionError {
    /// Classify this error into the user-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::PermissionDenied
            | SessionError::Microphone(_)
            | SessionError::AudioDevice(_) => ErrorKind::Microphone,
            SessionError::Connection(_) | SessionError::Backend(_) => ErrorKind::Connection,
            SessionError::Network(_) => ErrorKind::Network,
            SessionError::InvalidState(_)
            | SessionError::ToolError(_)
            | SessionError::Config(_)
            | SessionError::Channel(_)
            | SessionError::IOError(_) => ErrorKind::General,
        }
    }

    /// Check if this error is recoverable without user intervention
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Retried by the reconnect policy
            SessionError::Connection(_) => true,
            SessionError::Backend(_) => true,
            // Tool failures never take the session down
            SessionError::ToolError(_) => true,
            // User has to change OS settings or plug in a device
            SessionError::PermissionDenied => false,
            SessionError::Microphone(_) => false,
            SessionError::AudioDevice(_) => false,
            // Surfaced once, the user decides whether to retry
            SessionError::Network(_) => false,
            SessionError::InvalidState(_) => false,
            SessionError::Config(_) => false,
            SessionError::Channel(_) => false,
            SessionError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::General => self.to_string(),
            kind => kind.default_message().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(SessionError::PermissionDenied.kind(), ErrorKind::Microphone);
        assert_eq!(
            SessionError::AudioDevice("gone".into()).kind(),
            ErrorKind::Microphone
        );
        assert_eq!(
            SessionError::Connection("refused".into()).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            SessionError::Network("offline".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            SessionError::ToolError("boom".into()).kind(),
            ErrorKind::General
        );
    }

    #[test]
    fn test_user_message() {
        let err = SessionError::Connection("socket closed".into());
        assert_eq!(err.user_message(), ErrorKind::Connection.default_message());

        let err = SessionError::InvalidState("already connected".into());
        assert_eq!(err.user_message(), "Invalid state: already connected");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SessionError = io.into();
        assert!(matches!(err, SessionError::IOError(_)));
        assert!(!err.is_recoverable());
    }
}
