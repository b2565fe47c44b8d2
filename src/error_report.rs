//! Single-slot user-facing error reporting
//!
//! The reporter only tracks what the UI should show right now. A new error
//! overwrites the previous one; history belongs in the logs.

use crate::events::{EventBus, SessionEvent};
use crate::SessionError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// User-facing error categories
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connectivity unreachable
    Network,
    /// Permission or capture device failure
    Microphone,
    /// Backend session establishment or loss
    Connection,
    /// Anything else
    General,
}

impl ErrorKind {
    /// Fixed message shown for this kind
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::Network => {
                "There is a problem with the network connection. Please check your internet connection."
            }
            ErrorKind::Microphone => {
                "Microphone access is required. Please allow microphone access in your settings."
            }
            ErrorKind::Connection => {
                "Could not connect to the assistant server. Please try again shortly."
            }
            ErrorKind::General => "An unknown error occurred.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Microphone => write!(f, "microphone"),
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::General => write!(f, "general"),
        }
    }
}

/// What the UI should display
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub has_error: bool,
    pub message: String,
    pub kind: Option<ErrorKind>,
}

impl ErrorRecord {
    fn new(kind: ErrorKind, detail: Option<&str>) -> Self {
        let message = match kind {
            // General errors carry their own context when they have one
            ErrorKind::General => detail
                .filter(|d| !d.is_empty())
                .unwrap_or(kind.default_message())
                .to_string(),
            _ => kind.default_message().to_string(),
        };

        Self {
            has_error: true,
            message,
            kind: Some(kind),
        }
    }
}

/// Shared single-slot error reporter
#[derive(Clone, Default)]
pub struct ErrorReporter {
    current: Arc<RwLock<ErrorRecord>>,
    events: Option<EventBus>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reporter that announces changes on the event bus
    pub fn with_events(events: EventBus) -> Self {
        Self {
            current: Arc::new(RwLock::new(ErrorRecord::default())),
            events: Some(events),
        }
    }

    /// Replace the current error with one of `kind`
    ///
    /// `detail` is logged, and used as the message only for `General`.
    pub fn set(&self, kind: ErrorKind, detail: Option<&str>) {
        error!("[{}] {}", kind, detail.unwrap_or("no detail"));

        let record = ErrorRecord::new(kind, detail);
        *self.current.write() = record.clone();

        if let Some(events) = &self.events {
            events.publish(SessionEvent::ErrorRaised(record));
        }
    }

    /// Report a crate error under its own classification
    pub fn report(&self, err: &SessionError) {
        let detail = err.to_string();
        self.set(err.kind(), Some(detail.as_str()));
    }

    /// Reset to no-error
    pub fn clear(&self) {
        let had_error = {
            let mut current = self.current.write();
            let had_error = current.has_error;
            *current = ErrorRecord::default();
            had_error
        };

        if had_error {
            if let Some(events) = &self.events {
                events.publish(SessionEvent::ErrorCleared);
            }
        }
    }

    /// Snapshot of the current record
    pub fn current(&self) -> ErrorRecord {
        self.current.read().clone()
    }

    pub fn has_error(&self) -> bool {
        self.current.read().has_error
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.current.read().kind
    }
}
