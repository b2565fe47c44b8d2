//! Session lifecycle state owned by the controller

use crate::backend::{TurnDetection, TurnDetectionType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who decides where a user turn ends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionMode {
    /// Push-to-talk: the client marks start and stop
    #[default]
    Manual,
    /// The backend segments speech on its own
    ServerDetected,
}

impl TurnDetectionMode {
    pub fn is_manual(&self) -> bool {
        matches!(self, TurnDetectionMode::Manual)
    }

    /// Backend setting for this mode (`None` means client-driven turns)
    pub fn turn_detection(&self) -> Option<TurnDetection> {
        match self {
            TurnDetectionMode::Manual => None,
            TurnDetectionMode::ServerDetected => Some(TurnDetection::server_vad()),
        }
    }

    pub fn from_backend(kind: Option<TurnDetectionType>) -> Self {
        match kind {
            Some(TurnDetectionType::ServerVad) => TurnDetectionMode::ServerDetected,
            None => TurnDetectionMode::Manual,
        }
    }
}

impl std::fmt::Display for TurnDetectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnDetectionMode::Manual => write!(f, "manual"),
            TurnDetectionMode::ServerDetected => write!(f, "server_detected"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Set on connect, used for elapsed-time displays
    pub start_time: Option<DateTime<Utc>>,
    pub turn_detection_mode: TurnDetectionMode,
    pub is_recording: bool,
}

impl SessionState {
    pub fn new(mode: TurnDetectionMode) -> Self {
        Self {
            start_time: None,
            turn_detection_mode: mode,
            is_recording: false,
        }
    }

    /// Mark the start of a session
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.start_time = Some(now);
        self.is_recording = false;
    }

    /// Clear lifecycle fields, keeping the chosen turn mode
    pub fn reset(&mut self) {
        self.start_time = None;
        self.is_recording = false;
    }

    /// Time since session start as `mm:ss.hh`
    ///
    /// Minutes wrap at 60. Timestamps before the start, or a session that
    /// never started, render as `00:00.00`.
    pub fn format_elapsed(&self, timestamp: DateTime<Utc>) -> String {
        let delta = self
            .start_time
            .map(|start| (timestamp - start).num_milliseconds().max(0))
            .unwrap_or(0);

        let hundredths = (delta / 10) % 100;
        let seconds = (delta / 1000) % 60;
        let minutes = (delta / 60_000) % 60;
        format!("{:02}:{:02}.{:02}", minutes, seconds, hundredths)
    }
}
