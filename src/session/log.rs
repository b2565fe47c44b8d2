//! Realtime event log for the console view

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Client,
    Server,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoggedEvent {
    pub time: DateTime<Utc>,
    pub source: EventSource,
    pub kind: String,
    /// Consecutive repeats folded into this entry
    pub count: u32,
}

/// Ordered log of protocol traffic
///
/// Runs of the same server event (audio deltas, mostly) fold into one entry.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    entries: Vec<LoggedEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, source: EventSource, kind: impl Into<String>) {
        self.record_at(Utc::now(), source, kind);
    }

    pub fn record_at(&mut self, time: DateTime<Utc>, source: EventSource, kind: impl Into<String>) {
        let kind = kind.into();
        if let Some(last) = self.entries.last_mut() {
            if source == EventSource::Server && last.source == source && last.kind == kind {
                last.count += 1;
                return;
            }
        }

        self.entries.push(LoggedEvent {
            time,
            source,
            kind,
            count: 1,
        });
    }

    pub fn entries(&self) -> &[LoggedEvent] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
