//! In-process backend
//!
//! Keeps the session manager runnable without a network: every call is
//! recorded, connects can be scripted to fail, the transport can be dropped
//! on demand and arbitrary server events injected.

use super::{
    ClientEvent, ContentItem, RealtimeClient, SessionUpdate, TurnDetectionType,
};
use crate::tools::ToolCallResult;
use crate::{Result, SessionError};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// A call made on the client, in order
#[derive(Clone, Debug, PartialEq)]
pub enum ClientCall {
    Connect,
    Disconnect,
    AppendInputAudio(usize),
    SendUserMessage(Vec<ContentItem>),
    CreateResponse,
    CancelResponse { track_id: String, offset: u64 },
    DeleteItem(String),
    UpdateSession(SessionUpdate),
    SubmitToolResult {
        call_id: String,
        result: serde_json::Value,
    },
}

#[derive(Default)]
struct LoopbackState {
    connected: bool,
    turn_detection: Option<TurnDetectionType>,
    calls: Vec<ClientCall>,
    /// Connects left to fail before succeeding again
    failing_connects: u32,
    refuse_connections: bool,
    input_samples: usize,
    reply_audio: Option<Vec<i16>>,
}

pub struct LoopbackClient {
    state: Mutex<LoopbackState>,
    events: broadcast::Sender<ClientEvent>,
}

impl LoopbackClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(LoopbackState::default()),
            events,
        }
    }

    /// Answer every `create_response` with this audio on a fresh item
    pub fn with_reply_audio(self, samples: Vec<i16>) -> Self {
        self.state.lock().reply_audio = Some(samples);
        self
    }

    /// Fail the next `count` connects
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Fail every connect until turned off
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Close the transport as if the server went away
    pub fn drop_connection(&self, reason: &str) {
        let was_connected = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.connected, false)
        };

        if was_connected {
            warn!("Loopback transport dropped: {}", reason);
            self.emit(ClientEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }

    /// Push a server event to subscribers
    pub fn emit(&self, event: ClientEvent) {
        // No subscribers is fine; nobody is listening yet
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.state.lock().calls.clone()
    }

    /// How many recorded calls match `predicate`
    pub fn count_calls(&self, predicate: impl Fn(&ClientCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn connect_attempts(&self) -> usize {
        self.count_calls(|c| matches!(c, ClientCall::Connect))
    }

    /// Total captured samples received
    pub fn input_samples(&self) -> usize {
        self.state.lock().input_samples
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: ClientCall) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SessionError::Backend(format!(
                "Not connected, cannot send {:?}",
                call
            )));
        }
        state.calls.push(call);
        Ok(())
    }
}

impl Default for LoopbackClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeClient for LoopbackClient {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ClientCall::Connect);

        if state.connected {
            return Err(SessionError::Backend("Already connected".into()));
        }
        if state.refuse_connections {
            return Err(SessionError::Connection("Loopback refused the connection".into()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(SessionError::Connection("Loopback connect failed".into()));
        }

        state.connected = true;
        info!("Loopback session opened");
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        state.calls.push(ClientCall::Disconnect);
        if state.connected {
            state.connected = false;
            info!("Loopback session closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn append_input_audio(&self, samples: &[i16]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SessionError::Backend("Not connected, dropping input audio".into()));
        }
        state.input_samples += samples.len();
        state.calls.push(ClientCall::AppendInputAudio(samples.len()));
        Ok(())
    }

    fn send_user_message_content(&self, items: Vec<ContentItem>) -> Result<()> {
        self.record(ClientCall::SendUserMessage(items))?;
        self.emit(ClientEvent::ServerEvent {
            kind: "conversation.item.created".into(),
        });
        Ok(())
    }

    fn create_response(&self) -> Result<()> {
        self.record(ClientCall::CreateResponse)?;
        self.emit(ClientEvent::ServerEvent {
            kind: "response.created".into(),
        });

        let reply = self.state.lock().reply_audio.clone();
        if let Some(samples) = reply {
            let item_id = format!("item_{}", Uuid::new_v4().simple());
            debug!("Loopback replying with {} samples on {}", samples.len(), item_id);
            self.emit(ClientEvent::AudioDelta { item_id, samples });
        }
        Ok(())
    }

    async fn cancel_response(&self, track_id: &str, offset: u64) -> Result<()> {
        self.record(ClientCall::CancelResponse {
            track_id: track_id.to_string(),
            offset,
        })?;
        self.emit(ClientEvent::ServerEvent {
            kind: "response.cancelled".into(),
        });
        Ok(())
    }

    fn delete_item(&self, id: &str) -> Result<()> {
        self.record(ClientCall::DeleteItem(id.to_string()))
    }

    fn update_session(&self, update: SessionUpdate) -> Result<()> {
        // Session settings are accepted before connecting
        let mut state = self.state.lock();
        state.turn_detection = update.turn_detection.map(|td| td.kind);
        state.calls.push(ClientCall::UpdateSession(update));
        Ok(())
    }

    fn turn_detection_type(&self) -> Option<TurnDetectionType> {
        self.state.lock().turn_detection
    }

    fn submit_tool_result(&self, call_id: &str, result: &ToolCallResult) -> Result<()> {
        self.record(ClientCall::SubmitToolResult {
            call_id: call_id.to_string(),
            result: result.to_json(),
        })?;
        self.emit(ClientEvent::ServerEvent {
            kind: "conversation.item.created".into(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}
