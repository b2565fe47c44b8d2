//! Realtime voice backend contract
//!
//! The session manager does not speak the wire protocol itself. It drives a
//! [`RealtimeClient`] and listens to the [`ClientEvent`]s the client pushes
//! back (connection loss, tool calls, assistant audio).

pub mod loopback;

pub use loopback::{ClientCall, LoopbackClient};

use crate::tools::{ToolCallResult, ToolDefinition};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Content sent into the conversation as a user message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    InputText { text: String },
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::InputText { text: text.into() }
    }
}

/// Server-side turn detection strategies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionType {
    ServerVad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: TurnDetectionType,
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        Self {
            kind: TurnDetectionType::ServerVad,
        }
    }
}

/// Session configuration pushed to the backend
///
/// `turn_detection: None` serializes as `null`, which switches the backend to
/// client-driven turns. Instructions and tools are left untouched when unset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub turn_detection: Option<TurnDetection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl SessionUpdate {
    pub fn new(turn_detection: Option<TurnDetection>) -> Self {
        Self {
            turn_detection,
            ..Self::default()
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Events pushed by the backend client
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// The transport closed without a local disconnect
    ConnectionLost { reason: String },
    /// The assistant wants a local tool run
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// A chunk of assistant speech for a conversation item
    AudioDelta { item_id: String, samples: Vec<i16> },
    /// Any other server event, kept for the event log
    ServerEvent { kind: String },
}

/// Operations the session manager invokes on the voice backend
#[async_trait]
pub trait RealtimeClient: Send + Sync {
    /// Open the session
    async fn connect(&self) -> Result<()>;

    /// Close the session; closing a closed session does nothing
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Stream captured PCM16 into the input buffer
    ///
    /// Called from the capture callback, so it must not block.
    fn append_input_audio(&self, samples: &[i16]) -> Result<()>;

    fn send_user_message_content(&self, items: Vec<ContentItem>) -> Result<()>;

    /// Ask for a response from whatever is buffered
    fn create_response(&self) -> Result<()>;

    /// Cancel the response whose audio was cut off at `offset` samples
    async fn cancel_response(&self, track_id: &str, offset: u64) -> Result<()>;

    fn delete_item(&self, id: &str) -> Result<()>;

    fn update_session(&self, update: SessionUpdate) -> Result<()>;

    /// Turn detection currently configured on the session
    fn turn_detection_type(&self) -> Option<TurnDetectionType>;

    /// Return the output of a tool call to the conversation
    fn submit_tool_result(&self, call_id: &str, result: &ToolCallResult) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
}
