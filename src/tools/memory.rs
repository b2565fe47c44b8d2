//! Built-in `set_memory` tool

use super::{Tool, ToolCallResult, ToolDefinition};
use crate::session::MemoryWriter;
use crate::{Result, SessionError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct SetMemoryParams {
    pub key: String,
    pub value: Value,
}

/// Lets the assistant remember facts about the user
#[derive(Debug, Clone, Copy, Default)]
pub struct SetMemoryTool;

#[async_trait]
impl Tool for SetMemoryTool {
    type Params = SetMemoryParams;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "set_memory".to_string(),
            description: "Saves important data about the user into memory.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": {
                        "type": "string",
                        "description": "The key of the memory value. Always use lowercase and underscores, no other characters."
                    },
                    "value": {
                        "type": "string",
                        "description": "Value can be anything represented as a string"
                    }
                },
                "required": ["key", "value"]
            }),
        }
    }

    async fn call(&self, params: SetMemoryParams, memory: &MemoryWriter) -> Result<ToolCallResult> {
        let key = params.key.trim();
        if key.is_empty() {
            return Err(SessionError::ToolError("memory key must not be empty".into()));
        }

        memory.set(key, params.value);
        Ok(ToolCallResult::success(format!("Saved {}", key)).with_field("key", json!(key)))
    }
}
