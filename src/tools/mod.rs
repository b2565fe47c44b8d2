//! Tool dispatch for assistant-invoked function calls
//!
//! Each tool declares a typed parameter shape. The dispatcher erases tools
//! behind a wrapper that never fails: bad arguments, handler errors and
//! handler panics all come back as [`ToolCallResult::Failure`].

pub mod memory;

pub use memory::SetMemoryTool;

use crate::session::MemoryWriter;
use crate::Result;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Failure message for unregistered tool names
pub const UNKNOWN_TOOL: &str = "unknown tool";

/// Failure message for a handler that panicked
pub const TOOL_FAULT: &str = "tool execution failed";

/// Tool description exposed to the backend session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema object: `type`, `properties`, `required`
    pub parameters: Value,
}

/// Outcome of a tool call, returned to the assistant
#[derive(Clone, Debug, PartialEq)]
pub enum ToolCallResult {
    Success {
        message: String,
        extra: Map<String, Value>,
    },
    Failure {
        error: String,
    },
}

impl ToolCallResult {
    pub fn success(message: impl Into<String>) -> Self {
        ToolCallResult::Success {
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        ToolCallResult::Failure {
            error: error.into(),
        }
    }

    /// Attach an extra field to a success result
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        if let ToolCallResult::Success { extra, .. } = &mut self {
            extra.insert(key.into(), value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolCallResult::Success { .. })
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        match self {
            ToolCallResult::Success { message, extra } => {
                object.insert("success".into(), Value::Bool(true));
                object.insert("message".into(), Value::String(message.clone()));
                for (key, value) in extra {
                    if key != "success" && key != "message" {
                        object.insert(key.clone(), value.clone());
                    }
                }
            }
            ToolCallResult::Failure { error } => {
                object.insert("success".into(), Value::Bool(false));
                object.insert("error".into(), Value::String(error.clone()));
            }
        }
        Value::Object(object)
    }
}

impl Serialize for ToolCallResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// A local operation the assistant can invoke
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Params: DeserializeOwned + Send;

    fn definition(&self) -> ToolDefinition;

    /// Run the tool; an `Err` becomes a failure result carrying its message
    async fn call(&self, params: Self::Params, memory: &MemoryWriter) -> Result<ToolCallResult>;
}

#[async_trait]
trait ErasedTool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    async fn invoke(&self, arguments: Value, memory: &MemoryWriter) -> ToolCallResult;
}

struct TypedTool<T: Tool> {
    tool: T,
    definition: ToolDefinition,
}

#[async_trait]
impl<T: Tool> ErasedTool for TypedTool<T> {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, arguments: Value, memory: &MemoryWriter) -> ToolCallResult {
        let params: T::Params = match serde_json::from_value(arguments) {
            Ok(params) => params,
            Err(e) => return ToolCallResult::failure(format!("invalid parameters: {}", e)),
        };

        let call = AssertUnwindSafe(self.tool.call(params, memory));
        settle(&self.definition.name, call.catch_unwind().await)
    }
}

type ToolFn = dyn Fn(Value, &MemoryWriter) -> Result<ToolCallResult> + Send + Sync;

/// Untyped handler registered from a closure
struct FnTool {
    definition: ToolDefinition,
    handler: Box<ToolFn>,
}

#[async_trait]
impl ErasedTool for FnTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, arguments: Value, memory: &MemoryWriter) -> ToolCallResult {
        let call = AssertUnwindSafe(async { (self.handler)(arguments, memory) });
        settle(&self.definition.name, call.catch_unwind().await)
    }
}

fn settle(
    name: &str,
    outcome: std::thread::Result<Result<ToolCallResult>>,
) -> ToolCallResult {
    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!("Tool {} failed: {}", name, e);
            ToolCallResult::failure(e.to_string())
        }
        Err(_) => {
            error!("Tool {} panicked", name);
            ToolCallResult::failure(TOOL_FAULT)
        }
    }
}

/// Registry of tools callable by the assistant
#[derive(Clone)]
pub struct ToolDispatcher {
    tools: Arc<RwLock<BTreeMap<String, Arc<dyn ErasedTool>>>>,
    memory: MemoryWriter,
}

impl ToolDispatcher {
    pub fn new(memory: MemoryWriter) -> Self {
        Self {
            tools: Arc::new(RwLock::new(BTreeMap::new())),
            memory,
        }
    }

    /// Register a typed tool under its definition name
    pub fn register<T: Tool>(&self, tool: T) {
        let definition = tool.definition();
        self.insert(Arc::new(TypedTool { tool, definition }));
    }

    /// Register a closure handler with raw JSON arguments
    pub fn register_fn<F>(&self, definition: ToolDefinition, handler: F)
    where
        F: Fn(Value, &MemoryWriter) -> Result<ToolCallResult> + Send + Sync + 'static,
    {
        self.insert(Arc::new(FnTool {
            definition,
            handler: Box::new(handler),
        }));
    }

    fn insert(&self, tool: Arc<dyn ErasedTool>) {
        let name = tool.definition().name.clone();
        if self.tools.write().insert(name.clone(), tool).is_some() {
            warn!("Tool {} re-registered, replacing previous handler", name);
        } else {
            debug!("Registered tool {}", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Definitions of every registered tool, ordered by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .values()
            .map(|tool| tool.definition().clone())
            .collect()
    }

    /// Run the tool registered as `name`
    ///
    /// Never fails: every problem is reported inside the result.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> ToolCallResult {
        let tool = self.tools.read().get(name).cloned();
        let Some(tool) = tool else {
            warn!("Assistant called unknown tool {}", name);
            return ToolCallResult::failure(UNKNOWN_TOOL);
        };

        info!("Dispatching tool {}", name);
        let result = tool.invoke(arguments, &self.memory).await;
        debug!("Tool {} finished, success={}", name, result.is_success());
        result
    }
}
