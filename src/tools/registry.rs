//! Tool registry and the uniform response envelope.

use crate::error::{Result, ToolError};
use crate::protocol::{CallToolParams, Tool};
use async_trait::async_trait;
use chrono::Local;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

/// A named operation callable through `tools/call`.
///
/// `execute` returns the response envelope. Expected failures (bad input,
/// backend errors) are reported inside it with `success: false`; an `Err`
/// means the call could not be dispatched at all.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> Tool;
    async fn execute(&self, arguments: Value) -> Result<Value>;
}

pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    pub fn register<T: ToolHandler + 'static>(&self, tool: T) {
        let definition = tool.definition();
        let name = definition.name.clone();
        debug!("Registering tool: {}", name);
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|r| Arc::clone(&*r))
    }

    /// Definitions sorted by name.
    pub fn list(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.iter().map(|r| r.value().definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn execute(&self, params: CallToolParams) -> Result<Value> {
        let tool = self
            .get(&params.name)
            .ok_or_else(|| ToolError::NotFound(params.name.clone()))?;

        tool.execute(params.arguments).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[macro_export]
macro_rules! define_tool {
    (
        name: $name:expr,
        description: $desc:expr,
        schema: $schema:tt
    ) => {
        $crate::protocol::Tool {
            name: $name.into(),
            description: Some($desc.into()),
            input_schema: serde_json::json!($schema),
        }
    };
}

/// Local wall-clock time as `YYYY-MM-DD HH:MM:SS`.
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `{success: true, result, message, timestamp}`.
pub fn success<T: Serialize>(result: &T, message: &str) -> Value {
    let message = if message.is_empty() {
        "Operation successful"
    } else {
        message
    };
    json!({
        "success": true,
        "result": serde_json::to_value(result).unwrap_or(Value::Null),
        "message": message,
        "timestamp": timestamp(),
    })
}

/// `{success: false, error, message, timestamp}`.
pub fn failure(error: impl Into<String>, message: &str) -> Value {
    let message = if message.is_empty() {
        "Operation failed"
    } else {
        message
    };
    json!({
        "success": false,
        "error": error.into(),
        "message": message,
        "timestamp": timestamp(),
    })
}

/// Deserializes tool arguments; a JSON `null` counts as `{}`.
pub fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|e| ToolError::InvalidArguments(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestTool;

    #[async_trait]
    impl ToolHandler for TestTool {
        fn definition(&self) -> Tool {
            crate::define_tool! {
                name: "test_tool",
                description: "A test tool",
                schema: { "type": "object", "properties": {} }
            }
        }

        async fn execute(&self, _arguments: Value) -> Result<Value> {
            Ok(success(&"pong", ""))
        }
    }

    #[test]
    fn test_registry() {
        let registry = ToolRegistry::new();
        registry.register(TestTool);

        assert_eq!(registry.len(), 1);
        assert!(registry.get("test_tool").is_some());
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.list()[0].name, "test_tool");
    }

    #[tokio::test]
    async fn test_execute_and_unknown_tool() {
        let registry = ToolRegistry::new();
        registry.register(TestTool);

        let params = CallToolParams {
            name: "test_tool".into(),
            arguments: Value::Null,
        };
        let envelope = registry.execute(params).await.unwrap();
        assert_eq!(envelope["success"], true);
        assert_eq!(envelope["result"], "pong");
        assert_eq!(envelope["message"], "Operation successful");

        let params = CallToolParams {
            name: "missing".into(),
            arguments: Value::Null,
        };
        assert!(registry.execute(params).await.is_err());
    }

    #[test]
    fn test_failure_envelope() {
        let envelope = failure("boom", "");
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"], "boom");
        assert_eq!(envelope["message"], "Operation failed");
        assert_eq!(envelope["timestamp"].as_str().unwrap().len(), 19);
    }
}
