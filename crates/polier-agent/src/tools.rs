//! Tool dispatch registry.
//!
//! Tools are data lookups with a declared input schema. The registry
//! validates the call shape and dispatches; execution timeouts are owned
//! by the completion loop, not by individual tools.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::{AgentError, Result};
use crate::provider::ToolSchema;

/// Cap on the stringified size of one tool result, to keep the next
/// round's prompt bounded.
pub const MAX_TOOL_RESULT_CHARS: usize = 12_000;
const TRUNCATION_MARKER: &str = "\n…(truncated)…";

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema for the tool's input object.
    fn input_schema(&self) -> Value;

    async fn invoke(&self, input: Value) -> Result<Value>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        let name = tool.name();
        self.by_name.insert(name, self.tools.len());
        self.tools.push(Arc::new(tool));
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations sent to the provider with every completion request.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    /// Validate and dispatch a named call. `input`, when present, must be
    /// a JSON object; a missing input dispatches as `{}`.
    pub async fn execute(&self, name: &str, input: Option<Value>) -> Result<Value> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AgentError::ToolNotFound("<empty>".to_string()));
        }
        let tool = self
            .by_name
            .get(name)
            .map(|&idx| Arc::clone(&self.tools[idx]))
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;

        let input = match input {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(value @ Value::Object(_)) => value,
            Some(other) => {
                return Err(AgentError::InvalidToolInput(format!(
                    "tool input must be an object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        tool.invoke(input).await
    }
}

/// Convert a tool's result into a stable string for the tool_result
/// block, with a hard size cap.
pub fn stringify_tool_result(result: &Value) -> String {
    let text = match result {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
    };

    if text.chars().count() <= MAX_TOOL_RESULT_CHARS {
        return text;
    }
    let mut capped: String = text.chars().take(MAX_TOOL_RESULT_CHARS).collect();
    capped.push_str(TRUNCATION_MARKER);
    capped
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echoes its input back."
        }

        fn input_schema(&self) -> Value {
            json!({ "type": "object", "properties": {}, "required": [] })
        }

        async fn invoke(&self, input: Value) -> Result<Value> {
            Ok(input)
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry
    }

    #[tokio::test]
    async fn unknown_tool_is_classified() {
        let err = registry()
            .execute("nonexistent_tool", Some(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolNotFound(_)));
        assert_eq!(err.code(), "unknown_tool");
    }

    #[tokio::test]
    async fn non_object_input_is_classified() {
        let err = registry()
            .execute("echo", Some(json!("not-an-object")))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidToolInput(_)));
        assert_eq!(err.code(), "invalid_tool_input");
    }

    #[tokio::test]
    async fn missing_input_dispatches_as_empty_object() {
        let result = registry().execute("echo", None).await.unwrap();
        assert_eq!(result, json!({}));
    }

    #[test]
    fn stringify_caps_long_results() {
        let long = "x".repeat(20_000);
        let capped = stringify_tool_result(&json!(long));
        assert!(capped.ends_with(TRUNCATION_MARKER));
        assert!(capped.chars().count() <= MAX_TOOL_RESULT_CHARS + TRUNCATION_MARKER.chars().count());
    }

    #[test]
    fn stringify_passes_short_strings_through() {
        assert_eq!(stringify_tool_result(&json!("12 pairs on hand")), "12 pairs on hand");
        assert_eq!(stringify_tool_result(&json!({ "n": 1 })), r#"{"n":1}"#);
    }

    #[test]
    fn schemas_cover_registered_tools() {
        let schemas = registry().schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "echo");
    }
}
