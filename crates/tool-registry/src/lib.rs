use std::collections::HashMap;
use std::sync::Arc;

use agent_core::{AgentError, ToolSchema};
use async_trait::async_trait;

pub mod market;
pub use market::market_tool_registry;

/// Hard ceiling on compressed tool output fed back into conversation
/// context. Raw time-series arrays never cross this boundary.
pub const MAX_COMPRESSED_CHARS: usize = 500;

/// Runs one tool and compresses its structured output into bounded text.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, args: &serde_json::Value) -> Result<serde_json::Value, AgentError>;
    fn compress(&self, result: &serde_json::Value) -> String;
}

struct RegisteredTool {
    schema: ToolSchema,
    executor: Arc<dyn ToolExecutor>,
}

/// Catalog of callable analysis functions exposed to the reasoning loop.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, schema: ToolSchema, executor: Arc<dyn ToolExecutor>) {
        self.tools.insert(
            schema.name.clone(),
            RegisteredTool { schema, executor },
        );
    }

    /// Schemas advertised to the model on every turn.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> =
            self.tools.values().map(|t| t.schema.clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Validate arguments, run the executor, and return the compressed
    /// textual result. Validation failures never reach the executor.
    pub async fn invoke(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<String, AgentError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;

        validate_args(name, &tool.schema.parameters, args)?;

        let started = std::time::Instant::now();
        let result = tool.executor.execute(args).await?;
        let compressed = truncate(tool.executor.compress(&result), MAX_COMPRESSED_CHARS);
        tracing::debug!(
            "Tool {} completed in {:?} ({} chars compressed)",
            name,
            started.elapsed(),
            compressed.len()
        );
        Ok(compressed)
    }
}

/// Check `args` against the declared JSON schema: required properties must
/// be present, typed properties must match, enum properties must be members.
fn validate_args(
    tool: &str,
    schema: &serde_json::Value,
    args: &serde_json::Value,
) -> Result<(), AgentError> {
    let invalid = |reason: String| AgentError::InvalidToolArguments {
        tool: tool.to_string(),
        reason,
    };

    let args_obj = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;

    let properties = schema
        .get("properties")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !args_obj.contains_key(name) {
                return Err(invalid(format!("missing required property '{}'", name)));
            }
        }
    }

    for (name, value) in args_obj {
        let Some(prop) = properties.get(name) else {
            tracing::debug!("Tool {}: ignoring undeclared argument '{}'", tool, name);
            continue;
        };

        if let Some(expected) = prop.get("type").and_then(|v| v.as_str()) {
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !matches {
                return Err(invalid(format!(
                    "property '{}' must be of type {}",
                    name, expected
                )));
            }
        }

        if let Some(allowed) = prop.get("enum").and_then(|v| v.as_array()) {
            if !allowed.contains(value) {
                return Err(invalid(format!(
                    "property '{}' must be one of {}",
                    name,
                    serde_json::Value::Array(allowed.clone())
                )));
            }
        }
    }

    Ok(())
}

fn truncate(mut text: String, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        text = text.chars().take(max_chars.saturating_sub(1)).collect();
        text.push('…');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubExecutor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolExecutor for StubExecutor {
        async fn execute(
            &self,
            _args: &serde_json::Value,
        ) -> Result<serde_json::Value, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"value": 42}))
        }

        fn compress(&self, result: &serde_json::Value) -> String {
            format!("value is {}", result["value"])
        }
    }

    fn registry_with_stub(calls: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolSchema {
                name: "get_rsi".to_string(),
                description: "Relative strength index".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "symbol": { "type": "string" },
                        "period": { "type": "integer" },
                        "interval": { "type": "string", "enum": ["daily", "weekly"] }
                    },
                    "required": ["symbol"]
                }),
            },
            Arc::new(StubExecutor { calls }),
        );
        registry
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let registry = registry_with_stub(Arc::new(AtomicUsize::new(0)));
        let err = registry
            .invoke("get_bollinger", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownTool(name) if name == "get_bollinger"));
    }

    #[tokio::test]
    async fn missing_required_argument_never_reaches_executor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_stub(calls.clone());

        let err = registry
            .invoke("get_rsi", &serde_json::json!({"period": 14}))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::InvalidToolArguments { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_type_and_enum_violations_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_stub(calls.clone());

        let err = registry
            .invoke(
                "get_rsi",
                &serde_json::json!({"symbol": "AAPL", "period": "fourteen"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidToolArguments { .. }));

        let err = registry
            .invoke(
                "get_rsi",
                &serde_json::json!({"symbol": "AAPL", "interval": "hourly"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidToolArguments { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_invocation_returns_compressed_text() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_stub(calls.clone());

        let text = registry
            .invoke("get_rsi", &serde_json::json!({"symbol": "AAPL", "period": 14}))
            .await
            .unwrap();

        assert_eq!(text, "value is 42");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn truncation_bounds_output() {
        let long = "x".repeat(2 * MAX_COMPRESSED_CHARS);
        let out = truncate(long, MAX_COMPRESSED_CHARS);
        assert!(out.chars().count() <= MAX_COMPRESSED_CHARS);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut registry = registry_with_stub(Arc::new(AtomicUsize::new(0)));
        registry.register(
            ToolSchema {
                name: "get_macd".to_string(),
                description: "MACD".to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            },
            Arc::new(StubExecutor {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        );
        let names: Vec<String> = registry.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["get_macd", "get_rsi"]);
    }
}
