//! Tool dispatcher: resolve a name, validate the input, run the tool and
//! normalize what comes back.
//!
//! Every failure a model can fix by rewriting its output is reported as a
//! [`ToolError`] variant so the orchestrator can turn it into feedback:
//! an unknown name, input that is not JSON or breaks the schema, an error
//! raised by the tool, or an empty result.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::Value;
use stepwise_core::{
    AbortSignal, Error, Result, Tool, ToolCallRequest, ToolCallResult, ToolDefinition, ToolError,
    ToolRegistry,
};
use tracing::{debug, info, warn};

type CompiledSchema = std::result::Result<jsonschema::Validator, String>;

pub struct ToolDispatcher {
    registry: ToolRegistry,
    /// Compiled on first use of each tool, then reused.
    validators: HashMap<String, OnceLock<CompiledSchema>>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        let validators = registry
            .names()
            .into_iter()
            .map(|name| (name.to_string(), OnceLock::new()))
            .collect();
        Self {
            registry,
            validators,
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Find a tool by name. The error lists every available tool.
    pub fn resolve(&self, name: &str) -> std::result::Result<&dyn Tool, ToolError> {
        self.registry.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
            available: self.registry.names().into_iter().map(String::from).collect(),
        })
    }

    /// [`resolve`](Self::resolve) then [`invoke`](Self::invoke).
    pub async fn dispatch(
        &self,
        request: &ToolCallRequest,
        signal: &AbortSignal,
    ) -> Result<ToolCallResult> {
        let tool = self.resolve(&request.name)?;
        self.invoke(tool, &request.raw_input, signal).await
    }

    /// Parse and validate `raw_input`, then run `tool`.
    ///
    /// Blank input is read as `{}`. The signal is checked before the tool
    /// starts and raced against it while it runs.
    pub async fn invoke(
        &self,
        tool: &dyn Tool,
        raw_input: &str,
        signal: &AbortSignal,
    ) -> Result<ToolCallResult> {
        let name = tool.name();
        let input = self.parse_input(tool, raw_input)?;

        signal.check()?;
        debug!(tool = name, input = %input, "Invoking tool");

        let output = match signal.race(tool.run(input.clone(), signal)).await? {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool failed");
                return Err(wrap_tool_failure(name, e).into());
            }
        };

        if output.is_empty() {
            info!(tool = name, "Tool returned no result");
            return Err(ToolError::NoResult {
                tool_name: name.to_string(),
            }
            .into());
        }

        info!(tool = name, bytes = output.content.len(), "Tool succeeded");
        Ok(ToolCallResult {
            name: name.to_string(),
            input,
            output,
        })
    }

    fn parse_input(&self, tool: &dyn Tool, raw_input: &str) -> Result<Value> {
        let name = tool.name();
        let raw = raw_input.trim();
        let input = if raw.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(raw).map_err(|e| ToolError::InvalidInput {
                tool_name: name.to_string(),
                reason: format!("input is not valid JSON: {e}"),
            })?
        };

        match self.validators.get(name) {
            Some(cell) => {
                let compiled = cell.get_or_init(|| compile(&tool.input_schema()));
                validate(name, compiled, &input)?
            }
            // A tool that was never registered here; compile without caching.
            None => validate(name, &compile(&tool.input_schema()), &input)?,
        }
        Ok(input)
    }
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("tools", &self.registry.names())
            .finish()
    }
}

fn compile(schema: &Value) -> CompiledSchema {
    jsonschema::Validator::new(schema).map_err(|e| e.to_string())
}

fn validate(name: &str, compiled: &CompiledSchema, input: &Value) -> Result<()> {
    let validator = compiled
        .as_ref()
        .map_err(|e| Error::Internal(format!("tool {name} has an invalid input schema: {e}")))?;
    if validator.is_valid(input) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(input).map(|e| e.to_string()).collect();
    Err(ToolError::InvalidInput {
        tool_name: name.to_string(),
        reason: errors.join("; "),
    }
    .into())
}

/// A tool may report bad input or an empty result itself; anything else it
/// raises is an execution failure.
fn wrap_tool_failure(name: &str, error: ToolError) -> ToolError {
    match error {
        ToolError::ExecutionFailed { .. }
        | ToolError::InvalidInput { .. }
        | ToolError::NoResult { .. } => error,
        other => ToolError::ExecutionFailed {
            tool_name: name.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use stepwise_core::ToolOutput;

    /// Scripted tool: echoes `city`, fails on "Atlantis", returns nothing
    /// for "Nowhere" and hangs for "Slowtown".
    struct Weather {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Weather {
        fn name(&self) -> &str {
            "Weather"
        }
        fn description(&self) -> &str {
            "Current weather for a city"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            })
        }
        async fn run(
            &self,
            input: Value,
            _signal: &AbortSignal,
        ) -> std::result::Result<ToolOutput, ToolError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match input["city"].as_str().unwrap_or_default() {
                "Atlantis" => Err(ToolError::failed("Weather", "city is underwater")),
                "Nowhere" => Ok(ToolOutput::text("   ")),
                "Slowtown" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ToolOutput::text("late"))
                }
                city => Ok(ToolOutput::text(format!("{city}: 18C"))),
            }
        }
    }

    struct Search;

    #[async_trait]
    impl Tool for Search {
        fn name(&self) -> &str {
            "Search"
        }
        fn description(&self) -> &str {
            "Search"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({ "type": "object" })
        }
        async fn run(
            &self,
            _input: Value,
            _signal: &AbortSignal,
        ) -> std::result::Result<ToolOutput, ToolError> {
            Err(ToolError::NoResult {
                tool_name: "Search".into(),
            })
        }
    }

    fn dispatcher() -> (ToolDispatcher, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new()
            .with(Box::new(Weather { runs: runs.clone() }))
            .with(Box::new(Search));
        (ToolDispatcher::new(registry), runs)
    }

    fn call(name: &str, raw_input: &str) -> ToolCallRequest {
        ToolCallRequest {
            name: name.into(),
            raw_input: raw_input.into(),
        }
    }

    #[tokio::test]
    async fn dispatches_valid_call() {
        let (dispatcher, runs) = dispatcher();
        let result = dispatcher
            .dispatch(&call("Weather", r#"{"city":"Paris"}"#), &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(result.name, "Weather");
        assert_eq!(result.input["city"], "Paris");
        assert_eq!(result.output.content, "Paris: 18C");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_tool_lists_available() {
        let (dispatcher, _) = dispatcher();
        let err = dispatcher.resolve("Unknown").err().unwrap();
        match err {
            ToolError::NotFound { name, available } => {
                assert_eq!(name, "Unknown");
                assert_eq!(available, vec!["Weather".to_string(), "Search".to_string()]);
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_json_and_schema_are_input_errors() {
        let (dispatcher, runs) = dispatcher();
        let signal = AbortSignal::new();

        let err = dispatcher
            .dispatch(&call("Weather", "{city: Paris"), &signal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_input");
        assert!(err.to_string().contains("not valid JSON"));

        let err = dispatcher
            .dispatch(&call("Weather", r#"{"city": 42}"#), &signal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_input");

        let err = dispatcher.dispatch(&call("Weather", ""), &signal).await.unwrap_err();
        assert_eq!(err.kind(), "tool_input");
        assert!(err.to_string().contains("city"));

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_input_reads_as_empty_object() {
        let (dispatcher, _) = dispatcher();
        let err = dispatcher
            .dispatch(&call("Search", "  "), &AbortSignal::new())
            .await
            .unwrap_err();
        // The schema accepted `{}`; the failure comes from the tool itself.
        assert_eq!(err.kind(), "tool_no_result");
    }

    #[tokio::test]
    async fn tool_failures_and_empty_output_are_distinct() {
        let (dispatcher, _) = dispatcher();
        let signal = AbortSignal::new();

        let err = dispatcher
            .dispatch(&call("Weather", r#"{"city":"Atlantis"}"#), &signal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_execution");
        assert!(err.to_string().contains("underwater"));

        let err = dispatcher
            .dispatch(&call("Weather", r#"{"city":"Nowhere"}"#), &signal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_no_result");
        assert!(err.is_step_recoverable());
    }

    #[tokio::test]
    async fn aborted_signal_prevents_invocation() {
        let (dispatcher, runs) = dispatcher();
        let signal = AbortSignal::new();
        signal.abort("deadline");
        let err = dispatcher
            .dispatch(&call("Weather", r#"{"city":"Paris"}"#), &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { reason } if reason == "deadline"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_interrupts_running_tool() {
        let (dispatcher, _) = dispatcher();
        let signal = AbortSignal::with_timeout(Duration::from_secs(5));
        let err = dispatcher
            .dispatch(&call("Weather", r#"{"city":"Slowtown"}"#), &signal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert!(err.to_string().contains("timed out after 5000 ms"));
    }

    #[test]
    fn validator_is_compiled_once() {
        let (dispatcher, _) = dispatcher();
        let tool = dispatcher.resolve("Weather").unwrap();
        assert!(dispatcher.validators["Weather"].get().is_none());
        dispatcher.parse_input(tool, r#"{"city":"Oslo"}"#).unwrap();
        let first = dispatcher.validators["Weather"].get().map(|v| v as *const _);
        dispatcher.parse_input(tool, r#"{"city":"Rome"}"#).unwrap();
        let second = dispatcher.validators["Weather"].get().map(|v| v as *const _);
        assert!(first.is_some());
        assert_eq!(first, second);
    }
}
