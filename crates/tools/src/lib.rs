//! Tool dispatch and built-in tools for stepwise.
//!
//! The [`ToolDispatcher`] sits between the orchestrator and the registry.
//! The built-in tools work offline so a run can be driven end to end
//! without any API besides the model.

pub mod dispatcher;
pub mod weather_lookup;
pub mod web_search;

pub use dispatcher::ToolDispatcher;

use stepwise_core::tool::ToolRegistry;

/// Create a registry with all built-in tools.
pub fn default_registry() -> ToolRegistry {
    ToolRegistry::new()
        .with(Box::new(weather_lookup::WeatherLookupTool))
        .with(Box::new(web_search::WebSearchTool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::AbortSignal;

    #[test]
    fn default_registry_has_builtin_tools() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec!["weather_lookup", "web_search"]);
    }

    #[tokio::test]
    async fn blank_search_is_a_no_result_failure() {
        let dispatcher = ToolDispatcher::new(default_registry());
        let err = dispatcher
            .dispatch(
                &stepwise_core::ToolCallRequest {
                    name: "web_search".into(),
                    raw_input: r#"{"query": ""}"#.into(),
                },
                &AbortSignal::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_no_result");
    }
}
