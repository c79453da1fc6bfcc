//! Web search tool — deterministic offline results.
//!
//! A blank query finds nothing, which the dispatcher reports as a
//! no-result failure.

use async_trait::async_trait;
use serde::Serialize;
use stepwise_core::error::ToolError;
use stepwise_core::tool::{Tool, ToolOutput};
use stepwise_core::AbortSignal;

pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for information. Returns a list of relevant results with titles, URLs, and snippets."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "num_results": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 5,
                    "description": "Number of results to return (default 3)"
                }
            },
            "required": ["query"]
        })
    }

    async fn run(
        &self,
        input: serde_json::Value,
        _signal: &AbortSignal,
    ) -> Result<ToolOutput, ToolError> {
        let query = input["query"].as_str().unwrap_or_default().trim();
        let count = input["num_results"].as_u64().unwrap_or(3).clamp(1, 5) as usize;

        let results = if query.is_empty() {
            Vec::new()
        } else {
            mock_results(query, count)
        };
        let data = serde_json::to_value(&results)
            .map_err(|e| ToolError::failed(self.name(), e.to_string()))?;
        Ok(ToolOutput::json(data))
    }
}

#[derive(Debug, Clone, Serialize)]
struct SearchResult {
    title: String,
    url: String,
    snippet: String,
}

impl SearchResult {
    fn new(title: &str, url: &str, snippet: &str) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
        }
    }
}

fn mock_results(query: &str, count: usize) -> Vec<SearchResult> {
    let q = query.to_lowercase();

    // Context-aware results for a few common topics.
    let topics: [(&str, Vec<SearchResult>); 2] = [
        (
            "rust",
            vec![
                SearchResult::new(
                    "The Rust Programming Language",
                    "https://doc.rust-lang.org/book/",
                    "Rust is a systems programming language focused on safety, speed, and concurrency.",
                ),
                SearchResult::new(
                    "Rust by Example",
                    "https://doc.rust-lang.org/rust-by-example/",
                    "A collection of runnable examples that illustrate Rust concepts and standard library usage.",
                ),
                SearchResult::new(
                    "crates.io: Rust Package Registry",
                    "https://crates.io/",
                    "The Rust community's crate registry for sharing and discovering Rust libraries.",
                ),
            ],
        ),
        (
            "weather",
            vec![
                SearchResult::new(
                    "Weather Forecast - National Weather Service",
                    "https://weather.gov/",
                    "Current conditions and forecasts for locations across the United States.",
                ),
                SearchResult::new(
                    "OpenWeatherMap",
                    "https://openweathermap.org/",
                    "Free weather API providing current weather data and forecasts for any location.",
                ),
            ],
        ),
    ];

    if let Some((_, results)) = topics.iter().find(|(keyword, _)| q.contains(keyword)) {
        return results.iter().take(count).cloned().collect();
    }

    (1..=count)
        .map(|i| SearchResult {
            title: format!("Result {i} for: {query}"),
            url: format!("https://example.com/search?q={}&p={i}", query.replace(' ', "+")),
            snippet: format!("An offline search result for the query '{query}'."),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn search(input: serde_json::Value) -> ToolOutput {
        WebSearchTool.run(input, &AbortSignal::new()).await.unwrap()
    }

    #[tokio::test]
    async fn search_returns_results() {
        let output = search(serde_json::json!({"query": "rust programming"})).await;
        assert!(output.content.contains("Rust"));
        assert!(!output.is_empty());
    }

    #[tokio::test]
    async fn search_respects_num_results() {
        let output = search(serde_json::json!({"query": "test", "num_results": 2})).await;
        assert_eq!(output.data.unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn blank_query_finds_nothing() {
        let output = search(serde_json::json!({"query": "   "})).await;
        assert!(output.is_empty());
    }
}
