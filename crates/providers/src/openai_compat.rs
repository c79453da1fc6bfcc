//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, watsonx
//! gateways, and any endpoint exposing `/chat/completions`.
//!
//! Tools are described to the model in the system prompt and called through
//! the line grammar, so only plain chat completions are used here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stepwise_core::provider::*;
use stepwise_core::{AbortSignal, Emitter, Message, Role, TransportError};
use tracing::{debug, trace};

use crate::sse::SseMessage;
use crate::transport::{FetchRequest, RestClient, stream_error};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// An OpenAI-compatible LLM provider.
///
/// This handles the vast majority of LLM providers since most expose
/// an OpenAI-compatible `/v1/chat/completions` endpoint.
#[derive(Debug)]
pub struct OpenAiCompatProvider {
    name: String,
    client: RestClient,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl AsRef<str>,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = RestClient::new(base_url, request_timeout)?.with_bearer_auth(api_key);
        Ok(Self {
            name: name.into(),
            client,
        })
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl AsRef<str>) -> Result<Self, TransportError> {
        Self::new("openai", "https://api.openai.com/v1", api_key, DEFAULT_TIMEOUT)
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl AsRef<str>) -> Result<Self, TransportError> {
        Self::new(
            "openrouter",
            "https://openrouter.ai/api/v1",
            api_key,
            DEFAULT_TIMEOUT,
        )
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Result<Self, TransportError> {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
            DEFAULT_TIMEOUT,
        )
    }

    /// Report transport events (`start`, `message`, `done`, ...) to `emitter`.
    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.client = self.client.with_emitter(emitter);
        self
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                    // No native tool calls are made, so there is no call id to answer.
                    Role::Tool => "user".into(),
                },
                content: Some(m.content.clone()),
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }

        body
    }

    /// Turn one SSE message into at most one chunk.
    fn parse_stream_message(
        provider: &str,
        message: SseMessage,
    ) -> Option<Result<StreamChunk, TransportError>> {
        let data = message.data.trim();

        // "[DONE]" signals end of stream
        if data == "[DONE]" {
            return Some(Ok(StreamChunk {
                done: true,
                ..StreamChunk::default()
            }));
        }

        match serde_json::from_str::<StreamResponse>(data) {
            Ok(stream_resp) => {
                if stream_resp.error.is_some() {
                    return Some(Err(stream_error(data)));
                }

                let content = stream_resp
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .filter(|c| !c.is_empty());

                // Usage arrives in the final chunk when `include_usage` is set
                let usage = stream_resp.usage.map(|u| Usage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                });

                if content.is_none() && usage.is_none() {
                    return None;
                }
                Some(Ok(StreamChunk {
                    content,
                    done: usage.is_some(),
                    usage,
                }))
            }
            Err(e) => {
                trace!(
                    provider,
                    data = %data,
                    error = %e,
                    "Ignoring unparseable SSE chunk"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
        signal: &AbortSignal,
    ) -> Result<ProviderResponse, TransportError> {
        let body = Self::request_body(&request, false);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let value = self
            .client
            .fetch(
                "chat/completions",
                FetchRequest::post(body),
                signal,
                request.emitter.as_ref(),
            )
            .await?;

        let api_response: ApiResponse = serde_json::from_value(value)
            .map_err(|e| TransportError::Decode(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Decode("No choices in response".into()))?;

        let usage = api_response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ProviderResponse {
            message: Message::assistant(choice.message.content.unwrap_or_default()),
            usage,
            model: api_response.model,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        signal: &AbortSignal,
    ) -> Result<ChunkStream, TransportError> {
        let body = Self::request_body(&request, true);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let provider = self.name.clone();
        self.client
            .stream_with(
                "chat/completions",
                &body,
                signal,
                request.emitter.as_ref(),
                move |message| Self::parse_stream_message(&provider, message),
            )
            .await
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    /// Some gateways report failures in-band as a plain data chunk.
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
