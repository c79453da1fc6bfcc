//! LLM provider implementations for stepwise.
//!
//! All providers implement the `stepwise_core::Provider` trait. The
//! [`transport`] module bridges HTTP and server-sent events into the
//! cancellable channels those providers return, and [`retry`] supplies the
//! backoff used by callers when a transport failure is retryable.

pub mod openai_compat;
pub mod retry;
pub mod sse;
pub mod transport;

pub use openai_compat::OpenAiCompatProvider;
pub use retry::{RetryPolicy, with_backoff};
pub use sse::{SseDecoder, SseMessage};
pub use transport::{FetchRequest, RestClient};
