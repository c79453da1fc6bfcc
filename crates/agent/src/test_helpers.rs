//! Shared test helpers for orchestrator tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use stepwise_core::{
    AbortSignal, ChunkStream, Message, Provider, ProviderRequest, ProviderResponse, StreamChunk,
    TransportError, Usage,
};
use tokio::sync::mpsc;

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The whole text; streamed in small chunks.
    Text(String),
    /// Fail to open the call.
    Fail(TransportError),
    /// Stream the text, then fail with `Interrupted`.
    Interrupted(String),
    /// Stream the text, then stay open until the consumer goes away.
    Hang(String),
}

/// A mock provider that plays back a sequence of scripted replies.
///
/// Each call takes the next reply. Panics if more calls are made than
/// replies provided.
pub struct ScriptedProvider {
    replies: Mutex<Vec<Reply>>,
    call_count: Mutex<usize>,
    requests: Mutex<Vec<ProviderRequest>>,
    torn_down: Arc<AtomicBool>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies),
            call_count: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
            torn_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Reply::Text(t.to_string())).collect())
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// True once a hanging stream saw its receiver dropped.
    pub fn torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: ProviderRequest) -> Reply {
        let mut count = self.call_count.lock().unwrap();
        let replies = self.replies.lock().unwrap();
        if *count >= replies.len() {
            panic!(
                "ScriptedProvider: no more replies (call #{}, have {})",
                *count,
                replies.len()
            );
        }
        let reply = replies[*count].clone();
        *count += 1;
        self.requests.lock().unwrap().push(request);
        reply
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: ProviderRequest,
        signal: &AbortSignal,
    ) -> Result<ProviderResponse, TransportError> {
        match self.next_reply(request) {
            Reply::Text(text) => Ok(text_response(&text)),
            Reply::Fail(e) => Err(e),
            Reply::Interrupted(_) => Err(TransportError::Interrupted("connection reset".into())),
            Reply::Hang(_) => {
                signal.cancelled().await;
                Err(TransportError::Cancelled(signal.reason()))
            }
        }
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        _signal: &AbortSignal,
    ) -> Result<ChunkStream, TransportError> {
        let (text, tail) = match self.next_reply(request) {
            Reply::Fail(e) => return Err(e),
            Reply::Text(text) => (text, Tail::Done),
            Reply::Interrupted(text) => (text, Tail::Interrupted),
            Reply::Hang(text) => (text, Tail::Hang),
        };

        let (tx, rx) = mpsc::channel(1);
        let torn_down = self.torn_down.clone();
        tokio::spawn(async move {
            for piece in chunks(&text, 5) {
                if tx.send(Ok(StreamChunk::text(piece))).await.is_err() {
                    return;
                }
            }
            match tail {
                Tail::Done => {
                    let _ = tx
                        .send(Ok(StreamChunk {
                            content: None,
                            done: true,
                            usage: Some(usage()),
                        }))
                        .await;
                }
                Tail::Interrupted => {
                    let _ = tx.send(Err(TransportError::Interrupted("connection reset".into()))).await;
                }
                Tail::Hang => {
                    tx.closed().await;
                    torn_down.store(true, Ordering::SeqCst);
                }
            }
        });
        Ok(rx)
    }
}

enum Tail {
    Done,
    Interrupted,
    Hang,
}

/// Split on char boundaries into pieces of at most `size` chars.
fn chunks(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

/// Create a simple text response.
pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(usage()),
        model: "mock-model".into(),
    }
}
