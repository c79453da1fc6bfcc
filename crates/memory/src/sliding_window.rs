//! Sliding-window memory: only the most recent `window` messages are kept.

use std::collections::VecDeque;

use async_trait::async_trait;
use stepwise_core::error::MemoryError;
use stepwise_core::{Memory, Message};
use tokio::sync::RwLock;
use tracing::trace;

#[derive(Debug)]
pub struct SlidingWindowMemory {
    window: usize,
    messages: RwLock<VecDeque<Message>>,
}

impl SlidingWindowMemory {
    /// A window of zero is treated as one.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            messages: RwLock::new(VecDeque::with_capacity(window)),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

#[async_trait]
impl Memory for SlidingWindowMemory {
    fn name(&self) -> &str {
        "sliding"
    }

    async fn append(&self, message: Message) -> Result<(), MemoryError> {
        self.append_many(vec![message]).await
    }

    async fn append_many(&self, batch: Vec<Message>) -> Result<(), MemoryError> {
        let mut messages = self.messages.write().await;
        messages.extend(batch);
        while messages.len() > self.window {
            if let Some(evicted) = messages.pop_front() {
                trace!(id = %evicted.id, window = self.window, "Evicted message from sliding memory");
            }
        }
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Message>, MemoryError> {
        Ok(self.messages.read().await.iter().cloned().collect())
    }

    async fn len(&self) -> Result<usize, MemoryError> {
        Ok(self.messages.read().await.len())
    }

}
