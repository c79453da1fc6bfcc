//! Unconstrained memory: keeps every message for the life of the process.

use async_trait::async_trait;
use stepwise_core::error::MemoryError;
use stepwise_core::{Memory, Message};
use tokio::sync::RwLock;

/// Stores every appended message in a Vec.
#[derive(Debug, Default)]
pub struct UnconstrainedMemory {
    messages: RwLock<Vec<Message>>,
}

impl UnconstrainedMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Memory for UnconstrainedMemory {
    fn name(&self) -> &str {
        "unconstrained"
    }

    async fn append(&self, message: Message) -> Result<(), MemoryError> {
        self.messages.write().await.push(message);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Message>, MemoryError> {
        Ok(self.messages.read().await.clone())
    }

    async fn len(&self) -> Result<usize, MemoryError> {
        Ok(self.messages.read().await.len())
    }

    async fn append_many(&self, messages: Vec<Message>) -> Result<(), MemoryError> {
        self.messages.write().await.extend(messages);
        Ok(())
    }
}
