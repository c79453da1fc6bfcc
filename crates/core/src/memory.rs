//! Memory trait — the ordered, append-only conversation record of a run.
//!
//! A run works on its own copy seeded from the shared memory and renders
//! every prompt from that copy. Only when the run answers does it commit
//! its validated steps back in one batch: the user input, accepted assistant
//! output and tool results.

use async_trait::async_trait;

use crate::error::MemoryError;
use crate::message::Message;

/// The core Memory trait.
///
/// Implementations: unconstrained (keeps everything), sliding window.
#[async_trait]
pub trait Memory: Send + Sync {
    /// The memory name (e.g., "unconstrained", "sliding").
    fn name(&self) -> &str;

    /// Append one message at the end.
    async fn append(&self, message: Message) -> std::result::Result<(), MemoryError>;

    /// All retained messages, oldest first.
    async fn read_all(&self) -> std::result::Result<Vec<Message>, MemoryError>;

    /// Number of retained messages.
    async fn len(&self) -> std::result::Result<usize, MemoryError> {
        Ok(self.read_all().await?.len())
    }

    async fn is_empty(&self) -> std::result::Result<bool, MemoryError> {
        Ok(self.len().await? == 0)
    }

    /// Append `messages` in order as one step. Implementations that guard
    /// their storage with a lock hold it for the whole batch, so batches
    /// committed by concurrent runs never interleave.
    async fn append_many(&self, messages: Vec<Message>) -> std::result::Result<(), MemoryError> {
        for message in messages {
            self.append(message).await?;
        }
        Ok(())
    }
}
