//! Cooperative cancellation for runs, tool calls and network streams.
//!
//! An [`AbortSignal`] is a cloneable handle over a
//! [`CancellationToken`] plus the reason it was aborted. Every suspension
//! point of a run polls or races the same signal.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const DEFAULT_REASON: &str = "Action has been aborted";

#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// A signal that aborts itself once `duration` has elapsed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_timeout(duration: Duration) -> Self {
        let signal = Self::new();
        let timer = signal.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    timer.abort(format!(
                        "Operation timed out after {} ms",
                        duration.as_millis()
                    ));
                }
                _ = timer.token.cancelled() => {}
            }
        });
        signal
    }

    /// Abort with the given reason. The first reason wins.
    pub fn abort(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| DEFAULT_REASON.to_string())
    }

    /// Resolves once the signal is aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// `Err(Error::Cancelled)` once aborted.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(self.to_error())
        } else {
            Ok(())
        }
    }

    /// Drive `fut` to completion unless the signal fires first.
    pub async fn race<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.to_error()),
            out = fut => Ok(out),
        }
    }

    pub fn to_error(&self) -> Error {
        Error::Cancelled {
            reason: self.reason(),
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}
