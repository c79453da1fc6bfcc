//! Per-run counters and the budgets that bound them.
//!
//! A [`RunContext`] belongs to exactly one run. The iteration counter moves
//! only when a new step begins; the per-step retry counter resets with it,
//! while the run-wide retry counter only ever grows.
//!
//! Each context also owns the run's working memory: a private copy of the
//! shared memory that the run appends to and renders prompts from. Nothing
//! a run writes is visible to another run until it is committed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stepwise_config::ExecutionConfig;
use stepwise_core::{AbortSignal, BudgetKind, Error, Memory, Message, Result};
use stepwise_grammar::ParsedNode;
use stepwise_memory::UnconstrainedMemory;
use tracing::debug;

/// Retry and iteration limits for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub max_retries_per_step: u32,
    pub total_max_retries: u32,
    pub max_iterations: u32,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_retries_per_step: 3,
            total_max_retries: 10,
            max_iterations: 20,
        }
    }
}

impl From<&ExecutionConfig> for ExecutionOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_retries_per_step: config.max_retries_per_step,
            total_max_retries: config.total_max_retries,
            max_iterations: config.max_iterations,
        }
    }
}

/// Where a run stood when it ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub iterations: u32,
    pub step_retries: u32,
    pub total_retries: u32,
    /// Nodes of accepted steps, followed by whatever the last attempt completed.
    pub nodes: Vec<ParsedNode>,
}

pub struct RunContext {
    options: ExecutionOptions,
    signal: AbortSignal,
    memory: Arc<dyn Memory>,
    /// Messages at the front of `memory` that came from the shared memory.
    seeded: usize,
    iteration: u32,
    step_retries: u32,
    total_retries: u32,
    accepted: Vec<ParsedNode>,
    pending: Vec<ParsedNode>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("options", &self.options)
            .field("iteration", &self.iteration)
            .field("step_retries", &self.step_retries)
            .field("total_retries", &self.total_retries)
            .field("seeded", &self.seeded)
            .finish()
    }
}

impl RunContext {
    pub fn new(options: ExecutionOptions, signal: AbortSignal) -> Self {
        Self {
            options,
            signal,
            memory: Arc::new(UnconstrainedMemory::new()),
            seeded: 0,
            iteration: 0,
            step_retries: 0,
            total_retries: 0,
            accepted: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Copy `shared` into the working memory. Call before the run appends
    /// anything; copied messages are never committed again.
    pub async fn seed(&mut self, shared: &dyn Memory) -> Result<()> {
        self.memory.append_many(shared.read_all().await?).await?;
        self.seeded = self.memory.len().await?;
        Ok(())
    }

    /// The run's working memory.
    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    /// Messages this run appended, oldest first.
    pub async fn new_messages(&self) -> Result<Vec<Message>> {
        let mut messages = self.memory.read_all().await?;
        Ok(messages.split_off(self.seeded.min(messages.len())))
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn step_retries(&self) -> u32 {
        self.step_retries
    }

    pub fn total_retries(&self) -> u32 {
        self.total_retries
    }

    /// Nodes of every accepted step so far.
    pub fn nodes(&self) -> &[ParsedNode] {
        &self.accepted
    }

    /// Fails with [`Error::Cancelled`] once the run's signal has fired.
    pub fn check(&self) -> Result<()> {
        self.signal.check()
    }

    /// Start the next step and return its 1-based number.
    ///
    /// Fails when the signal has fired or when another step would exceed
    /// `max_iterations`.
    pub fn begin_iteration(&mut self) -> Result<u32> {
        self.check()?;
        if self.iteration >= self.options.max_iterations {
            return Err(Error::BudgetExceeded {
                kind: BudgetKind::Iterations,
                limit: self.options.max_iterations,
            });
        }
        self.iteration += 1;
        self.step_retries = 0;
        self.pending.clear();
        debug!(iteration = self.iteration, "Iteration started");
        Ok(self.iteration)
    }

    /// Count one recoverable failure against both budgets.
    ///
    /// The counters are bumped even when the call fails, so a snapshot taken
    /// afterwards shows the failure that broke the budget.
    pub fn record_retry(&mut self) -> Result<()> {
        self.step_retries += 1;
        self.total_retries += 1;

        if self.step_retries > self.options.max_retries_per_step {
            return Err(Error::BudgetExceeded {
                kind: BudgetKind::PerStep,
                limit: self.options.max_retries_per_step,
            });
        }
        if self.total_retries > self.options.total_max_retries {
            return Err(Error::BudgetExceeded {
                kind: BudgetKind::Total,
                limit: self.options.total_max_retries,
            });
        }
        Ok(())
    }

    /// Remember what the current attempt produced so far.
    pub fn set_pending(&mut self, nodes: Vec<ParsedNode>) {
        self.pending = nodes;
    }

    /// Commit the current step's nodes.
    pub fn accept(&mut self, nodes: Vec<ParsedNode>) {
        self.accepted.extend(nodes);
        self.pending.clear();
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            iterations: self.iteration,
            step_retries: self.step_retries,
            total_retries: self.total_retries,
            nodes: self
                .accepted
                .iter()
                .chain(self.pending.iter())
                .cloned()
                .collect(),
        }
    }
}
