//! The execution orchestrator — the heart of stepwise.
//!
//! A run follows a **render → generate → parse → act** cycle:
//!
//! 1. **Render** the system prompt, memory and any step feedback
//! 2. **Generate** with the configured provider, streamed or not
//! 3. **Parse** the text with the active line grammar, publishing nodes
//! 4. **Act**: dispatch the tool call and loop, or return the final answer
//!
//! Recoverable failures are fed back and retried inside the step until a
//! budget runs out; see [`run_context`] for the counters.

pub mod prompts;
pub mod react;
pub mod run_context;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use prompts::{PromptContext, PromptRenderer, PromptRole, TemplateSet};
pub use react::{ReactAgent, RunError, RunOptions, RunOutput};
pub use run_context::{ExecutionOptions, RunContext, RunSnapshot};
