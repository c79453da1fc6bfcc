//! ReAct orchestrator — think, call a tool, observe, repeat.
//!
//! One [`ReactAgent::run`] drives the loop until the model writes a final
//! answer or the run is aborted:
//!
//! 1. **Render** the system prompt, the conversation in memory and any
//!    corrective feedback for the current step.
//! 2. **Call the model**, streamed or not, feeding its text through the
//!    line-grammar parser and publishing every node as it forms.
//! 3. **Dispatch** a completed tool call, or **return** the final answer.
//!
//! Grammar violations and tool failures are fed back to the model and
//! retried within the step. Budgets, cancellation and non-retryable
//! transport failures end the run with a [`RunError`] that carries the
//! last known state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stepwise_core::{
    AbortSignal, Delivery, Emitter, Error, Event, EventKind, EventPayload, Memory, Message,
    Provider, ProviderRequest, Result, Role, SchemaError, SubscriptionId, ToolCallRequest,
    ToolDefinition, ToolError, TransportError,
};
use stepwise_grammar::{Grammar, LineParser, ParseEvent, ParsedNode, keys};
use stepwise_providers::{RetryPolicy, with_backoff};
use stepwise_tools::ToolDispatcher;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::prompts::{PromptContext, PromptRenderer, PromptRole, TemplateSet};
use crate::run_context::{ExecutionOptions, RunContext, RunSnapshot};

pub struct ReactAgent {
    /// LLM provider.
    provider: Arc<dyn Provider>,
    /// Model name.
    model: String,
    /// Resolves and runs tool calls.
    dispatcher: Arc<ToolDispatcher>,
    /// Shared conversation. Runs work on a copy and commit here only when
    /// they answer.
    memory: Arc<dyn Memory>,
    /// Line grammar the model answers in.
    grammar: Arc<Grammar>,
    /// Shared pipeline; each run publishes on its own child scope.
    emitter: Emitter,
    prompts: Arc<dyn PromptRenderer>,
    temperature: f32,
    max_tokens: Option<u32>,
    streaming: bool,
    execution: ExecutionOptions,
    /// Backoff for opening a model call.
    retry_policy: RetryPolicy,
    instructions: Option<String>,
}

/// Per-run overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub execution: Option<ExecutionOptions>,
    /// Deadline or external abort; a fresh signal when absent.
    pub signal: Option<AbortSignal>,
    /// Parent of the run scope; the agent's emitter when absent.
    pub emitter: Option<Emitter>,
}

impl RunOptions {
    pub fn with_execution(mut self, execution: ExecutionOptions) -> Self {
        self.execution = Some(execution);
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Publish the run under `emitter`, so a subscriber there sees this run
    /// and its transport calls only.
    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }
}

/// The result of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub answer: String,
    pub iterations: u32,
    pub total_retries: u32,
    /// Every accepted node, tool outputs included.
    pub nodes: Vec<ParsedNode>,
}

/// A failed run: the fatal error plus where the run stood.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunError {
    #[source]
    pub error: Error,
    pub state: RunSnapshot,
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

/// What an accepted attempt led to.
enum Outcome {
    Answer(String),
    /// A tool ran and its output is in the run's memory.
    Observed,
}

/// Why an attempt was not accepted.
enum Rejection {
    /// Feed back to the model and try the step again.
    Retry { error: Error, raw: String },
    /// End the run.
    Abort(Error),
}

impl Rejection {
    fn classify(error: Error, raw: &str) -> Self {
        if error.is_step_recoverable() {
            Rejection::Retry {
                error,
                raw: raw.to_string(),
            }
        } else {
            Rejection::Abort(error)
        }
    }
}

impl From<Error> for Rejection {
    fn from(error: Error) -> Self {
        Rejection::Abort(error)
    }
}

impl From<SchemaError> for Rejection {
    fn from(error: SchemaError) -> Self {
        let raw = error.raw.clone();
        Rejection::Retry {
            error: error.into(),
            raw,
        }
    }
}

impl ReactAgent {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        dispatcher: Arc<ToolDispatcher>,
        memory: Arc<dyn Memory>,
        grammar: Arc<Grammar>,
        emitter: Emitter,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            dispatcher,
            memory,
            grammar,
            emitter,
            prompts: Arc::new(TemplateSet::new()),
            temperature: 0.0,
            max_tokens: None,
            streaming: false,
            execution: ExecutionOptions::default(),
            retry_policy: RetryPolicy::default(),
            instructions: None,
        }
    }

    /// Replace the prompt templates.
    pub fn with_prompts(mut self, prompts: Arc<dyn PromptRenderer>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the max tokens per model response.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Stream model output instead of waiting for the whole response.
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    /// Default budgets for runs that do not override them.
    pub fn with_execution(mut self, execution: ExecutionOptions) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Extra instructions appended to the system prompt.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// Answer `prompt`.
    ///
    /// Events go to a fresh `run-<uuid>` scope under the agent's emitter, or
    /// under [`RunOptions::emitter`], and always end with `done`. The run's
    /// messages reach the agent's memory only if it answers.
    pub async fn run(
        &self,
        prompt: &str,
        options: RunOptions,
    ) -> std::result::Result<RunOutput, RunError> {
        let execution = options.execution.unwrap_or(self.execution);
        let mut ctx = RunContext::new(execution, options.signal.unwrap_or_default());
        let run_id = Uuid::new_v4();
        let emitter = options
            .emitter
            .as_ref()
            .unwrap_or(&self.emitter)
            .child(format!("run-{run_id}"));
        let recorder = self.record_tool_outputs(&emitter, ctx.memory().clone());

        info!(
            run = %run_id,
            provider = self.provider.name(),
            model = %self.model,
            max_iterations = execution.max_iterations,
            streaming = self.streaming,
            "Run starting"
        );

        let outcome = self.run_loop(prompt, &mut ctx, &emitter).await;
        emitter.off(recorder);
        let outcome = match outcome {
            Ok(answer) => self.commit(&ctx).await.map(|()| answer),
            Err(error) => Err(error),
        };

        match outcome {
            Ok(answer) => {
                info!(
                    run = %run_id,
                    iterations = ctx.iteration(),
                    total_retries = ctx.total_retries(),
                    "Run finished"
                );
                notify(
                    &emitter,
                    EventKind::Success,
                    EventPayload::Answer {
                        text: answer.clone(),
                    },
                    true,
                )
                .await;
                notify(&emitter, EventKind::Done, EventPayload::Empty, true).await;
                Ok(RunOutput {
                    answer,
                    iterations: ctx.iteration(),
                    total_retries: ctx.total_retries(),
                    nodes: ctx.nodes().to_vec(),
                })
            }
            Err(error) => {
                warn!(
                    run = %run_id,
                    kind = error.kind(),
                    iterations = ctx.iteration(),
                    error = %error,
                    "Run failed"
                );
                notify(&emitter, EventKind::Error, failure(&error), false).await;
                notify(&emitter, EventKind::Done, EventPayload::Empty, false).await;
                Err(RunError {
                    error,
                    state: ctx.snapshot(),
                })
            }
        }
    }

    /// Blocking subscriber that writes each `tool_output` update to the run's
    /// memory, so the result is stored before the next prompt renders.
    fn record_tool_outputs(&self, emitter: &Emitter, memory: Arc<dyn Memory>) -> SubscriptionId {
        emitter.on(
            EventKind::Update,
            Delivery::Blocking,
            move |event: Arc<Event>| {
                let memory = memory.clone();
                async move {
                    let EventPayload::Node {
                        key,
                        value,
                        tool_name,
                        ..
                    } = &event.payload
                    else {
                        return Ok::<(), Error>(());
                    };
                    if key != keys::TOOL_OUTPUT {
                        return Ok(());
                    }
                    let mut message = Message::tool(tool_name.clone().unwrap_or_default(), value);
                    if !event.success {
                        message = message.as_error();
                    }
                    memory.append(message).await.map_err(Error::from)
                }
            },
        )
    }

    async fn run_loop(&self, prompt: &str, ctx: &mut RunContext, emitter: &Emitter) -> Result<String> {
        let tools = self.dispatcher.definitions();
        let base = self.prompt_context(&tools);
        let system = self.prompts.render(PromptRole::System, &base);
        let user = if prompt.trim().is_empty() {
            self.prompts.render(PromptRole::UserEmpty, &base)
        } else {
            self.prompts.render(PromptRole::User, &base.clone().with_input(prompt))
        };
        ctx.seed(self.memory.as_ref()).await?;
        ctx.memory().append(Message::user(user)).await?;

        loop {
            let iteration = ctx.begin_iteration()?;
            // Feedback for this step only; never written to memory.
            let mut scratch: Vec<Message> = Vec::new();

            loop {
                ctx.check()?;
                emitter
                    .emit(EventKind::Start, EventPayload::Iteration { iteration }, true)
                    .await?;

                match self.attempt(&system, &scratch, ctx, emitter).await {
                    Ok(Outcome::Answer(answer)) => return Ok(answer),
                    Ok(Outcome::Observed) => break,
                    Err(Rejection::Abort(error)) => return Err(error),
                    Err(Rejection::Retry { error, raw }) => {
                        self.recover(error, raw, &tools, ctx, emitter, &mut scratch)
                            .await?;
                    }
                }
            }
        }
    }

    /// One model call and whatever it leads to.
    async fn attempt(
        &self,
        system: &str,
        scratch: &[Message],
        ctx: &mut RunContext,
        emitter: &Emitter,
    ) -> std::result::Result<Outcome, Rejection> {
        let memory = ctx.memory().clone();
        let messages = self.messages(system, scratch, memory.as_ref()).await?;
        let mut parser = LineParser::new(&self.grammar);
        let generated = self.generate(messages, &mut parser, ctx.signal(), emitter).await;
        ctx.set_pending(parser.state().completed);
        generated?;

        let nodes = parser.into_state().completed;
        let assistant = self.prompts.render(
            PromptRole::Assistant,
            &PromptContext::new(&self.grammar, &[]).with_nodes(&nodes),
        );

        let Some(last) = nodes.last() else {
            return Err(SchemaError::new("the output contained no instruction lines", "").into());
        };
        match last.key.as_str() {
            keys::FINAL_ANSWER => {
                let answer = last.value.clone();
                memory.append(Message::assistant(assistant)).await.map_err(Error::from)?;
                ctx.accept(nodes);
                Ok(Outcome::Answer(answer))
            }
            keys::TOOL_INPUT => {
                let request = ToolCallRequest {
                    name: tool_name(&nodes).to_string(),
                    raw_input: last.value.clone(),
                };
                ctx.check()?;
                debug!(tool = %request.name, "Dispatching tool call");

                let result = self
                    .dispatcher
                    .dispatch(&request, ctx.signal())
                    .await
                    .map_err(|e| Rejection::classify(e, &assistant))?;

                memory.append(Message::assistant(assistant)).await.map_err(Error::from)?;
                let output = result.output.content;
                emitter
                    .emit(
                        EventKind::Update,
                        EventPayload::Node {
                            key: keys::TOOL_OUTPUT.to_string(),
                            value: output.clone(),
                            delta: None,
                            tool_name: Some(result.name),
                        },
                        true,
                    )
                    .await?;

                let mut nodes = nodes;
                nodes.push(ParsedNode {
                    key: keys::TOOL_OUTPUT.to_string(),
                    value: output,
                });
                ctx.accept(nodes);
                Ok(Outcome::Observed)
            }
            other => Err(SchemaError::new(
                format!(
                    "a response must end with '{}' or '{}', not '{}'",
                    self.prefix(keys::TOOL_INPUT),
                    self.prefix(keys::FINAL_ANSWER),
                    self.prefix(other)
                ),
                assistant,
            )
            .into()),
        }
    }

    /// Issue the model call and parse what comes back.
    async fn generate(
        &self,
        messages: Vec<Message>,
        parser: &mut LineParser<'_>,
        signal: &AbortSignal,
        emitter: &Emitter,
    ) -> std::result::Result<(), Rejection> {
        let mut request = ProviderRequest::new(self.model.clone(), messages);
        request.emitter = Some(emitter.clone());
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        request.stream = self.streaming;
        // The model must not write the tool's response itself.
        request.stop = self
            .grammar
            .prefix_of(keys::TOOL_OUTPUT)
            .map(|p| vec![p.to_string()])
            .unwrap_or_default();

        if !self.streaming {
            let response = signal
                .race(with_backoff(&self.retry_policy, signal, |_| {
                    self.provider.complete(request.clone(), signal)
                }))
                .await?
                .map_err(|e| Rejection::Abort(transport_failure(e)))?;
            let events = parser.feed(&response.message.content)?;
            self.publish(emitter, events).await?;
        } else {
            let mut rx = signal
                .race(with_backoff(&self.retry_policy, signal, |_| {
                    self.provider.stream(request.clone(), signal)
                }))
                .await?
                .map_err(|e| Rejection::Abort(transport_failure(e)))?;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = signal.cancelled() => return Err(Rejection::Abort(signal.to_error())),
                    next = rx.recv() => next,
                };
                let Some(item) = next else { break };
                let chunk =
                    item.map_err(|e| Rejection::classify(transport_failure(e), parser.raw()))?;
                if let Some(text) = chunk.content.as_deref() {
                    let events = parser.feed(text)?;
                    self.publish(emitter, events).await?;
                }
                if parser.is_done() || chunk.done {
                    break;
                }
            }
            // Dropping the receiver stops the producer.
            drop(rx);
        }

        let events = parser.finalize()?;
        self.publish(emitter, events).await?;
        Ok(())
    }

    /// Turn parser events into `partial_update` / `update` events.
    async fn publish(&self, emitter: &Emitter, events: Vec<ParseEvent>) -> Result<()> {
        for event in events {
            let (kind, payload) = match event {
                ParseEvent::Partial { key, delta, value } => (
                    EventKind::PartialUpdate,
                    EventPayload::Node {
                        key,
                        value,
                        delta: Some(delta),
                        tool_name: None,
                    },
                ),
                ParseEvent::Completed(node) => {
                    debug!(key = %node.key, "Node completed");
                    (
                        EventKind::Update,
                        EventPayload::Node {
                            key: node.key,
                            value: node.value,
                            delta: None,
                            tool_name: None,
                        },
                    )
                }
            };
            emitter.emit(kind, payload, true).await?;
        }
        Ok(())
    }

    /// Count the failure and queue feedback for the next attempt.
    async fn recover(
        &self,
        error: Error,
        raw: String,
        tools: &[ToolDefinition],
        ctx: &mut RunContext,
        emitter: &Emitter,
        scratch: &mut Vec<Message>,
    ) -> Result<()> {
        warn!(
            iteration = ctx.iteration(),
            kind = error.kind(),
            error = %error,
            "Step failed, retrying"
        );
        emitter.emit(EventKind::Error, failure(&error), false).await?;
        ctx.record_retry()?;
        emitter
            .emit(
                EventKind::Retry,
                EventPayload::Retry {
                    iteration: ctx.iteration(),
                    step_retries: ctx.step_retries(),
                    total_retries: ctx.total_retries(),
                    reason: error.to_string(),
                },
                false,
            )
            .await?;

        // An interrupted stream is retried as is.
        let Some((role, reason)) = feedback(&error) else {
            return Ok(());
        };
        let text = self.prompts.render(
            role,
            &self.prompt_context(tools).with_reason(&reason),
        );
        if !raw.trim().is_empty() {
            scratch.push(Message::assistant(raw));
        }
        scratch.push(Message::user(text));
        Ok(())
    }

    /// Write what this run added to the shared memory as one batch.
    async fn commit(&self, ctx: &RunContext) -> Result<()> {
        let messages = ctx.new_messages().await?;
        debug!(messages = messages.len(), memory = self.memory.name(), "Committing run");
        self.memory.append_many(messages).await.map_err(Error::from)
    }

    /// System prompt, the run's memory, then this step's feedback.
    async fn messages(
        &self,
        system: &str,
        scratch: &[Message],
        memory: &dyn Memory,
    ) -> Result<Vec<Message>> {
        let history = memory.read_all().await?;
        let output_prefix = self.grammar.prefix_of(keys::TOOL_OUTPUT);

        let mut messages = Vec::with_capacity(history.len() + scratch.len() + 1);
        messages.push(Message::system(system));
        for message in history {
            // Tool results read as the continuation of the model's own turn.
            messages.push(match output_prefix {
                Some(prefix) if message.role == Role::Tool => {
                    Message::assistant(format!("{prefix} {}", message.content))
                }
                _ => message,
            });
        }
        messages.extend(scratch.iter().cloned());
        Ok(messages)
    }

    fn prompt_context<'a>(&'a self, tools: &'a [ToolDefinition]) -> PromptContext<'a> {
        PromptContext::new(&self.grammar, tools).with_instructions(self.instructions.as_deref())
    }

    fn prefix<'a>(&'a self, key: &'a str) -> &'a str {
        self.grammar.prefix_of(key).unwrap_or(key)
    }
}

impl std::fmt::Debug for ReactAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactAgent")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("memory", &self.memory.name())
            .field("streaming", &self.streaming)
            .field("execution", &self.execution)
            .finish()
    }
}

/// Name from the last `tool_name` node; blank when the grammar has none.
fn tool_name(nodes: &[ParsedNode]) -> &str {
    nodes
        .iter()
        .rev()
        .find(|n| n.key == keys::TOOL_NAME)
        .map(|n| n.value.as_str())
        .unwrap_or_default()
}

fn transport_failure(error: TransportError) -> Error {
    match error {
        TransportError::Cancelled(reason) => Error::Cancelled { reason },
        other => Error::Transport(other),
    }
}

/// Template and reason for a recoverable failure.
fn feedback(error: &Error) -> Option<(PromptRole, String)> {
    match error {
        Error::Schema(e) => Some((PromptRole::SchemaError, e.message.clone())),
        Error::Tool(ToolError::NotFound { name, .. }) => {
            Some((PromptRole::ToolNotFound, name.clone()))
        }
        Error::Tool(ToolError::InvalidInput { reason, .. }) => {
            Some((PromptRole::ToolInputError, reason.clone()))
        }
        Error::Tool(ToolError::ExecutionFailed { reason, .. }) => {
            Some((PromptRole::ToolError, reason.clone()))
        }
        Error::Tool(ToolError::NoResult { tool_name }) => {
            Some((PromptRole::ToolNoResult, tool_name.clone()))
        }
        _ => None,
    }
}

fn failure(error: &Error) -> EventPayload {
    EventPayload::Failure {
        kind: error.kind().to_string(),
        message: error.to_string(),
    }
}

/// Emit where nobody can act on a handler failure.
async fn notify(emitter: &Emitter, kind: EventKind, payload: EventPayload, success: bool) {
    if let Err(e) = emitter.emit(kind, payload, success).await {
        warn!(scope = %emitter.scope(), kind = %kind, error = %e, "Event handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{Reply, ScriptedProvider};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use stepwise_core::{BudgetKind, Tool, ToolOutput, ToolRegistry};
    use stepwise_memory::UnconstrainedMemory;

    /// Weather for `city`; "Atlantis" fails, "Nowhere" has no result.
    struct Weather {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Weather {
        fn name(&self) -> &str {
            "Weather"
        }
        fn description(&self) -> &str {
            "Current weather for a city"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            })
        }
        async fn run(
            &self,
            input: Value,
            _signal: &AbortSignal,
        ) -> std::result::Result<ToolOutput, ToolError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match input["city"].as_str().unwrap_or_default() {
                "Atlantis" => Err(ToolError::failed("Weather", "city is underwater")),
                "Nowhere" => Ok(ToolOutput::text("")),
                city => Ok(ToolOutput::text(format!("{city}: 18C, sunny"))),
            }
        }
    }

    struct Search;

    #[async_trait]
    impl Tool for Search {
        fn name(&self) -> &str {
            "Search"
        }
        fn description(&self) -> &str {
            "Web search"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({ "type": "object" })
        }
        async fn run(
            &self,
            _input: Value,
            _signal: &AbortSignal,
        ) -> std::result::Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("result"))
        }
    }

    struct Harness {
        agent: ReactAgent,
        provider: Arc<ScriptedProvider>,
        memory: Arc<UnconstrainedMemory>,
        emitter: Emitter,
        runs: Arc<AtomicUsize>,
    }

    fn harness(replies: Vec<Reply>) -> Harness {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let memory = Arc::new(UnconstrainedMemory::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new()
            .with(Box::new(Weather { runs: runs.clone() }))
            .with(Box::new(Search));
        let emitter = Emitter::root();
        let agent = ReactAgent::new(
            provider.clone(),
            "mock-model",
            Arc::new(ToolDispatcher::new(registry)),
            memory.clone(),
            Arc::new(Grammar::react()),
            emitter.clone(),
        )
        .with_retry_policy(RetryPolicy::none());
        Harness {
            agent,
            provider,
            memory,
            emitter,
            runs,
        }
    }

    fn texts(texts: &[&str]) -> Vec<Reply> {
        texts.iter().map(|t| Reply::Text(t.to_string())).collect()
    }

    /// Record `(kind, payload)` of every event under the root scope.
    fn record(emitter: &Emitter) -> Arc<Mutex<Vec<(EventKind, EventPayload)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        emitter.on_all(Delivery::Blocking, move |event: Arc<Event>| {
            sink.lock()
                .unwrap()
                .push((event.kind, event.payload.clone()));
            futures::future::ready(Ok::<(), Error>(()))
        });
        seen
    }

    const WEATHER_CALL: &str = "Thought: I need the weather\nFunction Name: Weather\nFunction Input: {\"city\":\"Paris\"}";
    const ANSWER: &str = "Thought: I know it now\nFinal Answer: Sunny and 18C in Paris";

    #[tokio::test]
    async fn tool_call_then_final_answer() {
        let h = harness(texts(&[WEATHER_CALL, ANSWER]));
        let out = h
            .agent
            .run("What's the weather in Paris?", RunOptions::default())
            .await
            .unwrap();

        assert_eq!(out.answer, "Sunny and 18C in Paris");
        assert_eq!(out.iterations, 2);
        assert_eq!(out.total_retries, 0);
        let keys: Vec<&str> = out.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["thought", "tool_name", "tool_input", "tool_output", "thought", "final_answer"]
        );
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);

        let history = h.memory.read_all().await.unwrap();
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(history[0].content, "Message: What's the weather in Paris?");
        assert_eq!(history[2].content, "Paris: 18C, sunny");
        assert_eq!(history[2].tool_name.as_deref(), Some("Weather"));
    }

    #[tokio::test]
    async fn tool_result_is_in_memory_before_next_call() {
        let h = harness(texts(&[WEATHER_CALL, ANSWER]));
        h.agent.run("Weather?", RunOptions::default()).await.unwrap();

        let requests = h.provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].stop, vec!["Function Output:".to_string()]);

        let second = &requests[1].messages;
        assert_eq!(second[0].role, Role::System);
        let last = second.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Function Output: Paris: 18C, sunny");
        assert!(second[2].content.starts_with("Thought: I need the weather"));
    }

    #[tokio::test]
    async fn unknown_tool_is_fed_back_and_retried() {
        let h = harness(texts(&[
            "Thought: try it\nFunction Name: Unknown\nFunction Input: {}",
            WEATHER_CALL,
            ANSWER,
        ]));
        let events = record(&h.emitter);
        let out = h.agent.run("Weather?", RunOptions::default()).await.unwrap();

        assert_eq!(out.iterations, 2);
        assert_eq!(out.total_retries, 1);

        let retry_request = &h.provider.requests()[1].messages;
        let feedback = retry_request.last().unwrap();
        assert_eq!(feedback.role, Role::User);
        assert_eq!(
            feedback.content,
            "Tool does not exist!\nUse one of the following tools: Weather,Search"
        );
        assert!(retry_request[retry_request.len() - 2]
            .content
            .contains("Function Name: Unknown"));

        // Feedback never reaches memory.
        let history = h.memory.read_all().await.unwrap();
        assert!(history.iter().all(|m| !m.content.contains("Unknown")));

        let events = events.lock().unwrap();
        assert!(events.iter().any(|(kind, payload)| *kind == EventKind::Retry
            && matches!(payload, EventPayload::Retry { iteration: 1, step_retries: 1, total_retries: 1, .. })));
        assert!(events.iter().any(|(kind, payload)| *kind == EventKind::Error
            && matches!(payload, EventPayload::Failure { kind, .. } if kind == "tool_not_found")));
    }

    #[tokio::test]
    async fn per_step_budget_aborts_on_third_input_error() {
        let bad = "Thought: go\nFunction Name: Weather\nFunction Input: {\"town\":\"Paris\"}";
        let h = harness(texts(&[bad, bad, bad, ANSWER]));
        let options = RunOptions::default().with_execution(ExecutionOptions {
            max_retries_per_step: 2,
            total_max_retries: 10,
            max_iterations: 20,
        });
        let err = h.agent.run("Weather?", options).await.unwrap_err();

        assert!(matches!(
            err.error,
            Error::BudgetExceeded {
                kind: BudgetKind::PerStep,
                limit: 2
            }
        ));
        assert_eq!(err.kind(), "budget_exceeded");
        assert_eq!(h.provider.call_count(), 3);
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);
        assert_eq!(err.state.iterations, 1);
        assert_eq!(err.state.step_retries, 3);
        assert_eq!(err.state.nodes.len(), 3);

        let feedback = &h.provider.requests()[2].messages;
        assert!(feedback.last().unwrap().content.contains("HINT:"));
    }

    #[tokio::test]
    async fn schema_error_is_recoverable() {
        let h = harness(texts(&["I think it is sunny.", ANSWER]));
        let out = h.agent.run("Weather?", RunOptions::default()).await.unwrap();
        assert_eq!(out.total_retries, 1);
        assert_eq!(out.iterations, 1);

        let retry = h.provider.requests()[1].messages.clone();
        assert_eq!(retry[retry.len() - 2].content, "I think it is sunny.");
        assert!(retry.last().unwrap().content.starts_with("Error: The generated response"));
    }

    #[tokio::test]
    async fn tool_failure_and_no_result_use_their_templates() {
        let h = harness(texts(&[
            "Thought: a\nFunction Name: Weather\nFunction Input: {\"city\":\"Atlantis\"}",
            "Thought: b\nFunction Name: Weather\nFunction Input: {\"city\":\"Nowhere\"}",
            ANSWER,
        ]));
        let out = h.agent.run("Weather?", RunOptions::default()).await.unwrap();
        assert_eq!(out.total_retries, 2);

        let requests = h.provider.requests();
        let failed = requests[1].messages.last().unwrap();
        assert!(failed.content.starts_with("The tool has failed"));
        assert!(failed.content.ends_with("city is underwater"));
        // Both failures happened in the same step, so the feedback accumulates.
        assert!(requests[2].messages.iter().any(|m| m.content.starts_with("The tool has failed")));
        let empty = requests[2].messages.last().unwrap();
        assert!(empty.content.starts_with("No results were found!"));
    }

    #[tokio::test]
    async fn iteration_cap_is_fatal() {
        let h = harness(texts(&[WEATHER_CALL, WEATHER_CALL, WEATHER_CALL]));
        let options = RunOptions::default().with_execution(ExecutionOptions {
            max_retries_per_step: 3,
            total_max_retries: 10,
            max_iterations: 2,
        });
        let err = h.agent.run("Weather?", options).await.unwrap_err();
        assert!(matches!(
            err.error,
            Error::BudgetExceeded {
                kind: BudgetKind::Iterations,
                limit: 2
            }
        ));
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(err.state.iterations, 2);
        assert_eq!(err.state.nodes.len(), 8);
    }

    #[tokio::test]
    async fn total_budget_spans_steps() {
        let unknown = "Thought: x\nFunction Name: Nope\nFunction Input: {}";
        let h = harness(texts(&[unknown, WEATHER_CALL, unknown, unknown]));
        let options = RunOptions::default().with_execution(ExecutionOptions {
            max_retries_per_step: 5,
            total_max_retries: 2,
            max_iterations: 20,
        });
        let err = h.agent.run("Weather?", options).await.unwrap_err();
        assert!(matches!(
            err.error,
            Error::BudgetExceeded {
                kind: BudgetKind::Total,
                limit: 2
            }
        ));
        assert_eq!(err.state.total_retries, 3);
        assert_eq!(err.state.iterations, 2);
    }

    #[tokio::test]
    async fn events_follow_run_order_and_end_with_done() {
        let h = harness(texts(&[WEATHER_CALL, ANSWER]));
        let events = record(&h.emitter);
        h.agent.run("Weather?", RunOptions::default()).await.unwrap();

        let events = events.lock().unwrap();
        let kinds: Vec<EventKind> = events
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| *k != EventKind::PartialUpdate)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Start,
                EventKind::Update,
                EventKind::Update,
                EventKind::Update,
                EventKind::Update,
                EventKind::Start,
                EventKind::Update,
                EventKind::Update,
                EventKind::Success,
                EventKind::Done,
            ]
        );
        assert!(matches!(
            &events[0].1,
            EventPayload::Iteration { iteration: 1 }
        ));
        assert!(events.iter().any(|(kind, payload)| *kind == EventKind::Update
            && matches!(payload, EventPayload::Node { key, tool_name: Some(t), .. }
                if key == "tool_output" && t == "Weather")));
        assert!(matches!(
            &events[events.len() - 2].1,
            EventPayload::Answer { text } if text == "Sunny and 18C in Paris"
        ));
    }

    #[tokio::test]
    async fn streaming_emits_partial_updates() {
        let h = harness(texts(&[ANSWER]));
        let agent = h.agent.with_streaming(true);
        let events = record(&h.emitter);
        let out = agent.run("Weather?", RunOptions::default()).await.unwrap();
        assert_eq!(out.answer, "Sunny and 18C in Paris");
        assert!(h.provider.requests()[0].stream);

        let events = events.lock().unwrap();
        let partial_answer: String = events
            .iter()
            .filter_map(|(kind, payload)| match payload {
                EventPayload::Node {
                    key,
                    delta: Some(delta),
                    ..
                } if *kind == EventKind::PartialUpdate && key == "final_answer" => {
                    Some(delta.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(partial_answer.trim(), "Sunny and 18C in Paris");
    }

    #[tokio::test]
    async fn interrupted_stream_counts_as_step_retry() {
        let h = harness(vec![
            Reply::Interrupted("Thought: I need".into()),
            Reply::Text(ANSWER.into()),
        ]);
        let agent = h.agent.with_streaming(true);
        let out = agent.run("Weather?", RunOptions::default()).await.unwrap();
        assert_eq!(out.total_retries, 1);
        // Same prompt again, no feedback appended.
        let requests = h.provider.requests();
        assert_eq!(requests[0].messages.len(), requests[1].messages.len());
    }

    #[tokio::test]
    async fn fatal_transport_error_ends_run() {
        let h = harness(vec![Reply::Fail(TransportError::Status {
            status_code: 401,
            message: "bad key".into(),
        })]);
        let err = h.agent.run("Weather?", RunOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert_eq!(err.state.iterations, 1);
        assert_eq!(err.state.total_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_stream_tears_down_and_stops() {
        let h = harness(vec![Reply::Hang("Thought: thinking about it".into())]);
        let agent = h.agent.with_streaming(true);
        let events = record(&h.emitter);
        let signal = AbortSignal::with_timeout(Duration::from_secs(5));

        let err = agent
            .run("Weather?", RunOptions::default().with_signal(signal))
            .await
            .unwrap_err();
        assert!(matches!(&err.error, Error::Cancelled { reason } if reason.contains("timed out")));
        assert_eq!(h.provider.call_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.provider.torn_down());

        let events = events.lock().unwrap();
        let (last, _) = events.last().unwrap();
        assert_eq!(*last, EventKind::Done);
        assert_eq!(
            events.iter().filter(|(k, _)| *k == EventKind::Done).count(),
            1
        );
        assert!(events.iter().any(|(kind, payload)| *kind == EventKind::Error
            && matches!(payload, EventPayload::Failure { kind, .. } if kind == "cancelled")));
    }

    #[tokio::test]
    async fn aborted_signal_issues_no_model_call() {
        let h = harness(texts(&[ANSWER]));
        let signal = AbortSignal::new();
        signal.abort("user quit");
        let err = h
            .agent
            .run("Weather?", RunOptions::default().with_signal(signal))
            .await
            .unwrap_err();
        assert!(matches!(&err.error, Error::Cancelled { reason } if reason == "user quit"));
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(err.state.iterations, 0);
    }

    #[tokio::test]
    async fn empty_prompt_uses_empty_message_template() {
        let h = harness(texts(&["Thought: nothing asked\nFinal Answer: Hello!"]));
        h.agent.run("   ", RunOptions::default()).await.unwrap();
        let history = h.memory.read_all().await.unwrap();
        assert_eq!(history[0].content, "Message: Empty message.");
    }

    #[tokio::test]
    async fn concurrent_runs_keep_their_conversations_apart() {
        let h = harness(texts(&[ANSWER, ANSWER]));
        let agent = h.agent.with_streaming(true);

        let (first, second) = tokio::join!(
            agent.run("Weather in Paris?", RunOptions::default()),
            agent.run("Weather in Oslo?", RunOptions::default()),
        );
        first.unwrap();
        second.unwrap();

        let requests = h.provider.requests();
        assert_eq!(requests.len(), 2);
        let mut asked: Vec<String> = requests
            .iter()
            .map(|r| {
                let users: Vec<&Message> =
                    r.messages.iter().filter(|m| m.role == Role::User).collect();
                assert_eq!(users.len(), 1, "a request saw another run's question");
                users[0].content.clone()
            })
            .collect();
        asked.sort();
        assert_eq!(
            asked,
            vec!["Message: Weather in Oslo?", "Message: Weather in Paris?"]
        );

        // Each run lands as one contiguous batch.
        let history = h.memory.read_all().await.unwrap();
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_ne!(history[0].content, history[2].content);
    }

    #[tokio::test]
    async fn later_runs_see_earlier_answers() {
        let h = harness(texts(&[ANSWER, "Thought: again\nFinal Answer: Still sunny"]));
        h.agent.run("Weather?", RunOptions::default()).await.unwrap();
        h.agent.run("And now?", RunOptions::default()).await.unwrap();

        let second = &h.provider.requests()[1].messages;
        assert_eq!(second[1].content, "Message: Weather?");
        assert_eq!(second.last().unwrap().content, "Message: And now?");
        assert_eq!(h.memory.len().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn failed_run_leaves_memory_untouched() {
        let h = harness(vec![
            Reply::Text(ANSWER.into()),
            Reply::Text(WEATHER_CALL.into()),
            Reply::Fail(TransportError::Status {
                status_code: 401,
                message: "bad key".into(),
            }),
        ]);
        h.agent.run("Weather?", RunOptions::default()).await.unwrap();
        let before = h.memory.read_all().await.unwrap();

        let err = h.agent.run("Weather in Paris?", RunOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        // The tool ran and was observed by the failed run, but nothing was kept.
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);
        assert!(h.provider.requests()[2]
            .messages
            .iter()
            .any(|m| m.content == "Function Output: Paris: 18C, sunny"));
        assert_eq!(h.memory.read_all().await.unwrap(), before);
    }

    #[tokio::test]
    async fn run_scope_nests_under_the_given_emitter() {
        let h = harness(texts(&[ANSWER, ANSWER]));
        let session = h.emitter.child("session-a");
        let seen = record(&session);

        h.agent
            .run("Weather?", RunOptions::default().with_emitter(session.clone()))
            .await
            .unwrap();
        h.agent.run("Weather?", RunOptions::default()).await.unwrap();

        let requests = h.provider.requests();
        let scoped = requests[0].emitter.as_ref().unwrap().scope().segments().to_vec();
        assert_eq!(scoped[0], "session-a");
        assert!(scoped[1].starts_with("run-"));
        let unscoped = requests[1].emitter.as_ref().unwrap().scope().segments().to_vec();
        assert!(unscoped[0].starts_with("run-"));

        // Only the first run reached the session subscriber.
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.iter().filter(|(kind, _)| *kind == EventKind::Done).count(),
            1
        );
    }

    #[tokio::test]
    async fn memory_subscriber_is_removed_after_run() {
        let h = harness(texts(&[ANSWER]));
        let before = h.emitter.subscriber_count();
        h.agent.run("Hi", RunOptions::default()).await.unwrap();
        assert_eq!(h.emitter.subscriber_count(), before);
    }
}
