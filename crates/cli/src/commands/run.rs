//! `stepwise run` — single-message or interactive mode.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, bail};
use stepwise_agent::{ExecutionOptions, ReactAgent, RunOptions, TemplateSet};
use stepwise_config::{AppConfig, DIALECTS, TransportConfig};
use stepwise_core::{AbortSignal, Emitter};
use stepwise_grammar::Grammar;
use stepwise_providers::{OpenAiCompatProvider, RetryPolicy};
use stepwise_tools::{ToolDispatcher, default_registry};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::observer;

pub async fn run(
    message: Option<String>,
    stream: bool,
    dialect: Option<String>,
) -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load config")?;
    if let Some(dialect) = dialect {
        if !DIALECTS.contains(&dialect.as_str()) {
            bail!(
                "unknown dialect '{dialect}' (expected one of: {})",
                DIALECTS.join(", ")
            );
        }
        config.agent.dialect = dialect;
    }
    let stream = stream || config.stream;

    let emitter = Emitter::root();
    let agent = build_agent(&config, &emitter, stream)?;
    observer::attach(&emitter, stream);

    if let Some(message) = message {
        // Single message mode
        let answered = ask(&agent, &config, &message, stream).await;
        if !answered {
            std::process::exit(1);
        }
        return Ok(());
    }

    // Interactive mode
    println!();
    println!("  stepwise — interactive mode");
    println!();
    println!("  Model:     {}", config.model);
    println!("  Endpoint:  {}", config.base_url);
    println!("  Dialect:   {}", config.agent.dialect);
    println!("  Memory:    {}", agent.memory().name());
    println!("  Tools:     {}", default_registry().names().join(", "));
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line == "exit" || line == "quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        ask(&agent, &config, line, stream).await;
        println!();
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Run one message, printing the answer or the error. Returns whether an
/// answer was produced.
async fn ask(agent: &ReactAgent, config: &AppConfig, message: &str, stream: bool) -> bool {
    let signal = match config.execution.timeout() {
        Some(timeout) => AbortSignal::with_timeout(timeout),
        None => AbortSignal::new(),
    };
    let interrupt = {
        let signal = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.abort("Interrupted by user");
            }
        })
    };

    let result = agent
        .run(message, RunOptions::default().with_signal(signal))
        .await;
    interrupt.abort();

    match result {
        Ok(output) => {
            debug!(
                iterations = output.iterations,
                total_retries = output.total_retries,
                "Answer ready"
            );
            if !stream {
                println!("  Answer > {}", output.answer);
            }
            true
        }
        Err(e) => {
            eprintln!(
                "  [failed: {}] {} (iterations: {}, retries: {})",
                e.kind(),
                e,
                e.state.iterations,
                e.state.total_retries
            );
            false
        }
    }
}

/// Wire provider, tools, memory, grammar and templates from `config`.
fn build_agent(config: &AppConfig, emitter: &Emitter, stream: bool) -> anyhow::Result<ReactAgent> {
    let api_key = match &config.api_key {
        Some(key) => key.clone(),
        None if is_local(&config.base_url) => "local".to_string(),
        None => bail!(
            "No API key configured. Set STEPWISE_API_KEY or OPENAI_API_KEY, or add api_key to {}",
            AppConfig::config_dir().join("config.toml").display()
        ),
    };

    let provider = OpenAiCompatProvider::new(
        "openai-compat",
        &config.base_url,
        api_key,
        std::time::Duration::from_secs(config.transport.request_timeout_secs),
    )?
    .with_emitter(emitter.child("transport"));

    let grammar = Grammar::by_name(&config.agent.dialect)
        .with_context(|| format!("unknown dialect '{}'", config.agent.dialect))?;
    let memory = stepwise_memory::from_kind(&config.agent.memory, config.agent.memory_window)
        .with_context(|| format!("unknown memory kind '{}'", config.agent.memory))?;

    let mut agent = ReactAgent::new(
        Arc::new(provider),
        &config.model,
        Arc::new(ToolDispatcher::new(default_registry())),
        memory,
        Arc::new(grammar),
        emitter.clone(),
    )
    .with_prompts(Arc::new(TemplateSet::for_dialect(&config.agent.dialect)))
    .with_temperature(config.temperature)
    .with_streaming(stream)
    .with_execution(ExecutionOptions::from(&config.execution))
    .with_retry_policy(retry_policy(&config.transport));

    if let Some(max_tokens) = config.max_tokens {
        agent = agent.with_max_tokens(max_tokens);
    }
    if let Some(instructions) = &config.agent.instructions {
        agent = agent.with_instructions(instructions.clone());
    }
    Ok(agent)
}

fn retry_policy(transport: &TransportConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: transport.max_attempts,
        initial_delay: std::time::Duration::from_millis(transport.initial_delay_ms),
        max_delay: std::time::Duration::from_millis(transport.max_delay_ms),
        ..RetryPolicy::default()
    }
}

fn is_local(base_url: &str) -> bool {
    base_url.contains("://localhost") || base_url.contains("://127.0.0.1")
}
