//! stepwise CLI — the main entry point.
//!
//! Commands:
//! - `run`     — Ask a single question or chat interactively
//! - `config`  — Print the effective configuration
//! - `tools`   — List the built-in tools

use clap::{Parser, Subcommand};

mod commands;
mod observer;

#[derive(Parser)]
#[command(
    name = "stepwise",
    about = "stepwise — a streaming ReAct agent runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Stream model output as it is generated
        #[arg(long)]
        stream: bool,

        /// Grammar dialect: react or granite
        #[arg(long, env = "STEPWISE_DIALECT")]
        dialect: Option<String>,
    },

    /// Print the effective configuration (API key redacted)
    Config,

    /// List available tools and their input schemas
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            message,
            stream,
            dialect,
        } => commands::run::run(message, stream, dialect).await?,
        Commands::Config => commands::config_cmd::show()?,
        Commands::Tools => commands::tools::list()?,
    }

    Ok(())
}
