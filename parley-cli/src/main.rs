//! Parley CLI - talk to a session from the terminal

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use parley_core::config::ParleyConfig;
use parley_core::session::SessionOrchestrator;
use parley_core::tools::ToolDispatcher;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
Commands:
  /help      Show this help
  /status    Show context usage for this session
  /compact   Summarize the conversation so far
  /clear     Forget the conversation and start over
  /exit      Leave (also /quit)";

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Conversational assistant with context budgeting", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file layered over parley.toml (PARLEY_* variables still win)
    #[arg(short, long, global = true, env = "PARLEY_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Override the configured model
    #[arg(short, long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation
    Chat,
    /// Send a single message and print the reply
    Ask {
        /// Message to send
        message: String,
        /// Print the reply as it arrives
        #[arg(short, long)]
        stream: bool,
    },
    /// Print the effective configuration as JSON
    Config,
    /// Version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    parley_core::telemetry::ensure_initialized_with("warn");

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
            println!("parley-core {}", parley_core::VERSION);
        }
        Commands::Config => {
            let config = load_config(cli.config.as_ref(), cli.model)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Ask { message, stream } => {
            let config = load_config(cli.config.as_ref(), cli.model)?;
            let mut session = build_session(&config)?;
            if stream {
                stream_reply(&mut session, &message).await?;
            } else {
                println!("{}", session.send(&message).await?);
            }
        }
        Commands::Chat => {
            let config = load_config(cli.config.as_ref(), cli.model)?;
            let session = build_session(&config)?;
            chat(session).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>, model: Option<String>) -> Result<ParleyConfig> {
    let mut config = ParleyConfig::load_with(path.map(PathBuf::as_path))
        .context("loading configuration")?;
    if let Some(model) = model {
        config.llm.model = model;
    }
    Ok(config)
}

fn build_session(config: &ParleyConfig) -> Result<SessionOrchestrator> {
    let provider = config
        .llm
        .build_provider()
        .context("configuring the completion service")?;
    tracing::debug!(model = %config.llm.model, base_url = %config.llm.base_url, "Provider ready");

    Ok(SessionOrchestrator::from_config(
        Arc::new(provider),
        Arc::new(ToolDispatcher::new()),
        config,
    ))
}

async fn stream_reply(session: &mut SessionOrchestrator, message: &str) -> Result<()> {
    let mut stdout = std::io::stdout();
    let stream = session.send_streaming(message);
    tokio::pin!(stream);

    while let Some(chunk) = stream.next().await {
        write!(stdout, "{chunk}")?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

async fn chat(mut session: SessionOrchestrator) -> Result<()> {
    println!("Parley {} - type /help for commands", parley_core::VERSION);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nYou: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/exit" | "/quit" => break,
            "/help" => println!("{HELP}"),
            "/clear" => {
                session.reset();
                println!("Conversation cleared.");
            }
            "/status" => {
                println!("State: {}", session.state());
                println!("{}", serde_json::to_string_pretty(&session.stats())?);
            }
            "/compact" => {
                session.compact_now().await;
                let stats = session.stats();
                println!(
                    "Compacted: {} turns, {:.1}% of budget used.",
                    stats.turn_count, stats.usage_percent
                );
            }
            command if command.starts_with('/') => {
                println!("Unknown command {command}. Type /help for commands.");
            }
            message => {
                print!("Parley: ");
                stream_reply(&mut session, message).await?;
            }
        }
    }

    println!("Goodbye.");
    Ok(())
}
