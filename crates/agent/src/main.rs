use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use valet_agent::engine::{run_turn, AgentEvent, TurnInput};
use valet_agent::{scheduler, AppState};
use valet_domain::config::Config;
use valet_sessions::SessionKey;

#[derive(Parser)]
#[command(name = "valet", version, about = "Personal AI assistant daemon")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat REPL (default).
    Chat {
        /// Session id as channel:chat_id:user_id.
        #[arg(long, default_value = "cli:local:default")]
        session: String,
    },
    /// Run a single turn and print the final text.
    Once {
        message: String,
        #[arg(long, default_value = "cli:local:default")]
        session: String,
    },
    /// Print version info.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => {
            init_tracing();
            let state = boot(cli.config)?;
            tokio::spawn(scheduler::run_loop(state.clone()));
            chat_repl(state, "cli:local:default").await
        }
        Some(Command::Chat { session }) => {
            init_tracing();
            let state = boot(cli.config)?;
            tokio::spawn(scheduler::run_loop(state.clone()));
            chat_repl(state, &session).await
        }
        Some(Command::Once { message, session }) => {
            init_tracing();
            let state = boot(cli.config)?;
            let key = SessionKey::parse(&session).context("invalid --session")?;
            let (_task_id, mut rx) = run_turn(state, TurnInput::text(key, message));
            let mut out = std::io::stdout();
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::TextDelta { text } => {
                        out.write_all(text.as_bytes())?;
                        out.flush()?;
                    }
                    AgentEvent::Error { message } => {
                        eprintln!("error: {message}");
                    }
                    AgentEvent::Done { .. } => break,
                    _ => {}
                }
            }
            println!();
            Ok(())
        }
        Some(Command::Version) => {
            println!("valet {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("valet=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn boot(config_path: Option<PathBuf>) -> anyhow::Result<Arc<AppState>> {
    let path = config_path.unwrap_or_else(default_config_path);
    let config = if path.exists() {
        Config::load(&path).with_context(|| format!("loading config {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "no config file found, using defaults");
        Config::default()
    };
    AppState::new(config).context("building runtime")
}

fn default_config_path() -> PathBuf {
    if let Ok(p) = std::env::var("VALET_CONFIG") {
        return PathBuf::from(p);
    }
    PathBuf::from("valet.json")
}

async fn chat_repl(state: Arc<AppState>, session: &str) -> anyhow::Result<()> {
    let key = SessionKey::parse(session).context("invalid --session")?;

    let history_path = dirs::home_dir()
        .unwrap_or_default()
        .join(".valet")
        .join("chat_history.txt");
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut rl = rustyline::DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    eprintln!("valet interactive chat");
    eprintln!("Session: {session}  |  Ctrl+D to exit, /stop to cancel a running turn");
    eprintln!();

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);

                if trimmed == "/stop" {
                    if !state.tasks.cancel(&key, "user requested stop") {
                        eprintln!("(nothing running)");
                    }
                    continue;
                }
                if let Some(rest) = trimmed.strip_prefix("/insert ") {
                    if state.tasks.insert(&key, rest) {
                        eprintln!("(queued)");
                    } else {
                        eprintln!("(nothing running)");
                    }
                    continue;
                }

                let (_task_id, mut rx) =
                    run_turn(state.clone(), TurnInput::text(key.clone(), trimmed));
                let mut out = std::io::stdout();
                while let Some(event) = rx.recv().await {
                    match event {
                        AgentEvent::TextDelta { text } => {
                            out.write_all(text.as_bytes())?;
                            out.flush()?;
                        }
                        AgentEvent::ThinkingDelta { .. } => {}
                        AgentEvent::ToolCallStart { tool_name, .. } => {
                            eprintln!("\n[tool: {tool_name}]");
                        }
                        AgentEvent::IterationStart { .. } => {}
                        AgentEvent::Error { message } => {
                            eprintln!("\nerror: {message}");
                        }
                        AgentEvent::Done { .. } => break,
                    }
                }
                println!();
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                state.tasks.cancel(&key, "interrupted");
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    state.sessions.flush().ok();
    Ok(())
}
