mod assistant;
mod repl;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use smartgraph_core::config::{AppConfig, ModelConfig, SearchConfig, SearchProvider};
use smartgraph_core::types::SessionId;
use smartgraph_engine::{CheckpointManager, EngineSettings, GraphEngine, RunStatus, TaskExecutor};
use smartgraph_memory::{MemoryManager, MemorySettings};
use smartgraph_tools::{create_search_tool, MemoryRecallTool, ToolRegistry};

#[derive(Parser)]
#[command(name = "smartgraph", version, about = "Graph-driven conversational search assistant")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "smartgraph.toml")]
    config: PathBuf,

    /// Session ID used for checkpoints
    #[arg(short, long, default_value = "default")]
    session: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive search assistant (default)
    Repl,
    /// Show current configuration (API keys redacted)
    Config,
    /// Inspect or remove saved checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Maintain long-term memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the session's latest checkpoint
    Show,
    /// Delete the session's checkpoint
    Clear,
    /// List sessions with a checkpoint
    List,
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Evict long-term entries idle longer than the TTL
    Cleanup {
        /// Idle time in seconds (defaults to memory.ttl_secs)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("smartgraph=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let session_id = SessionId::parse(&cli.session)?;

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: {} not found, using defaults and environment variables.",
            cli.config.display()
        );
        env_config()
    };

    match cli.command.unwrap_or(Commands::Repl) {
        Commands::Repl => run_repl(&config, session_id).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&redacted(&config))?);
            Ok(())
        }
        Commands::Checkpoint { action } => {
            let manager = open_checkpoints(&config)?;
            match action {
                CheckpointAction::Show => match manager.load(&session_id).await? {
                    Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
                    None => println!("No checkpoint for session {}.", session_id),
                },
                CheckpointAction::Clear => {
                    if manager.delete(&session_id).await? {
                        println!("Checkpoint for session {} removed.", session_id);
                    } else {
                        println!("No checkpoint for session {}.", session_id);
                    }
                }
                CheckpointAction::List => {
                    let sessions = manager.list().await?;
                    if sessions.is_empty() {
                        println!("No checkpoints.");
                    }
                    for session in sessions {
                        println!("{}", session);
                    }
                }
            }
            Ok(())
        }
        Commands::Memory {
            action: MemoryAction::Cleanup { ttl_secs },
        } => {
            let Some(ttl) = ttl_secs.or(config.memory.ttl_secs) else {
                anyhow::bail!("no TTL given; pass --ttl-secs or set memory.ttl_secs");
            };
            if config.long_term_path().is_none() {
                anyhow::bail!("memory.long_term_path is not set, nothing to clean up");
            }
            let memory = open_memory(&config).await?;
            let removed = memory.cleanup_long_term_memory(Duration::from_secs(ttl));
            memory.save_long_term_memory().await?;
            println!("Removed {} long-term entries.", removed.len());
            for key in removed {
                println!("  - {}", key);
            }
            Ok(())
        }
    }
}

/// Minimal config when no file exists: OpenAI from `OPENAI_API_KEY`,
/// Tavily from `TAVILY_API_KEY`, DuckDuckGo otherwise.
fn env_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.model = std::env::var("OPENAI_API_KEY").ok().map(|key| ModelConfig {
        provider: "openai".to_string(),
        model_id: std::env::var("SMARTGRAPH_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        api_key: Some(key),
        base_url: None,
        max_tokens: 1024,
        temperature: 0.7,
        timeout_secs: 60,
    });
    config.search = Some(default_search(std::env::var("TAVILY_API_KEY").ok()));
    config
}

fn default_search(tavily_key: Option<String>) -> SearchConfig {
    SearchConfig {
        provider: if tavily_key.is_some() {
            SearchProvider::Tavily
        } else {
            SearchProvider::DuckDuckGo
        },
        api_key: tavily_key,
        max_results: 5,
    }
}

fn redacted(config: &AppConfig) -> AppConfig {
    let mut config = config.clone();
    if let Some(model) = config.model.as_mut() {
        if model.api_key.is_some() {
            model.api_key = Some("***".into());
        }
    }
    if let Some(search) = config.search.as_mut() {
        if search.api_key.is_some() {
            search.api_key = Some("***".into());
        }
    }
    config
}

fn open_checkpoints(config: &AppConfig) -> anyhow::Result<CheckpointManager> {
    let dir = config.checkpoint_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(CheckpointManager::from_config(&config.checkpoint, &dir)?)
}

async fn open_memory(config: &AppConfig) -> anyhow::Result<Arc<MemoryManager>> {
    let settings = MemorySettings {
        long_term_path: config.long_term_path(),
        ..MemorySettings::from(&config.memory)
    };
    if let Some(parent) = settings.long_term_path.as_deref().and_then(Path::parent) {
        std::fs::create_dir_all(parent)?;
    }
    let memory = MemoryManager::shared(settings);
    let loaded = memory.load_long_term_memory().await?;
    info!(entries = loaded, "Long-term memory loaded");
    Ok(memory)
}

async fn run_repl(config: &AppConfig, session_id: SessionId) -> anyhow::Result<()> {
    let Some(model_config) = &config.model else {
        anyhow::bail!("no [model] section configured; add one or set OPENAI_API_KEY");
    };
    let model = smartgraph_llm::create_client(model_config)?;

    let memory = open_memory(config).await?;
    if let Some(ttl) = config.memory.ttl_secs {
        let evicted = memory.cleanup_long_term_memory(Duration::from_secs(ttl));
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Expired long-term entries removed");
            memory.flush_or_warn().await;
        }
    }

    let search_config = config.search.clone().unwrap_or_else(|| default_search(None));
    let search = create_search_tool(&search_config)?;
    let search_name = search.name().to_string();

    let mut tools = ToolRegistry::new();
    tools.register_shared(search);
    tools.register(MemoryRecallTool::new(memory.clone()));

    let executor = TaskExecutor::new(
        Some(model),
        Arc::new(tools),
        config.memory.max_context_tokens,
    );
    let graph = assistant::build_graph(&search_name, search_config.max_results)?;
    let mut engine = GraphEngine::new(
        graph,
        executor,
        memory.clone(),
        EngineSettings::from(&config.engine),
    );
    if config.checkpoint.enabled {
        engine = engine.with_checkpoints(Arc::new(open_checkpoints(config)?), session_id.clone());
    }
    engine.compile()?;

    println!("SmartGraph v{}", env!("CARGO_PKG_VERSION"));
    println!("Session: {}", session_id);
    println!("Search: {}", search_name);
    println!("Type /help for commands, /quit to exit.");

    let mut interrupts = repl::interrupts();
    let resumed = match engine.resume_session().await {
        Ok(Some(status)) => {
            println!("Resumed from checkpoint.");
            Ok(status)
        }
        Ok(None) => engine.execute(None).await,
        Err(e) => Err(e),
    };
    let mut status = repl::recover(&mut engine, resumed, assistant::PROMPT_NODE).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    'session: loop {
        let prompt = match status {
            RunStatus::AwaitingInput { prompt, emitted, .. } => {
                for text in emitted {
                    println!("\n{}", text);
                }
                prompt
            }
            RunStatus::Completed(_) => {
                println!("Conversation finished.");
                break;
            }
            RunStatus::Cancelled => {
                let interrupted = Ok(RunStatus::Cancelled);
                status = repl::recover(&mut engine, interrupted, assistant::PROMPT_NODE).await?;
                continue;
            }
        };

        let input = loop {
            print!("{}", prompt);
            stdout.flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                Some(()) = interrupts.recv() => {
                    println!();
                    break 'session;
                }
            };
            let Some(line) = line else {
                break 'session; // EOF
            };
            match line.trim() {
                "" => continue,
                "/quit" | "/exit" => break 'session,
                "/help" => {
                    println!("Commands:");
                    println!("  /quit       Exit and save a checkpoint (Ctrl-C at the prompt too)");
                    println!("  /facts      Show remembered facts");
                    println!("  /history    Show recent conversation turns");
                    println!("  /state      Show pipeline state");
                    println!("  /clear      Start over (long-term memory is kept)");
                    println!("Ctrl-C during a search interrupts it and keeps the session.");
                }
                "/facts" => {
                    let facts = memory.facts();
                    if facts.is_empty() {
                        println!("No facts remembered yet.");
                    }
                    for fact in facts {
                        println!("  - {}", fact);
                    }
                }
                "/history" => {
                    for turn in memory.recent_turns(config.memory.context_turns) {
                        println!("  {}", turn);
                    }
                }
                "/state" => println!("{}", serde_json::to_string_pretty(engine.state())?),
                "/clear" => {
                    let cleared = engine.execute(None).await;
                    status = repl::recover(&mut engine, cleared, assistant::PROMPT_NODE).await?;
                    println!("Session cleared.");
                    continue 'session;
                }
                other if other.starts_with('/') => {
                    println!("Unknown command: {} (try /help)", other);
                }
                other => break other.to_string(),
            }
        };

        let token = engine.cancel_token();
        let outcome = {
            let run = engine.resume(&input);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    Some(()) = interrupts.recv() => token.cancel(),
                }
            }
        };
        status = repl::recover(&mut engine, outcome, assistant::PROMPT_NODE).await?;
    }

    match engine.exit().await {
        Ok(Some(checkpoint)) => info!(sequence = checkpoint.sequence, "Final checkpoint saved"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Final checkpoint not saved"),
    }
    println!("Goodbye!");
    Ok(())
}
