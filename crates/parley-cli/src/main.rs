// ABOUTME: Entry point for the parley command-line tool.
// ABOUTME: Dispatches to normalize, replay, store and version subcommands.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parley_cli::{normalize_transcript, replay_events, VERSION};
use parley_engine::Config;
use parley_store::{PreferenceStore, SessionStore};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Offline tooling for the parley chat session engine")]
#[command(version)]
struct Cli {
    /// Directory holding the session store (overrides config and PARLEY_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize a stored transcript (JSON array of records) into display messages
    Normalize {
        /// Transcript file
        path: PathBuf,
    },

    /// Fold a newline-delimited event log into one assistant message
    Replay {
        /// Event log file, one JSON event per line
        path: PathBuf,
    },

    /// Inspect and maintain the session store
    #[command(subcommand)]
    Store(StoreCommands),

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum StoreCommands {
    /// Show the current session, cached messages and preferences of a workspace
    Show {
        #[arg(long, short = 'w')]
        workspace: String,
    },

    /// Move legacy unscoped keys under a workspace
    Migrate {
        #[arg(long, short = 'w')]
        workspace: String,
    },

    /// Record a session as belonging to a workspace
    Claim {
        /// Session id
        session: String,

        #[arg(long, short = 'w')]
        workspace: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    parley_log::init();

    let cli = Cli::parse();
    let config = Config::load(cli.data_dir.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Normalize { path } => run_normalize(path),
        Commands::Replay { path } => run_replay(path, &config),
        Commands::Store(cmd) => run_store(cmd, &config).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn run_normalize(path: PathBuf) -> Result<()> {
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let messages = normalize_transcript(&json)?;
    println!("{}", serde_json::to_string_pretty(&messages)?);
    Ok(())
}

fn run_replay(path: PathBuf, config: &Config) -> Result<()> {
    let log = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let replay = replay_events(&log, &config.engine.ask_tool_pattern)?;
    if !replay.skipped.is_empty() {
        eprintln!("Skipped {} unparseable line(s)", replay.skipped.len());
    }
    println!("{}", serde_json::to_string_pretty(&replay)?);
    Ok(())
}

async fn run_store(cmd: StoreCommands, config: &Config) -> Result<()> {
    let store = Arc::new(
        config
            .open_store()
            .await
            .context("Failed to open session store")?,
    );
    let sessions = SessionStore::new(store.clone());

    match cmd {
        StoreCommands::Show { workspace } => {
            let preferences = PreferenceStore::new(store);
            let current = sessions.current_session(&workspace).await?;
            let messages = sessions.load_messages(&workspace).await?;
            let model = preferences.workspace_preference(&workspace).await?;
            let strategy = preferences
                .execution_strategy(&workspace)
                .await?
                .unwrap_or(config.engine.default_execution_strategy);

            println!("Workspace:      {}", workspace);
            println!(
                "Current topic:  {}",
                current.as_deref().unwrap_or("(none)")
            );
            println!("Cached messages: {}", messages.len());
            println!("Strategy:       {}", strategy.as_str());
            println!(
                "Model:          {} / {}",
                model.provider.as_deref().unwrap_or("(default)"),
                model.model.as_deref().unwrap_or("(default)")
            );
        }
        StoreCommands::Migrate { workspace } => {
            if sessions.migrate_legacy(&workspace).await? {
                println!("Migrated legacy keys into workspace {}", workspace);
            } else {
                println!("Legacy keys already migrated");
            }
        }
        StoreCommands::Claim { session, workspace } => {
            match sessions.claim(&session, &workspace).await {
                Ok(()) => println!("Session {} belongs to workspace {}", session, workspace),
                Err(parley_store::StoreError::WorkspaceConflict { owner, .. }) => {
                    bail!("Session {} already belongs to workspace {}", session, owner)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

/// Print version information
fn print_version() {
    println!("parley {}", VERSION);
    println!();
    println!("Component versions:");
    println!("  parley-cli:    {}", VERSION);
    println!("  parley-engine: (linked)");
    println!("  parley-store:  (linked)");
}
