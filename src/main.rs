//! agentsync: drive resumable CLI agent sessions and mirror their logs.

use agentsync::config::{self, Config};
use agentsync::service::ConversationService;
use agentsync::Result;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "agentsync", about = "Resumable conversations with CLI AI agents")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Create a conversation for a worker in a project directory
    New {
        #[arg(long, default_value = "claude")]
        worker: String,
        #[arg(long, default_value = ".")]
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Send a message, starting the agent session on first use
    Send { id: String, message: String },
    /// Mirror the agent's session log into the record store
    Sync { id: String },
    /// Print stored messages, oldest first
    Messages {
        id: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print recorded inputs, oldest first
    Inputs {
        id: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List conversations, most recently active first
    List {
        #[arg(long)]
        worker: Option<String>,
    },
    Rename { id: String, name: String },
    /// Make a conversation its worker's current one
    Switch { id: String },
    /// Stop auto-syncing a conversation
    Archive { id: String },
    /// Delete a conversation and its records
    Delete { id: String },
    /// Auto-sync every active conversation until interrupted
    Watch,
    /// Print the effective config
    Config {
        /// Also write it back to the config file
        #[arg(long)]
        write: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("AGENTSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    if let Command::Config { write } = cli.command {
        if write {
            let path = match &cli.config {
                Some(path) => {
                    config::save_config_to(&config, path)?;
                    path.clone()
                }
                None => config::save_config(&config)?,
            };
            info!(path = %path.display(), "config written");
        }
        return print_json(&config);
    }

    let service = ConversationService::from_config(&config);
    match cli.command {
        Command::New { worker, path, name } => {
            print_json(&service.create(&worker, &path, name).await?)?;
        }
        Command::Send { id, message } => {
            let outcome = service.send_message(&id, &message).await?;
            // The reply is already in hand; a failed mirror is not fatal.
            if let Err(e) = service.sync(&id).await {
                warn!(conversation_id = %id, error = %e, "sync after send failed");
            }
            print_json(&outcome)?;
        }
        Command::Sync { id } => print_json(&service.sync(&id).await?)?,
        Command::Messages { id, limit } => print_json(&service.messages(&id, limit).await?)?,
        Command::Inputs { id, limit } => print_json(&service.inputs(&id, limit).await?)?,
        Command::List { worker } => print_json(&service.list(worker.as_deref()).await?)?,
        Command::Rename { id, name } => print_json(&service.rename(&id, &name).await?)?,
        Command::Switch { id } => print_json(&service.switch(&id).await?)?,
        Command::Archive { id } => print_json(&service.archive(&id).await?)?,
        Command::Delete { id } => service.delete(&id).await?,
        Command::Watch => {
            let activated = service.activate_all().await?;
            info!(activated, "watching agent session logs");
            tokio::signal::ctrl_c().await?;
            service.shutdown();
        }
        Command::Config { .. } => {}
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
