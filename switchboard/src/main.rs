//! Switchboard CLI - multi-protocol chat bot host.

#![allow(clippy::print_stdout)] // CLI program intentionally uses stdout

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use switchboard::config::{init_config, load_config};
use switchboard::error::{BotError, DisplayError, Result};
use switchboard::runtime::RuntimeBuilder;
use switchboard::storage::{FileStorage, StorageHandler};
use switchboard::util::config_path;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Switchboard - one command dispatcher for many chat networks
#[derive(Parser)]
#[command(name = "switchboard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "SWITCHBOARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration
    Init(InitArgs),

    /// Connect every enabled network and dispatch commands
    Run,

    /// Validate the configuration and list connections
    Check,

    /// Print the configuration file path
    Path,
}

/// Arguments for the init command
#[derive(Args)]
struct InitArgs {
    /// Force overwrite existing configuration
    #[arg(short, long)]
    force: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", DisplayError(&e));
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with the given verbosity level.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "switchboard={level},{}",
            if verbosity >= 2 { "debug" } else { "warn" }
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let path = cli.config.unwrap_or_else(config_path);
    match cli.command {
        Commands::Init(args) => cmd_init(args, &path).await,
        Commands::Run => cmd_run(&path).await,
        Commands::Check => cmd_check(&path).await,
        Commands::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

/// Write the template configuration.
async fn cmd_init(args: InitArgs, path: &Path) -> Result<()> {
    let storage = FileStorage::new();
    if storage.exists(path).await && !args.force {
        println!("Configuration already exists at: {}", path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    init_config(&storage, path)
        .await
        .map_err(|e| BotError::config(format!("failed to initialize config: {e}")))?;

    println!("Configuration created: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. edit the file and set \"enabled\": true on a connection");
    println!("  2. switchboard check");
    println!("  3. switchboard run");
    Ok(())
}

/// Run every enabled connection until Ctrl+C.
async fn cmd_run(path: &Path) -> Result<()> {
    let config = load_config(&FileStorage::new(), path).await?;
    if config.enabled_connections().next().is_none() {
        return Err(BotError::config("no enabled connections"));
    }

    let runtime = RuntimeBuilder::new()
        .config(config)
        .plugins(switchboard::plugins::manifest())
        .build()?;
    println!("Switchboard running. Press Ctrl+C to stop.\n");
    runtime.run().await
}

/// Validate the configuration.
async fn cmd_check(path: &Path) -> Result<()> {
    let config = load_config(&FileStorage::new(), path).await?;
    println!("Configuration is valid: {}", path.display());
    println!();
    println!("Connections:");
    for conn in &config.connections {
        println!(
            "  {:<16} {:<8} {}",
            conn.name,
            conn.protocol.to_string(),
            if conn.enabled { "enabled" } else { "disabled" }
        );
    }
    println!();
    println!("Dispatcher tick: {} ms", config.dispatcher.tick_interval_ms);
    Ok(())
}
