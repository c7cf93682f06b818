//! hifriend - run and supervise the hi-friend Ruby language server.
//!
//! This is the main entry point for the hifriend CLI.

mod commands;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use commands::*;
use hifriend_lsp::{SupervisorConfig, TraceLevel};
use tracing::debug;

#[derive(Parser)]
#[command(name = "hifriend")]
#[command(author, version, about = "Run and supervise the hi-friend Ruby language server", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the hi-friend executable
    #[arg(long, global = true)]
    server_path: Option<String>,

    /// Server trace level (off, messages, verbose)
    #[arg(long, global = true)]
    trace: Option<TraceLevel>,

    /// Write logs to the log directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the hi-friend version used for a project
    Version {
        /// Project directory (defaults to the current directory)
        dir: Option<PathBuf>,
    },
    /// Start hi-friend, print the address it reports, then stop it
    Handshake {
        /// Project directory (defaults to the current directory)
        dir: Option<PathBuf>,
    },
    /// Supervise hi-friend and bridge stdin/stdout to it
    Serve {
        /// Workspace folders (defaults to the current directory)
        #[arg(num_args = 0..)]
        dirs: Vec<PathBuf>,
    },
    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_file = init_logging(cli.verbose, cli.log_file);
    if let Some(path) = &log_file {
        debug!(path = %path.display(), "logging to file");
    }

    let cwd = std::env::current_dir()?;
    let project_dir = match &cli.command {
        Commands::Version { dir } | Commands::Handshake { dir } => dir.clone(),
        Commands::Serve { dirs } => dirs.first().cloned(),
        Commands::Config => None,
    }
    .unwrap_or_else(|| cwd.clone());

    let (config, sources) = SupervisorConfig::load(Some(&project_dir)).await?;
    let config = apply_overrides(config, cli.server_path, cli.trace);

    match cli.command {
        Commands::Version { dir } => run_version(&dir.unwrap_or(cwd), &config).await,
        Commands::Handshake { dir } => run_handshake(&dir.unwrap_or(cwd), &config).await,
        Commands::Serve { dirs } => run_serve(folders(dirs, cwd)?, config).await,
        Commands::Config => show_config(&config, &sources),
    }
}

/// Command-line flags win over every config file.
fn apply_overrides(
    config: SupervisorConfig,
    server_path: Option<String>,
    trace: Option<TraceLevel>,
) -> SupervisorConfig {
    let config = match server_path {
        Some(path) => config.with_server_path(path),
        None => config,
    };
    match trace {
        Some(level) => config.with_trace(level),
        None => config,
    }
}

fn show_config(config: &SupervisorConfig, sources: &[impl AsRef<Path>]) -> anyhow::Result<()> {
    println!("Configuration sources:");
    if sources.is_empty() {
        println!("  (none)");
    } else {
        for source in sources {
            println!("  {}", source.as_ref().display());
        }
    }
    println!();

    println!("Current configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);

    Ok(())
}
