//! Atelier CLI
//!
//! Command-line tools for atelier store directories.
//!
//! # Commands
//!
//! - `inspect` - Display record counts, queue size and log statistics
//! - `queue` - List sync queue entries
//! - `verify` - Verify record log integrity
//! - `compact` - Rewrite the record log as a single snapshot

mod commands;
mod error;

use clap::{Parser, Subcommand, ValueEnum};
use error::CliError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Atelier store tools.
#[derive(Parser)]
#[command(name = "atelier")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display record counts, queue size and log statistics
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List sync queue entries
    Queue {
        /// Only dead-lettered entries
        #[arg(short, long)]
        dead: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Verify record log integrity
    Verify,

    /// Rewrite the record log as a single snapshot
    Compact {
        /// Show the current log size without compacting
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or(CliError::MissingPath("inspect"))?;
            commands::inspect::run(&path, format)?;
        }
        Commands::Queue { dead, format } => {
            let path = cli.path.ok_or(CliError::MissingPath("queue"))?;
            commands::queue::run(&path, dead, format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or(CliError::MissingPath("verify"))?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or(CliError::MissingPath("compact"))?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("atelier CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("record log format v{}", atelier_core::log::FRAME_VERSION);
        }
    }

    Ok(())
}
