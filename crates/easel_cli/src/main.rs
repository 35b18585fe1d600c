//! Easel CLI
//!
//! Command-line tools for Easel undo/redo and sync.
//!
//! # Commands
//!
//! - `simulate` - Run several editors against an in-process hub and check convergence
//! - `inspect` - Summarize a full-state dump

mod commands;
mod error;

use clap::{Parser, Subcommand};
use commands::simulate::SimulateOptions;
use easel_engine::HistoryConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Easel sync tools.
#[derive(Parser)]
#[command(name = "easel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run random edits on several editors and check they converge
    Simulate {
        /// Number of editors
        #[arg(short, long, default_value = "3")]
        clients: usize,

        /// Number of random actions
        #[arg(short, long, default_value = "200")]
        steps: usize,

        /// RNG seed
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Upload a full document every N steps
        #[arg(short, long)]
        upload_every: Option<usize>,

        /// History capacity of each editor
        #[arg(long, default_value_t = HistoryConfig::default().max_entries)]
        history_limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Summarize a full-state JSON dump
    Inspect {
        /// Path to the dump
        path: PathBuf,

        /// List the clients that produced trailing events
        #[arg(short, long)]
        clients: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            clients,
            steps,
            seed,
            upload_every,
            history_limit,
            format,
        } => {
            let options = SimulateOptions {
                clients,
                steps,
                seed,
                upload_every,
                history_limit,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::Inspect {
            path,
            clients,
            format,
        } => {
            commands::inspect::run(&path, clients, &format)?;
        }
        Commands::Version => {
            println!("Easel CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
