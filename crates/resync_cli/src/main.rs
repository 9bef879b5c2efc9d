//! resync CLI
//!
//! Command-line tools for resync configuration and load simulation.
//!
//! # Commands
//!
//! - `simulate` - Run concurrent reconciliation against a simulated backend
//! - `config` - Load and validate a provider configuration file
//! - `timeouts` - Print the operation timeout table

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// resync command-line tools.
#[derive(Parser)]
#[command(name = "resync")]
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
    /// Run concurrent reconciliation against a simulated backend
    Simulate {
        /// Number of pooled clients
        #[arg(short, long, default_value_t = resync_core::DEFAULT_POOL_CAPACITY)]
        pool_size: usize,

        /// Number of concurrent workers
        #[arg(short, long, default_value = "8")]
        workers: usize,

        /// Number of resources to reconcile
        #[arg(short, long, default_value = "50")]
        resources: usize,

        /// Version conflicts injected per resource
        #[arg(short, long, default_value = "1")]
        conflicts: u32,

        /// Propagation lag in milliseconds
        #[arg(short, long, default_value = "20")]
        lag: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Load and validate a provider configuration file
    Config {
        /// Path to the JSON configuration file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Print the operation timeout table
    Timeouts {
        /// Read overrides from a configuration file
        #[arg(short, long)]
        file: Option<PathBuf>,
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
            pool_size,
            workers,
            resources,
            conflicts,
            lag,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                pool_size,
                workers,
                resources,
                conflicts,
                lag_ms: lag,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::Config { file } => {
            commands::config::run(&file)?;
        }
        Commands::Timeouts { file } => {
            commands::timeouts::run(file.as_deref())?;
        }
        Commands::Version => {
            println!("resync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("resync core v{}", resync_core::VERSION);
        }
    }

    Ok(())
}
