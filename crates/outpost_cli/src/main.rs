//! Outpost CLI
//!
//! Command-line tools for exercising the Outpost sync stack.
//!
//! # Commands
//!
//! - `simulate` - Run sync cycles between an in-process authority and facility nodes
//! - `plan-chunks` - Plan pull chunks over a synthetic id space
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Outpost command-line sync tools.
#[derive(Parser)]
#[command(name = "outpost")]
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
    /// Run sync cycles between an in-process authority and facility nodes
    Simulate {
        /// Number of facilities, one node each
        #[arg(short, long, default_value = "2")]
        facilities: usize,

        /// Patients assigned to each facility
        #[arg(long, default_value = "3")]
        patients: usize,

        /// Encounters per patient in the seed
        #[arg(long, default_value = "2")]
        encounters: usize,

        /// Sync rounds to run
        #[arg(short, long, default_value = "3")]
        rounds: usize,

        /// Authority chunk size (ignored with --server-config)
        #[arg(short, long, default_value = "1000")]
        chunk_size: usize,

        /// Authority configuration (JSON)
        #[arg(long)]
        server_config: Option<PathBuf>,

        /// Node configuration template (JSON); node id and scopes are overridden
        #[arg(long)]
        node_config: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Plan pull chunks over a synthetic id space
    PlanChunks {
        /// Number of dirty rows
        #[arg(short, long)]
        rows: usize,

        /// Maximum rows per chunk
        #[arg(short, long)]
        chunk_size: usize,

        /// Treat ids as integers and bisect numerically
        #[arg(short, long)]
        numeric: bool,

        /// Print at most this many ranges
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            facilities,
            patients,
            encounters,
            rounds,
            chunk_size,
            server_config,
            node_config,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                facilities,
                patients_per_facility: patients,
                encounters_per_patient: encounters,
                rounds,
                chunk_size,
                server_config,
                node_config,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::PlanChunks {
            rows,
            chunk_size,
            numeric,
            limit,
            format,
        } => {
            commands::plan_chunks::run(rows, chunk_size, numeric, limit, &format)?;
        }
        Commands::Version => {
            println!("Outpost CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Sync protocol v{}", outpost_sync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
