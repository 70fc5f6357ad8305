//! plprofiler CLI
//!
//! Administration of the shared statement-profile region: create it,
//! inspect it, reset stored profiles and dump raw chunks.

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Env;
use plprofiler::commands::{
    display_schema, display_version, execute_dump, execute_info, execute_init, execute_reset,
};
use plprofiler::model::UnitKey;
use plprofiler::utils::config::{MAX_SHARED_CHUNKS, MAX_UNIT_STATS, REGION_PATH_ENV};
use std::path::PathBuf;

/// plprofiler - per-statement profiling for procedural code
#[derive(Parser, Debug)]
#[command(name = "plprofiler")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a shared region file (validates an existing one)
    Init {
        /// Path to the region file
        #[arg(short, long, env = REGION_PATH_ENV)]
        region: PathBuf,

        /// Number of chunks the region can hold
        #[arg(short, long, default_value_t = MAX_SHARED_CHUNKS)]
        capacity: usize,

        /// Number of procedures with call statistics
        #[arg(long, default_value_t = MAX_UNIT_STATS)]
        units: usize,
    },

    /// Show capacity and usage of a region
    Info {
        /// Path to the region file
        #[arg(short, long, env = REGION_PATH_ENV)]
        region: PathBuf,
    },

    /// Remove stored profiles
    Reset {
        /// Path to the region file
        #[arg(short, long, env = REGION_PATH_ENV)]
        region: PathBuf,

        /// Only this procedure (object id)
        #[arg(long, requires = "db")]
        unit: Option<u32>,

        /// Database owning the procedure
        #[arg(long, requires = "unit")]
        db: Option<u32>,
    },

    /// Write every stored chunk to a JSON file
    Dump {
        /// Path to the region file
        #[arg(short, long, env = REGION_PATH_ENV)]
        region: PathBuf,

        /// Output path for the JSON dump
        #[arg(short, long, default_value = "region-dump.json")]
        output: PathBuf,
    },

    /// Display report schema information
    Schema {
        /// Show full schema details
        #[arg(long)]
        show: bool,
    },

    /// Display version information
    Version,
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    // Execute command
    match cli.command {
        Commands::Init {
            region,
            capacity,
            units,
        } => {
            execute_init(&region, capacity, units)?;
        }

        Commands::Info { region } => {
            execute_info(&region)?;
        }

        Commands::Reset { region, unit, db } => {
            let unit = unit.zip(db).map(|(unit_id, db_id)| UnitKey::new(unit_id, db_id));
            execute_reset(&region, unit)?;
        }

        Commands::Dump { region, output } => {
            execute_dump(&region, &output)?;
        }

        Commands::Schema { show } => {
            display_schema(show);
        }

        Commands::Version => {
            display_version();
        }
    }

    Ok(())
}
