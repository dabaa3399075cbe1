//! Maintenance CLI for the shared build cache.
//!
//! Exit codes: 0 on success, 1 on user error (invalid argument,
//! inaccessible store root).

use std::process;

use clap::{Parser, Subcommand};

use dune_cache::{CacheConfig, Layout, TrimGoal, TrimResult, Trimmer};

#[derive(Parser)]
#[command(name = "dune-cache")]
#[command(about = "Maintain the shared build cache", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reclaim bytes: drop broken metadata, then evict unused file entries
    Trim {
        /// Reduce the overhead size to at most this many bytes
        #[arg(long, value_name = "BYTES", conflicts_with = "trimmed_size")]
        size: Option<u64>,

        /// Free at least this many bytes
        #[arg(long, value_name = "BYTES")]
        trimmed_size: Option<u64>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Drop broken metadata entries only; never touches file entries
    Gc {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Report the overhead size (bytes held by unused file entries)
    Size,

    /// Withdrawn daemon-mode subcommand
    #[command(hide = true)]
    Start,

    /// Withdrawn daemon-mode subcommand
    #[command(hide = true)]
    Stop,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Trim {
            size,
            trimmed_size,
            json,
        } => {
            let goal = match (size, trimmed_size) {
                (Some(bytes), None) => TrimGoal::Size(bytes),
                (None, Some(bytes)) => TrimGoal::Freed(bytes),
                _ => {
                    eprintln!("Error: trim requires exactly one of --size or --trimmed-size");
                    process::exit(1);
                }
            };
            run_trim(goal, json);
        }
        Commands::Gc { json } => run_gc(json),
        Commands::Size => run_size(),
        Commands::Start | Commands::Stop => {
            eprintln!("Error: daemon-mode has been withdrawn; the cache is accessed directly");
            process::exit(1);
        }
    }
}

fn trimmer() -> Trimmer {
    let config = match CacheConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    Trimmer::new(Layout::new(config.root))
}

fn run_trim(goal: TrimGoal, json: bool) {
    match trimmer().trim(goal) {
        Ok(result) => report(&result, json),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_gc(json: bool) {
    match trimmer().garbage_collect() {
        Ok(result) => report(&result, json),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_size() {
    match trimmer().overhead_size() {
        Ok(bytes) => println!("{}", bytes),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn report(result: &TrimResult, json: bool) {
    for warning in &result.warnings {
        eprintln!("Warning: {}", warning);
    }
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
    } else {
        println!("Freed {} bytes", result.freed_bytes);
    }
}
