//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Conductor - multi-agent orchestration engine
#[derive(Parser)]
#[command(
    name = "conductor",
    about = "Drive LLM-backed agents through a declarative process",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Execute a process file
    Execute {
        /// Path to the process JSON file
        process: PathBuf,

        /// Resume from persisted state when compatible
        #[arg(long)]
        resume: bool,

        /// Fail instead of starting fresh when resume is impossible
        #[arg(long, requires = "resume")]
        require_resume: bool,

        /// Override the state file path
        #[arg(long, value_name = "PATH")]
        state_path: Option<PathBuf>,

        /// Number of steps to run concurrently
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,
    },

    /// Load and validate a process file without executing it
    Validate {
        /// Path to the process JSON file
        process: PathBuf,
    },

    /// Write a reference process file
    Example {
        /// Where to write the example
        outpath: PathBuf,
    },
}
