//! Clap-derived CLI surface, using the `derive`-based `Parser`/`Subcommand` idiom.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ultra-engineer",
    version,
    about = "Drives a code-generation agent through a multi-phase issue workflow"
)]
pub struct Cli {
    /// Path to the YAML config file (default: `~/.ultra-engineer/config.yaml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Widen what gets logged (attempt counts, retry backoff, dependency edges).
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Append logs to this file in addition to stdout/stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the scheduler indefinitely over one or more repos.
    Daemon {
        /// Repository in owner/repo format. May be given multiple times;
        /// defaults to the config file's `repos` list.
        #[arg(long = "repo")]
        repos: Vec<String>,
    },

    /// Single-pass the state machine for one issue; exits when the next
    /// transition requires user input.
    Run {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        issue: u64,
    },

    /// Introspect labels and the latest state block for one or all issues.
    Status {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        issue: Option<u64>,
    },

    /// Add the `abort` label, post an abort comment, and flip to `failed`.
    Abort {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        issue: u64,
    },

    /// Print the version and exit.
    Version,
}
