//! CLI argument parsing for the daemon binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ce")]
#[command(author, version, about = "Self-improving code generation daemon", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human output
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate code for a natural-language task
    Generate {
        /// The task description
        #[arg(required = true)]
        text: String,

        /// Representative JSON input used to verify candidates
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Run a saved node with a JSON payload on stdin
    Run {
        /// Node id (see `ce list`)
        #[arg(required = true)]
        node_id: String,

        /// The JSON object fed to the node
        #[arg(required = true)]
        input_json: String,

        /// Wall-clock timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// List saved nodes
    List,

    /// List registered tools
    Tools,

    /// Search the artifact memory by meaning
    Search {
        /// Query text
        #[arg(required = true)]
        text: String,

        /// Maximum hits
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}
