//! CLI argument parsing for the artifactstore admin binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "artifactstore")]
#[command(author, version, about = "Artifact memory admin tool", long_about = None)]
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
    /// List stored artifacts
    List {
        /// Restrict to one artifact kind (e.g. FUNCTION, PLAN, TOOL)
        #[arg(short, long)]
        kind: Option<String>,

        /// Keep artifacts carrying any of these tags
        #[arg(short, long)]
        tag: Vec<String>,

        /// Maximum entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Find artifacts by substring over name, description and tags
    Find {
        /// Text to look for
        #[arg(required = true)]
        text: String,

        /// Maximum entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show one artifact in full
    Get {
        /// Artifact id
        #[arg(required = true)]
        artifact_id: String,
    },

    /// Delete an artifact (the explicit admin path)
    Delete {
        /// Artifact id
        #[arg(required = true)]
        artifact_id: String,
    },

    /// Show store statistics
    Stats,
}
