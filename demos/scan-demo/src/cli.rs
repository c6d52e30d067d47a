use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "scan-demo", version, about = "Source Manager demo: runs one example source and drains its chunks")]
pub struct Cli {
    #[command(subcommand)]
    pub source: SourceCommand,

    /// Upper bound on concurrently chunking units for unit-aware sources.
    #[arg(long, default_value_t = 8)]
    pub unit_concurrency: usize,

    /// Print the full `SourceMetadata` for each chunk instead of a summary line.
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum SourceCommand {
    /// Walk a directory tree, one unit per file.
    Filesystem {
        /// Root directory to enumerate.
        root: PathBuf,
    },
    /// Read a newline-delimited JSON bundle file as a monolithic source.
    JsonBundle {
        /// Path to the bundle file.
        path: PathBuf,
    },
}
