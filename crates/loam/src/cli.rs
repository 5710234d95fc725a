use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use loam::StorageBackend;

#[derive(Parser)]
#[command(name = "loam", about = "Inspect loam storage locations", version)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress human-readable output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Storage backend the location was written with
    #[arg(long, global = true, value_enum, default_value = "file")]
    pub backend: BackendArg,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Lease holder, configuration and log counts of a location
    Status {
        /// Storage location directory
        dir: PathBuf,
    },

    /// List mutation log entries
    Log {
        /// Storage location directory
        dir: PathBuf,

        /// Only entries with this sync status (localOnly, pending, synced)
        #[arg(long)]
        status: Option<String>,
    },

    /// Write a portable image of one store
    Export {
        /// Storage location directory
        dir: PathBuf,

        /// Store to export
        #[arg(long, value_enum)]
        what: ExportWhat,

        /// Output file
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum BackendArg {
    File,
    Blob,
}

impl From<BackendArg> for StorageBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::File => StorageBackend::File,
            BackendArg::Blob => StorageBackend::Blob,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ExportWhat {
    App,
    Log,
}
