//! Command-line interface for Tandem.

use crate::config::ClusterConfig;
use crate::error::{Result, TandemError};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Tandem - administrative tool for database clusters kept in lockstep.
#[derive(Parser)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TANDEM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "TANDEM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Validate a cluster configuration file
    Validate,

    /// Inspect or reset persisted cluster membership
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Show upcoming runs of the configured sweep schedules
    Schedule {
        /// Number of runs to show per schedule
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Show version information
    Version,
}

/// Persisted state subcommands.
#[derive(Subcommand)]
pub enum StateCommands {
    /// Show the persisted active set of every cluster in the state file
    Show {
        /// State file (defaults to the one in the configuration)
        #[arg(long)]
        state_file: Option<PathBuf>,
    },

    /// Discard the persisted active set of a cluster
    Clear {
        /// Cluster id (defaults to the one in the configuration)
        #[arg(long)]
        cluster: Option<String>,

        /// State file (defaults to the one in the configuration)
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Load the configuration named on the command line, or the defaults.
    pub fn load_config(&self) -> Result<ClusterConfig> {
        match &self.config {
            Some(path) => ClusterConfig::from_file(path),
            None => Ok(ClusterConfig::default()),
        }
    }
}

/// Pick the state file from an explicit flag or the configuration.
pub fn resolve_state_file<'a>(
    explicit: Option<&'a Path>,
    config: &'a ClusterConfig,
) -> Result<&'a Path> {
    explicit
        .or(config.state_file.as_deref())
        .ok_or_else(|| TandemError::Config("no state file configured; pass --state-file".to_string()))
}
