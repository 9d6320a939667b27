//! clonedr CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use clonedr_common::telemetry::LogFormat;

/// clonedr - disaster recovery for CloudNativePG clusters
#[derive(Parser, Debug)]
#[command(name = "clonedr")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "CLONEDR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to kubeconfig file (defaults to in-cluster or KUBECONFIG)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

/// Log format flag values
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// One JSON object per line
    Json,
    /// Human-readable lines
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dump a cluster's databases to the DR volume via a disposable clone
    Backup(commands::backup::BackupArgs),
    /// Restore a dump from the DR volume into a cluster
    Restore(commands::restore::RestoreArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let config = config::CliConfig::load(self.config.as_deref())?;
        match self.command {
            Commands::Backup(args) => {
                commands::backup::run(args, &config, self.kubeconfig.as_deref()).await
            }
            Commands::Restore(args) => {
                commands::restore::run(args, &config, self.kubeconfig.as_deref()).await
            }
        }
    }
}
