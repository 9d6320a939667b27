//! clonedr CLI
//!
//! Backs up and restores CloudNativePG databases through disposable clones.

use clap::Parser;

use clonedr_cli::{Cli, Result};
use clonedr_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        filter: None,
    })?;

    cli.run().await
}
