//! phoenix: recover a control plane that lost etcd quorum

use std::process::ExitCode;

use clap::Parser;
use phoenix_common::telemetry::{init_telemetry, TelemetryConfig};

use phoenix_cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        format: cli.log_format.into(),
        ..Default::default()
    };
    let _guard = match init_telemetry(telemetry) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            if let Some(table) = e.diagnostics() {
                eprintln!("\n{table}");
            }
            ExitCode::FAILURE
        }
    }
}
