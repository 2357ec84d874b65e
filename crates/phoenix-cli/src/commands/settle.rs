//! `phoenix settle` - wait for cluster operators to settle

use clap::Args;
use tracing::info;

use phoenix_common::PollSpec;
use phoenix_recovery::ClusterSettleMonitor;

use super::{cluster_client, load_config, render};
use crate::{GlobalOptions, Result};

/// Wait for every cluster operator to report Available=True, Progressing=False, Degraded=False
#[derive(Args, Debug)]
pub struct SettleArgs {
    /// Check once and fail immediately when unsettled
    #[arg(long)]
    pub once: bool,

    /// Override the settle timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Run the settle command.
pub async fn run(global: &GlobalOptions, args: SettleArgs) -> Result<()> {
    let config = load_config(global.config.as_deref())?;
    let client = cluster_client(global.kubeconfig.as_deref()).await?;
    let monitor = ClusterSettleMonitor::new(client, config.settle_exemption.clone());

    let report = if args.once {
        let report = monitor.snapshot().await?;
        if !report.is_settled() {
            return Err(report.into_error().into());
        }
        report
    } else {
        let mut spec = config.timeouts.settle.poll_spec();
        if let Some(secs) = args.timeout {
            spec = PollSpec::new(std::time::Duration::from_secs(secs), spec.interval);
        }
        monitor.wait_for_settle(spec).await?
    };

    info!(operators = report.operators.len(), "all cluster operators settled");
    print!("{}", render(&report, global.output)?);
    Ok(())
}
