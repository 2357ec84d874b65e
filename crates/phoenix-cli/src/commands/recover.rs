//! `phoenix recover` - run the full quorum-loss recovery

use std::sync::Arc;

use clap::Args;
use tracing::info;

use phoenix_recovery::{QuorumLossRecoveryOrchestrator, RecoveryConfig, SshExecutor};

use super::{cluster_client, load_config, render};
use crate::{Error, GlobalOptions, Result};

/// Run the full recovery
#[derive(Args, Debug)]
pub struct RecoverArgs {
    /// Node to keep and restore (chosen at random when omitted)
    #[arg(long)]
    pub survivor: Option<String>,

    /// Number of control-plane nodes to keep alive
    #[arg(long)]
    pub survivors: Option<usize>,

    /// SSH identity file for reaching control-plane hosts
    #[arg(long)]
    pub identity_file: Option<std::path::PathBuf>,

    /// Jump host for reaching control-plane hosts
    #[arg(long)]
    pub bastion: Option<String>,
}

impl RecoverArgs {
    /// Flags win over the configuration file
    pub fn apply(&self, mut config: RecoveryConfig) -> Result<RecoveryConfig> {
        if let Some(survivor) = &self.survivor {
            config.survivor = Some(survivor.clone());
        }
        if let Some(survivors) = self.survivors {
            config.survivors = survivors;
        }
        if let Some(identity) = &self.identity_file {
            config.ssh.identity_file = Some(identity.clone());
        }
        if let Some(bastion) = &self.bastion {
            config.ssh.bastion = Some(bastion.clone());
        }
        config
            .validate()
            .map_err(|e| Error::config("command line", e))?;
        Ok(config)
    }
}

/// Run the recover command.
pub async fn run(global: &GlobalOptions, args: RecoverArgs) -> Result<()> {
    let config = args.apply(load_config(global.config.as_deref())?)?;
    let client = cluster_client(global.kubeconfig.as_deref()).await?;
    let remote = Arc::new(SshExecutor::new(config.ssh.clone()));

    info!(
        survivor = config.survivor.as_deref().unwrap_or("<random>"),
        survivors = config.survivors,
        "starting quorum-loss recovery"
    );
    let report = QuorumLossRecoveryOrchestrator::new(config, client, remote)
        .run()
        .await?;

    print!("{}", render(&report, global.output)?);
    Ok(())
}
