//! `phoenix redeploy` - force convergence-gated operand redeploys

use clap::Args;
use tracing::info;

use phoenix_common::crd::Operand;
use phoenix_recovery::OperandRedeploymentController;

use super::{cluster_client, load_config, render};
use crate::{GlobalOptions, Result};

/// Force new revisions of static-pod operands, one at a time
#[derive(Args, Debug)]
pub struct RedeployArgs {
    /// Operands to redeploy (always run in canonical order); defaults to the configured list
    pub operands: Vec<Operand>,
}

/// Run the redeploy command.
pub async fn run(global: &GlobalOptions, args: RedeployArgs) -> Result<()> {
    let config = load_config(global.config.as_deref())?;
    let operands = if args.operands.is_empty() {
        config.ordered_operands()
    } else {
        Operand::canonical_order(&args.operands)
    };

    let client = cluster_client(global.kubeconfig.as_deref()).await?;
    let controller =
        OperandRedeploymentController::new(client, config.timeouts.redeploy.poll_spec());

    let rollouts = controller.redeploy_all(&operands).await?;
    info!(operands = rollouts.len(), "operands redeployed");
    print!("{}", render(&rollouts, global.output)?);
    Ok(())
}
