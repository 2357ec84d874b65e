//! Forced, convergence-gated redeployment of static-pod operands
//!
//! Operands are redeployed one at a time in canonical order. The next
//! operand is not touched until the previous one reports
//! `NodeInstallerProgressing=False/AllNodesAtLatestRevision` *and* every node
//! runs a revision newer than the one observed before the redeploy. The
//! condition alone can still be stale from the previous rollout.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use phoenix_common::crd::Operand;
use phoenix_common::{poll_until, Error, PollSpec, Result};

use crate::client::ClusterStateClient;

/// Revisions observed around one operand redeploy
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperandRollout {
    /// Operand
    pub operand: Operand,
    /// Latest available revision before the redeploy
    pub revision_before: i64,
    /// Latest available revision once converged
    pub revision_after: i64,
    /// Reason value written to trigger the rollout
    pub reason: String,
}

/// Forces operand rollouts and waits for them to converge
pub struct OperandRedeploymentController {
    client: Arc<dyn ClusterStateClient>,
    poll: PollSpec,
}

impl OperandRedeploymentController {
    /// Create a controller polling each rollout with `poll`
    pub fn new(client: Arc<dyn ClusterStateClient>, poll: PollSpec) -> Self {
        Self { client, poll }
    }

    /// Redeploy every operand in canonical order, whatever order they were given in
    pub async fn redeploy_all(&self, operands: &[Operand]) -> Result<Vec<OperandRollout>> {
        let mut rollouts = Vec::new();
        for operand in Operand::canonical_order(operands) {
            let span = info_span!("redeploy", operand = %operand);
            rollouts.push(self.redeploy(operand).instrument(span).await?);
        }
        Ok(rollouts)
    }

    /// Force a new revision of `operand` and wait until every node runs it
    pub async fn redeploy(&self, operand: Operand) -> Result<OperandRollout> {
        let before = self.client.get_operand_status(operand).await?;
        let baseline = before.latest_available_revision;
        let reason = redeploy_reason(operand);

        info!(operand = %operand, revision = baseline, reason = %reason, "forcing redeployment");
        self.client
            .force_operand_redeployment(operand, &reason)
            .await?;

        let client = &self.client;
        let description = format!("{operand} to roll out past revision {baseline}");
        poll_until(&description, self.poll, || async move {
            let status = client.get_operand_status(operand).await?;
            let converged =
                status.all_nodes_at_latest_revision() && status.all_nodes_beyond(baseline);
            debug!(
                operand = %operand,
                latest = status.latest_available_revision,
                min_node_revision = ?status.min_node_revision(),
                converged,
                "operand rollout status"
            );
            Ok(converged)
        })
        .await?;

        let after = self.client.get_operand_status(operand).await?;
        info!(
            operand = %operand,
            before = baseline,
            after = after.latest_available_revision,
            "operand converged"
        );
        Ok(OperandRollout {
            operand,
            revision_before: baseline,
            revision_after: after.latest_available_revision,
            reason,
        })
    }

    /// Check every rolled-out operand still runs past its pre-redeploy
    /// revision on all nodes
    pub async fn verify(&self, rollouts: &[OperandRollout]) -> Result<()> {
        for rollout in rollouts {
            let status = self.client.get_operand_status(rollout.operand).await?;
            if !status.all_nodes_beyond(rollout.revision_before) {
                return Err(Error::invariant(format!(
                    "machine-config pool converged but {} nodes run revision {:?}, \
                     not past pre-redeploy revision {}",
                    rollout.operand,
                    status.min_node_revision(),
                    rollout.revision_before
                )));
            }
        }
        Ok(())
    }
}

/// A reason value never written before, so the operator cannot treat the
/// patch as a no-op
pub fn redeploy_reason(operand: Operand) -> String {
    format!(
        "phoenix-{}-{}-{}",
        operand,
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        Uuid::new_v4().simple()
    )
}
