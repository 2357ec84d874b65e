//! Quorum guard release valve
//!
//! The guard deployment keeps a pod per consensus member and, through its
//! disruption budget, blocks anything that would drop a member. Recovery
//! drops members on purpose, so the guard is scaled to zero first and put
//! back to its previous size at the end.

use std::sync::Arc;

use tracing::info;

use phoenix_common::{Error, Result};

use crate::client::ClusterStateClient;
use crate::config::QuorumGuardConfig;

/// Scales the quorum guard down and back up
pub struct QuorumGuardController {
    client: Arc<dyn ClusterStateClient>,
    config: QuorumGuardConfig,
    original_replicas: Option<i32>,
}

impl QuorumGuardController {
    /// Create a controller for the configured guard
    pub fn new(client: Arc<dyn ClusterStateClient>, config: QuorumGuardConfig) -> Self {
        Self {
            client,
            config,
            original_replicas: None,
        }
    }

    /// Replica count observed before [`disable`](Self::disable)
    pub fn original_replicas(&self) -> Option<i32> {
        self.original_replicas
    }

    /// Remember the current replica count and scale to zero.
    ///
    /// Calling this twice keeps the first remembered count.
    pub async fn disable(&mut self) -> Result<i32> {
        let QuorumGuardConfig {
            namespace,
            deployment,
        } = &self.config;

        let current = self
            .client
            .get_deployment_replicas(namespace, deployment)
            .await?;
        let original = *self.original_replicas.get_or_insert(current);

        self.client.scale_deployment(namespace, deployment, 0).await?;
        info!(
            deployment = %deployment,
            namespace = %namespace,
            replicas = original,
            "quorum guard scaled to 0"
        );
        Ok(original)
    }

    /// Scale back to the remembered replica count
    pub async fn enable(&self) -> Result<i32> {
        let replicas = self.original_replicas.ok_or_else(|| {
            Error::internal_with_context("quorum_guard", "enable called before disable")
        })?;
        let QuorumGuardConfig {
            namespace,
            deployment,
        } = &self.config;

        self.client
            .scale_deployment(namespace, deployment, replicas)
            .await?;
        info!(
            deployment = %deployment,
            namespace = %namespace,
            replicas,
            "quorum guard restored"
        );
        Ok(replicas)
    }
}
