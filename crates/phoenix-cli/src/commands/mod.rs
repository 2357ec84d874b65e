//! CLI commands

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use phoenix_common::kube_utils::create_client;
use phoenix_recovery::{ClusterStateClient, KubeClusterClient, RecoveryConfig};

use crate::{Error, OutputFormat, Result};

pub mod recover;
pub mod redeploy;
pub mod settle;

/// Load the recovery configuration, or defaults when no file is given
pub fn load_config(path: Option<&Path>) -> Result<RecoveryConfig> {
    let Some(path) = path else {
        debug!("no configuration file, using defaults");
        return Ok(RecoveryConfig::default());
    };
    let yaml = std::fs::read_to_string(path)?;
    let config = RecoveryConfig::from_yaml(&yaml).map_err(|e| Error::config(path, e))?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Cluster client for the resolved kubeconfig
pub async fn cluster_client(kubeconfig: Option<&Path>) -> Result<Arc<dyn ClusterStateClient>> {
    let client = create_client(kubeconfig).await?;
    Ok(Arc::new(KubeClusterClient::new(client)))
}

/// Render a report for stdout
pub fn render<T: Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
    })
}
