//! Machine lifecycle: resolve, delete and recreate control-plane Machines

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tracing::{info, warn};

use phoenix_common::crd::{parse_machine_reference, Machine, MACHINE_ANNOTATION};
use phoenix_common::kube_utils::annotation;
use phoenix_common::{retry_while, Error, Result};

use crate::client::ClusterStateClient;
use crate::config::MachineCreateConfig;

/// Namespace and name of a Machine
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct MachineRef {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl std::fmt::Display for MachineRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resolves, deletes and recreates Machines
pub struct MachineLifecycleManager {
    client: Arc<dyn ClusterStateClient>,
    create: MachineCreateConfig,
}

impl MachineLifecycleManager {
    /// Create a manager
    pub fn new(client: Arc<dyn ClusterStateClient>, create: MachineCreateConfig) -> Self {
        Self { client, create }
    }

    /// The Machine backing `node`, from its reference annotation
    pub fn resolve_machine(&self, node: &Node) -> Result<MachineRef> {
        let node_name = node.metadata.name.as_deref().unwrap_or_default();
        let value = annotation(&node.metadata, MACHINE_ANNOTATION).ok_or_else(|| {
            Error::machine_reference(node_name, format!("annotation {MACHINE_ANNOTATION} missing"))
        })?;
        let (namespace, name) = parse_machine_reference(value).ok_or_else(|| {
            Error::machine_reference(node_name, format!("malformed reference {value:?}"))
        })?;
        Ok(MachineRef { namespace, name })
    }

    /// Fetch a Machine
    pub async fn get(&self, machine: &MachineRef) -> Result<Machine> {
        self.client
            .get_machine(&machine.namespace, &machine.name)
            .await
    }

    /// Delete a Machine. Returns `false` when it was already gone.
    pub async fn delete(&self, machine: &MachineRef) -> Result<bool> {
        match self
            .client
            .delete_machine(&machine.namespace, &machine.name)
            .await
        {
            Ok(()) => {
                info!(machine = %machine, "Machine deleted");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                info!(machine = %machine, "Machine already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a Machine named `name` from `template`, retrying while a
    /// previous object of the same name is still finalizing
    pub async fn create_like(&self, template: &Machine, name: &str) -> Result<Machine> {
        let machine = clone_machine_template(template, name);
        let retry = self.create.retry();
        let operation = format!("create Machine {name}");

        let result = retry_while(&retry, &operation, Error::is_already_exists, || {
            self.client.create_machine(&machine)
        })
        .await;

        match result {
            Ok(created) => {
                info!(machine = %name, "Machine created");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                warn!(machine = %name, attempts = retry.attempts(), "Machine name never freed up");
                Err(Error::RetriesExhausted {
                    operation,
                    attempts: retry.attempts(),
                    last_error: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Deep copy of `template` ready to be created as `name`.
///
/// Server-assigned identity, the cloud instance binding, annotations,
/// lifecycle hooks and status are cleared so the provider provisions a fresh
/// instance. Everything else (provider spec, labels, taints) is kept.
pub fn clone_machine_template(template: &Machine, name: &str) -> Machine {
    let mut machine = template.clone();
    let meta = &mut machine.metadata;
    meta.name = Some(name.to_string());
    meta.generate_name = None;
    meta.resource_version = None;
    meta.uid = None;
    meta.self_link = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.finalizers = None;
    meta.annotations = None;

    machine.spec.provider_id = None;
    machine.spec.lifecycle_hooks = None;
    machine.status = None;
    machine
}
