//! Machine: the cloud-provisioning record backing a Node
//!
//! Only the fields recovery reads or clears are typed; everything else in
//! spec and status is carried through untouched so a clone of a surviving
//! Machine provisions an identical replacement.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespace holding control-plane Machines
pub const MACHINE_NAMESPACE: &str = "openshift-machine-api";

/// Node annotation pointing at the Machine that backs it (`<namespace>/<name>`)
pub const MACHINE_ANNOTATION: &str = "machine.openshift.io/machine";

/// Machine phase once the instance is provisioned and linked to a Node
pub const MACHINE_PHASE_RUNNING: &str = "Running";

/// Desired state of a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    namespaced,
    status = "MachineStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Cloud instance identifier, set by the provider once provisioned
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Lifecycle hooks registered by other controllers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_hooks: Option<Value>,

    /// Provider spec, taints and anything else we don't interpret
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Observed state of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Lifecycle phase (Provisioning, Running, Deleting, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Everything else
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Machine {
    /// Lifecycle phase, if reported
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }

    /// True once the provider reports the machine as Running
    pub fn is_running(&self) -> bool {
        self.phase() == Some(MACHINE_PHASE_RUNNING)
    }
}

/// Parse a Machine reference annotation value.
///
/// Accepts `<namespace>/<name>` or a bare `<name>` (resolved in
/// [`MACHINE_NAMESPACE`]). Returns `None` for empty or malformed values.
pub fn parse_machine_reference(value: &str) -> Option<(String, String)> {
    let value = value.trim();
    match value.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Some((ns.to_string(), name.to_string()))
        }
        Some(_) => None,
        None if !value.is_empty() => Some((MACHINE_NAMESPACE.to_string(), value.to_string())),
        None => None,
    }
}
