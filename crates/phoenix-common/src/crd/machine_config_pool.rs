//! MachineConfigPool: rollout state of node configuration for a node role

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::{
    is_condition_false, is_condition_true, Condition, CONDITION_DEGRADED, CONDITION_UPDATED,
    CONDITION_UPDATING,
};

/// Pool containing the control-plane nodes
pub const CONTROL_PLANE_POOL: &str = "master";

/// MachineConfigPool spec (not interpreted)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "MachineConfigPool",
    plural = "machineconfigpools",
    status = "MachineConfigPoolStatus",
    schema = "disabled"
)]
pub struct MachineConfigPoolSpec {
    /// Unused fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Observed rollout state of a pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolStatus {
    /// Updated / Updating / Degraded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Machines in the pool
    #[serde(default)]
    pub machine_count: i32,

    /// Machines running the desired configuration
    #[serde(default)]
    pub updated_machine_count: i32,

    /// Machines that failed to apply configuration
    #[serde(default)]
    pub degraded_machine_count: i32,
}

impl MachineConfigPool {
    /// Reported conditions
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Converged: Updated=True, Updating=False, Degraded=False
    pub fn is_converged(&self) -> bool {
        let conditions = self.conditions();
        is_condition_true(conditions, CONDITION_UPDATED)
            && is_condition_false(conditions, CONDITION_UPDATING)
            && is_condition_false(conditions, CONDITION_DEGRADED)
    }
}
