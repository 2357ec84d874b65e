//! ClusterOperator: the status object each control-plane operator reports

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::Condition;

/// Name of the version entry that carries the operator's own version
pub const OPERATOR_VERSION_NAME: &str = "operator";

/// ClusterOperator spec (empty by API contract)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterOperator",
    plural = "clusteroperators",
    status = "ClusterOperatorStatus",
    schema = "disabled"
)]
pub struct ClusterOperatorSpec {
    /// Unused fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Observed state reported by an operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperatorStatus {
    /// Available / Progressing / Degraded and friends
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Versions of the operator and its operands
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<OperandVersion>,

    /// Objects the operator manages, including its namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_objects: Vec<RelatedObject>,
}

/// Reference to an object an operator manages
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RelatedObject {
    /// API group
    #[serde(default)]
    pub group: String,
    /// Plural resource
    pub resource: String,
    /// Namespace of a namespaced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Name
    pub name: String,
}

/// One named version entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct OperandVersion {
    /// Component name ("operator", "etcd", ...)
    pub name: String,
    /// Version string
    pub version: String,
}

impl ClusterOperator {
    /// Reported conditions (empty when the operator has no status yet)
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// The operator's own version, if reported
    pub fn version(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| {
            s.versions
                .iter()
                .find(|v| v.name == OPERATOR_VERSION_NAME)
                .map(|v| v.version.as_str())
        })
    }

    /// First namespace the operator lists among its related objects
    pub fn namespace(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| {
            s.related_objects
                .iter()
                .find(|o| o.resource == "namespaces")
                .map(|o| o.name.as_str())
        })
    }
}
