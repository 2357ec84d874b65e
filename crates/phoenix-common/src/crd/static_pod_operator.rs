//! Static-pod operand operators (etcd, kube-apiserver, ...)
//!
//! Each operand is managed through a cluster-scoped singleton named `cluster`
//! under `operator.openshift.io/v1`. The four kinds share one status shape, so
//! they are read as `DynamicObject`s and the status decoded into
//! [`StaticPodOperatorStatus`].

use std::fmt;
use std::str::FromStr;

use kube::api::DynamicObject;
use kube::core::ApiResource;
use serde::{Deserialize, Serialize};

use super::condition::{
    find_condition, Condition, CONDITION_NODE_INSTALLER_PROGRESSING,
    REASON_ALL_NODES_AT_LATEST_REVISION,
};
use crate::Error;

/// API version shared by every operand operator object
pub const OPERATOR_API_VERSION: &str = "operator.openshift.io/v1";

/// Name of the singleton operator object
pub const OPERATOR_OBJECT_NAME: &str = "cluster";

/// Spec field bumped to force a new revision rollout
pub const FORCE_REDEPLOYMENT_FIELD: &str = "forceRedeploymentReason";

/// A control-plane operand redeployed through revisioned static pods.
///
/// The declaration order is the redeploy order: later operands depend on
/// earlier ones being stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operand {
    /// Consensus store
    Etcd,
    /// API server
    KubeApiserver,
    /// Controller manager
    KubeControllerManager,
    /// Scheduler
    KubeScheduler,
}

impl Operand {
    /// All operands in redeploy order
    pub const ALL: [Operand; 4] = [
        Operand::Etcd,
        Operand::KubeApiserver,
        Operand::KubeControllerManager,
        Operand::KubeScheduler,
    ];

    /// Short name, as used in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Operand::Etcd => "etcd",
            Operand::KubeApiserver => "kube-apiserver",
            Operand::KubeControllerManager => "kube-controller-manager",
            Operand::KubeScheduler => "kube-scheduler",
        }
    }

    /// Kind of the operator object
    pub fn kind(&self) -> &'static str {
        match self {
            Operand::Etcd => "Etcd",
            Operand::KubeApiserver => "KubeAPIServer",
            Operand::KubeControllerManager => "KubeControllerManager",
            Operand::KubeScheduler => "KubeScheduler",
        }
    }

    /// Plural resource name of the operator object
    pub fn plural(&self) -> &'static str {
        match self {
            Operand::Etcd => "etcds",
            Operand::KubeApiserver => "kubeapiservers",
            Operand::KubeControllerManager => "kubecontrollermanagers",
            Operand::KubeScheduler => "kubeschedulers",
        }
    }

    /// ApiResource for the operator object
    pub fn api_resource(&self) -> ApiResource {
        let mut ar = crate::kube_utils::build_api_resource(OPERATOR_API_VERSION, self.kind());
        ar.plural = self.plural().to_string();
        ar
    }

    /// Sort and de-duplicate a list of operands into redeploy order
    pub fn canonical_order(operands: &[Operand]) -> Vec<Operand> {
        let mut ordered = operands.to_vec();
        ordered.sort();
        ordered.dedup();
        ordered
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "etcd" => Ok(Operand::Etcd),
            "kube-apiserver" | "kubeapiserver" | "apiserver" => Ok(Operand::KubeApiserver),
            "kube-controller-manager" | "kubecontrollermanager" => {
                Ok(Operand::KubeControllerManager)
            }
            "kube-scheduler" | "kubescheduler" => Ok(Operand::KubeScheduler),
            other => Err(Error::validation(format!("unknown operand: {other}"))),
        }
    }
}

/// Per-node rollout state
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node name
    pub node_name: String,
    /// Revision currently running on the node
    #[serde(default)]
    pub current_revision: i64,
    /// Revision being rolled out to the node
    #[serde(default)]
    pub target_revision: i64,
}

/// Status shared by every static-pod operator object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticPodOperatorStatus {
    /// Newest revision available for rollout
    #[serde(default)]
    pub latest_available_revision: i64,

    /// Operator conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Rollout state per control-plane node
    #[serde(default)]
    pub node_statuses: Vec<NodeStatus>,
}

impl StaticPodOperatorStatus {
    /// Decode the status of an operator object. A missing status decodes as
    /// the empty default.
    pub fn from_object(obj: &DynamicObject) -> Result<Self, Error> {
        match obj.data.get("status") {
            Some(status) => serde_json::from_value(status.clone()).map_err(|e| {
                Error::serialization(
                    obj.types
                        .as_ref()
                        .map(|t| t.kind.clone())
                        .unwrap_or_else(|| "StaticPodOperator".to_string()),
                    e.to_string(),
                )
            }),
            None => Ok(Self::default()),
        }
    }

    /// NodeInstallerProgressing=False with reason AllNodesAtLatestRevision
    pub fn all_nodes_at_latest_revision(&self) -> bool {
        find_condition(&self.conditions, CONDITION_NODE_INSTALLER_PROGRESSING).is_some_and(|c| {
            c.is_false() && c.reason.as_deref() == Some(REASON_ALL_NODES_AT_LATEST_REVISION)
        })
    }

    /// True when there is at least one node and every node runs a revision
    /// strictly greater than `baseline`
    pub fn all_nodes_beyond(&self, baseline: i64) -> bool {
        !self.node_statuses.is_empty()
            && self
                .node_statuses
                .iter()
                .all(|n| n.current_revision > baseline)
    }

    /// Lowest revision running on any node
    pub fn min_node_revision(&self) -> Option<i64> {
        self.node_statuses.iter().map(|n| n.current_revision).min()
    }
}
