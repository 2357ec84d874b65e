//! Access to the control-plane API
//!
//! Recovery only ever polls: every method is a single request/response call.
//! Kubernetes 404/409 responses surface as [`Error::NotFound`] and
//! [`Error::AlreadyExists`] so callers can match on them without knowing the
//! transport.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use phoenix_common::crd::{
    ClusterOperator, Machine, MachineConfigPool, Operand, StaticPodOperatorStatus,
    FORCE_REDEPLOYMENT_FIELD, OPERATOR_OBJECT_NAME,
};
use phoenix_common::kube_utils::is_control_plane;
use phoenix_common::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "phoenix";

/// Control-plane API operations used during recovery
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStateClient: Send + Sync {
    /// Cheapest possible round trip (a node list capped at one item)
    async fn probe(&self) -> Result<(), Error>;

    /// All Nodes carrying the control-plane role label
    async fn list_control_plane_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Every Machine in a namespace
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, Error>;

    /// Get a Machine
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Machine, Error>;

    /// Create a Machine
    async fn create_machine(&self, machine: &Machine) -> Result<Machine, Error>;

    /// Delete a Machine
    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error>;

    /// Get a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Error>;

    /// Create a Pod
    async fn create_pod(&self, pod: &Pod) -> Result<(), Error>;

    /// Delete a Pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create or replace a Secret (server-side apply)
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Create or replace a DaemonSet (server-side apply)
    async fn apply_daemon_set(&self, daemon_set: &DaemonSet) -> Result<(), Error>;

    /// Every ClusterOperator
    async fn list_cluster_operators(&self) -> Result<Vec<ClusterOperator>, Error>;

    /// Get a MachineConfigPool
    async fn get_machine_config_pool(&self, name: &str) -> Result<MachineConfigPool, Error>;

    /// Desired replicas of a Deployment, read through its scale subresource
    async fn get_deployment_replicas(&self, namespace: &str, name: &str) -> Result<i32, Error>;

    /// Set the replicas of a Deployment through its scale subresource
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32)
        -> Result<(), Error>;

    /// Rollout status of an operand's operator object
    async fn get_operand_status(&self, operand: Operand) -> Result<StaticPodOperatorStatus, Error>;

    /// Set the operand's forced-redeployment reason
    async fn force_operand_redeployment(&self, operand: Operand, reason: &str)
        -> Result<(), Error>;
}

/// [`ClusterStateClient`] backed by a live API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Translate 404/409 responses into our typed variants
fn api_error(kind: &str, name: &str) -> impl FnOnce(kube::Error) -> Error {
    let kind = kind.to_string();
    let name = name.to_string();
    move |e| match &e {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, name),
        kube::Error::Api(ae) if ae.code == 409 => Error::already_exists(kind, name),
        _ => Error::from(e),
    }
}

#[async_trait]
impl ClusterStateClient for KubeClusterClient {
    async fn probe(&self) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.list(&ListParams::default().limit(1)).await?;
        Ok(())
    }

    async fn list_control_plane_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.into_iter().filter(is_control_plane).collect())
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Machine, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(api_error("Machine", name))
    }

    async fn create_machine(&self, machine: &Machine) -> Result<Machine, Error> {
        let namespace = machine.metadata.namespace.as_deref().unwrap_or_default();
        let name = machine.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        debug!(machine = %name, namespace = %namespace, "creating Machine");
        api.create(&PostParams::default(), machine)
            .await
            .map_err(api_error("Machine", name))
    }

    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(api_error("Machine", name))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(api_error("Pod", name))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), Error> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        debug!(pod = %name, namespace = %namespace, "creating Pod");
        api.create(&PostParams::default(), pod)
            .await
            .map_err(api_error("Pod", name))?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(api_error("Pod", name))?;
        Ok(())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(secret))
            .await
            .map_err(api_error("Secret", name))?;
        Ok(())
    }

    async fn apply_daemon_set(&self, daemon_set: &DaemonSet) -> Result<(), Error> {
        let namespace = daemon_set.metadata.namespace.as_deref().unwrap_or_default();
        let name = daemon_set.metadata.name.as_deref().unwrap_or_default();
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(daemon_set),
        )
        .await
        .map_err(api_error("DaemonSet", name))?;
        Ok(())
    }

    async fn list_cluster_operators(&self) -> Result<Vec<ClusterOperator>, Error> {
        let api: Api<ClusterOperator> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_machine_config_pool(&self, name: &str) -> Result<MachineConfigPool, Error> {
        let api: Api<MachineConfigPool> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(api_error("MachineConfigPool", name))
    }

    async fn get_deployment_replicas(&self, namespace: &str, name: &str) -> Result<i32, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let scale = api
            .get_scale(name)
            .await
            .map_err(api_error("Deployment", name))?;
        Ok(scale.spec.and_then(|s| s.replicas).unwrap_or(0))
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(api_error("Deployment", name))?;
        Ok(())
    }

    async fn get_operand_status(&self, operand: Operand) -> Result<StaticPodOperatorStatus, Error> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &operand.api_resource());
        let obj = api
            .get(OPERATOR_OBJECT_NAME)
            .await
            .map_err(api_error(operand.kind(), OPERATOR_OBJECT_NAME))?;
        StaticPodOperatorStatus::from_object(&obj)
    }

    async fn force_operand_redeployment(
        &self,
        operand: Operand,
        reason: &str,
    ) -> Result<(), Error> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &operand.api_resource());
        let patch = serde_json::json!({ "spec": { FORCE_REDEPLOYMENT_FIELD: reason } });
        api.patch(
            OPERATOR_OBJECT_NAME,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(api_error(operand.kind(), OPERATOR_OBJECT_NAME))?;
        Ok(())
    }
}
