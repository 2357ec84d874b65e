//! In-memory control plane and hosts
//!
//! `SimCluster` answers the API only while a majority of etcd members is live.
//! Deleting a Machine drops its member and leaves its Node behind as NotReady;
//! a restore on a host collapses membership to that host; a created Machine
//! replaces the stale Node with a new one that turns Ready a few reads later.
//! Host-to-host ssh only works once the key Secret and installer DaemonSet
//! have been applied. `SimHosts` keeps files per host and runs the handful of
//! shell commands recovery issues.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    Node, NodeAddress, NodeCondition, NodeStatus as CoreNodeStatus, Pod, PodCondition, PodStatus,
    Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha2::{Digest, Sha256};

use phoenix_common::crd::{
    ClusterOperator, ClusterOperatorStatus, Condition, ConditionStatus, Machine,
    MachineConfigPool, MachineConfigPoolStatus, MachineSpec, MachineStatus, NodeStatus, Operand,
    StaticPodOperatorStatus, CONDITION_AVAILABLE, CONDITION_DEGRADED,
    CONDITION_NODE_INSTALLER_PROGRESSING, CONDITION_PROGRESSING, CONDITION_UPDATED,
    CONDITION_UPDATING, MACHINE_ANNOTATION, MACHINE_NAMESPACE, MACHINE_PHASE_RUNNING,
    REASON_ALL_NODES_AT_LATEST_REVISION,
};
use phoenix_common::kube_utils::CONTROL_PLANE_LABEL;
use phoenix_common::Error;
use phoenix_recovery::{ClusterStateClient, CommandOutput, RemoteExecutor};

pub const BACKUP_DIR: &str = "/home/core/backup";
pub const INITIAL_REVISION: i64 = 5;

/// Reads of an operand status before a forced rollout reaches every node
const ROLLOUT_READS: u32 = 2;

/// Node lists before a freshly created Node reports Ready
const JOIN_READS: u32 = 2;

pub fn host_of(index: usize) -> String {
    format!("10.0.0.{index}")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

struct Rollout {
    latest: i64,
    node_revision: i64,
    pending_reads: u32,
}

struct ClusterState {
    members: usize,
    live_members: usize,
    nodes: BTreeMap<String, Node>,
    machines: BTreeMap<String, Machine>,
    finalizing: BTreeMap<String, u32>,
    finalize_rounds: u32,
    next_index: usize,
    guard_replicas: i32,
    scale_history: Vec<i32>,
    rollouts: BTreeMap<Operand, Rollout>,
    restored_from: Vec<String>,
    deleted: Vec<String>,
    created: Vec<String>,
    create_attempts: u32,
    never_settles: Option<String>,
    joining: BTreeMap<String, u32>,
    hang_without_quorum: bool,
    hung_api_calls: u32,
    secret_applied: bool,
    host_keys_installed: bool,
    pods: BTreeMap<String, u32>,
}

/// Simulated cluster API
#[derive(Clone)]
pub struct SimCluster {
    state: Arc<Mutex<ClusterState>>,
}

fn ready_condition(ready: bool) -> NodeCondition {
    NodeCondition {
        type_: "Ready".to_string(),
        status: if ready { "True" } else { "Unknown" }.to_string(),
        ..Default::default()
    }
}

fn set_ready(node: &mut Node, ready: bool) {
    if let Some(status) = node.status.as_mut() {
        status.conditions = Some(vec![ready_condition(ready)]);
    }
}

fn machine_reference(node: &Node) -> Option<&String> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(MACHINE_ANNOTATION))
}

fn control_plane_node(index: usize, machine: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(format!("master-{index}")),
            labels: Some(BTreeMap::from([(CONTROL_PLANE_LABEL.to_string(), String::new())])),
            annotations: Some(BTreeMap::from([(
                MACHINE_ANNOTATION.to_string(),
                format!("{MACHINE_NAMESPACE}/{machine}"),
            )])),
            ..Default::default()
        },
        status: Some(CoreNodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: host_of(index),
            }]),
            conditions: Some(vec![ready_condition(ready)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn with_phase(mut machine: Machine, phase: &str) -> Machine {
    machine.status = Some(MachineStatus {
        phase: Some(phase.to_string()),
        ..Default::default()
    });
    machine
}

fn machine(name: &str, index: usize) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            provider_id: Some(format!("aws:///us-east-1a/i-{index:04}")),
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some(MACHINE_NAMESPACE.to_string());
    machine.metadata.uid = Some(format!("uid-{index}"));
    with_phase(machine, MACHINE_PHASE_RUNNING)
}

fn operator(name: &str, degraded: Option<&str>) -> ClusterOperator {
    let mut operator = ClusterOperator::new(name, Default::default());
    let degraded = match degraded {
        Some(reason) => Condition::new(CONDITION_DEGRADED, ConditionStatus::True)
            .with_reason(reason)
            .with_message(format!("{name} has not recovered")),
        None => Condition::new(CONDITION_DEGRADED, ConditionStatus::False),
    };
    operator.status = Some(ClusterOperatorStatus {
        conditions: vec![
            Condition::new(CONDITION_AVAILABLE, ConditionStatus::True),
            Condition::new(CONDITION_PROGRESSING, ConditionStatus::False),
            degraded,
        ],
        ..Default::default()
    });
    operator
}

impl SimCluster {
    /// A healthy control plane of `size` nodes
    pub fn new(size: usize) -> Self {
        let mut nodes = BTreeMap::new();
        let mut machines = BTreeMap::new();
        for index in 0..size {
            let name = format!("ci-master-{index}");
            nodes.insert(format!("master-{index}"), control_plane_node(index, &name, true));
            machines.insert(name.clone(), machine(&name, index));
        }
        let rollouts = Operand::ALL
            .iter()
            .map(|op| {
                (
                    *op,
                    Rollout {
                        latest: INITIAL_REVISION,
                        node_revision: INITIAL_REVISION,
                        pending_reads: 0,
                    },
                )
            })
            .collect();

        Self {
            state: Arc::new(Mutex::new(ClusterState {
                members: size,
                live_members: size,
                nodes,
                machines,
                finalizing: BTreeMap::new(),
                finalize_rounds: 2,
                next_index: size,
                guard_replicas: 3,
                scale_history: Vec::new(),
                rollouts,
                restored_from: Vec::new(),
                deleted: Vec::new(),
                created: Vec::new(),
                create_attempts: 0,
                never_settles: None,
                joining: BTreeMap::new(),
                hang_without_quorum: false,
                hung_api_calls: 0,
                secret_applied: false,
                host_keys_installed: false,
                pods: BTreeMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn with_guard_replicas(self, replicas: i32) -> Self {
        self.state().guard_replicas = replicas;
        self
    }

    pub fn with_operator_that_never_settles(self, name: &str) -> Self {
        self.state().never_settles = Some(name.to_string());
        self
    }

    /// Probes hang instead of failing while quorum is lost
    pub fn with_hanging_api(self) -> Self {
        self.state().hang_without_quorum = true;
        self
    }

    pub fn hung_api_calls(&self) -> u32 {
        self.state().hung_api_calls
    }

    pub fn host_keys_installed(&self) -> bool {
        self.state().host_keys_installed
    }

    /// Names of Nodes currently reporting Ready
    pub fn ready_node_names(&self) -> Vec<String> {
        self.state()
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }

    pub fn machine_names(&self) -> Vec<String> {
        self.state().machines.keys().cloned().collect()
    }

    pub fn scale_history(&self) -> Vec<i32> {
        self.state().scale_history.clone()
    }

    pub fn guard_replicas(&self) -> i32 {
        self.state().guard_replicas
    }

    pub fn restored_from(&self) -> Vec<String> {
        self.state().restored_from.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.state().created.clone()
    }

    pub fn create_attempts(&self) -> u32 {
        self.state().create_attempts
    }

    pub fn members(&self) -> usize {
        self.state().members
    }

    pub fn machine(&self, name: &str) -> Option<Machine> {
        self.state().machines.get(name).cloned()
    }

    /// Collapse etcd membership onto the node reachable at `host`
    fn restore(&self, host: &str) {
        let mut state = self.state();
        state.members = 1;
        state.live_members = 1;
        state.restored_from.push(host.to_string());
    }

    fn check_api(state: &ClusterState) -> Result<(), Error> {
        if state.live_members * 2 > state.members {
            Ok(())
        } else {
            Err(Error::internal("etcdserver: request timed out"))
        }
    }
}

#[async_trait]
impl ClusterStateClient for SimCluster {
    async fn probe(&self) -> Result<(), Error> {
        let hang = {
            let mut state = self.state();
            let hang = Self::check_api(&state).is_err() && state.hang_without_quorum;
            if hang {
                state.hung_api_calls += 1;
            }
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Self::check_api(&self.state())
    }

    async fn list_control_plane_nodes(&self) -> Result<Vec<Node>, Error> {
        let mut guard = self.state();
        Self::check_api(&guard)?;

        let state = &mut *guard;
        let mut joined = Vec::new();
        for (node, reads) in state.joining.iter_mut() {
            *reads = reads.saturating_sub(1);
            if *reads == 0 {
                joined.push(node.clone());
            }
        }
        for name in joined {
            state.joining.remove(&name);
            let Some(node) = state.nodes.get_mut(&name) else {
                continue;
            };
            set_ready(node, true);
            let machine = machine_reference(node)
                .and_then(|r| r.rsplit('/').next())
                .map(str::to_string);
            if let Some(machine) = machine.and_then(|m| state.machines.get_mut(&m)) {
                *machine = with_phase(machine.clone(), MACHINE_PHASE_RUNNING);
            }
        }
        Ok(state.nodes.values().cloned().collect())
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, Error> {
        let state = self.state();
        Self::check_api(&state)?;
        Ok(state
            .machines
            .values()
            .filter(|m| m.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn get_machine(&self, _namespace: &str, name: &str) -> Result<Machine, Error> {
        let state = self.state();
        Self::check_api(&state)?;
        state
            .machines
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("Machine", name))
    }

    async fn create_machine(&self, machine: &Machine) -> Result<Machine, Error> {
        let mut state = self.state();
        Self::check_api(&state)?;
        state.create_attempts += 1;

        let name = machine.metadata.name.clone().unwrap_or_default();
        if let Some(rounds) = state.finalizing.get_mut(&name) {
            if *rounds > 0 {
                *rounds -= 1;
                return Err(Error::already_exists("Machine", name));
            }
        }
        if state.machines.contains_key(&name) {
            return Err(Error::already_exists("Machine", name));
        }
        state.finalizing.remove(&name);

        let index = state.next_index;
        state.next_index += 1;
        let mut created = with_phase(machine.clone(), "Provisioning");
        created.metadata.uid = Some(format!("uid-{index}"));
        state.machines.insert(name.clone(), created.clone());

        // the replacement registers and the stale Node of the old instance goes away
        let reference = format!("{MACHINE_NAMESPACE}/{name}");
        state
            .nodes
            .retain(|_, node| machine_reference(node) != Some(&reference));
        let node_name = format!("master-{index}");
        state
            .nodes
            .insert(node_name.clone(), control_plane_node(index, &name, false));
        state.joining.insert(node_name, JOIN_READS);
        state.members += 1;
        state.live_members += 1;
        state.created.push(name);
        Ok(created)
    }

    async fn delete_machine(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state();
        Self::check_api(&state)?;
        if state.machines.remove(name).is_none() {
            return Err(Error::not_found("Machine", name));
        }

        let reference = format!("{MACHINE_NAMESPACE}/{name}");
        for node in state.nodes.values_mut() {
            if machine_reference(node) == Some(&reference) {
                set_ready(node, false);
            }
        }
        state.live_members = state.live_members.saturating_sub(1);
        let rounds = state.finalize_rounds;
        state.finalizing.insert(name.to_string(), rounds);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<Pod>, Error> {
        let state = self.state();
        Self::check_api(&state)?;
        Ok(state
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|c| c.iter().any(|c| c.status == "True"))
            })
            .map(|(node, _)| Pod {
                metadata: ObjectMeta {
                    name: Some(format!("etcd-{node}")),
                    ..Default::default()
                },
                status: Some(PodStatus {
                    conditions: Some(vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Pod, Error> {
        let mut guard = self.state();
        Self::check_api(&guard)?;
        let state = &mut *guard;
        let reads = state
            .pods
            .get_mut(name)
            .ok_or_else(|| Error::not_found("Pod", name))?;
        *reads += 1;
        // the check pod loops until ssh works, which needs the installed key
        let phase = if *reads > 1 && state.host_keys_installed {
            "Succeeded"
        } else {
            "Running"
        };
        Ok(Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), Error> {
        let mut state = self.state();
        Self::check_api(&state)?;
        let name = pod.metadata.name.clone().unwrap_or_default();
        if state.pods.contains_key(&name) {
            return Err(Error::already_exists("Pod", name));
        }
        state.pods.insert(name, 0);
        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state();
        Self::check_api(&state)?;
        state
            .pods
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Pod", name))
    }

    async fn apply_secret(&self, _secret: &Secret) -> Result<(), Error> {
        let mut state = self.state();
        Self::check_api(&state)?;
        state.secret_applied = true;
        Ok(())
    }

    async fn apply_daemon_set(&self, _daemon_set: &DaemonSet) -> Result<(), Error> {
        let mut state = self.state();
        Self::check_api(&state)?;
        state.host_keys_installed = state.secret_applied;
        Ok(())
    }

    async fn list_cluster_operators(&self) -> Result<Vec<ClusterOperator>, Error> {
        let state = self.state();
        Self::check_api(&state)?;

        let mut operators = Vec::new();
        for operand in [Operand::Etcd, Operand::KubeApiserver] {
            let rolled = state
                .rollouts
                .get(&operand)
                .is_some_and(|r| r.node_revision > INITIAL_REVISION);
            let degraded = (!rolled).then_some("StaticPodsDegraded");
            operators.push(operator(operand.as_str(), degraded));
        }
        if let Some(name) = &state.never_settles {
            operators.push(operator(name, Some("RolloutHung")));
        }
        Ok(operators)
    }

    async fn get_machine_config_pool(&self, name: &str) -> Result<MachineConfigPool, Error> {
        Self::check_api(&self.state())?;
        let mut pool = MachineConfigPool::new(name, Default::default());
        pool.status = Some(MachineConfigPoolStatus {
            conditions: vec![
                Condition::new(CONDITION_UPDATED, ConditionStatus::True),
                Condition::new(CONDITION_UPDATING, ConditionStatus::False),
                Condition::new(CONDITION_DEGRADED, ConditionStatus::False),
            ],
            ..Default::default()
        });
        Ok(pool)
    }

    async fn get_deployment_replicas(&self, _namespace: &str, _name: &str) -> Result<i32, Error> {
        let state = self.state();
        Self::check_api(&state)?;
        Ok(state.guard_replicas)
    }

    async fn scale_deployment(
        &self,
        _namespace: &str,
        _name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let mut state = self.state();
        Self::check_api(&state)?;
        state.guard_replicas = replicas;
        state.scale_history.push(replicas);
        Ok(())
    }

    async fn get_operand_status(&self, operand: Operand) -> Result<StaticPodOperatorStatus, Error> {
        let mut state = self.state();
        Self::check_api(&state)?;
        let node_names: Vec<String> = state.nodes.keys().cloned().collect();
        let rollout = state
            .rollouts
            .get_mut(&operand)
            .ok_or_else(|| Error::not_found(operand.kind(), "cluster"))?;

        let settled = if rollout.pending_reads > 0 {
            rollout.pending_reads -= 1;
            false
        } else {
            rollout.node_revision = rollout.latest;
            true
        };
        let condition = if settled {
            Condition::new(CONDITION_NODE_INSTALLER_PROGRESSING, ConditionStatus::False)
                .with_reason(REASON_ALL_NODES_AT_LATEST_REVISION)
        } else {
            Condition::new(CONDITION_NODE_INSTALLER_PROGRESSING, ConditionStatus::True)
                .with_reason("NodeInstallerProgressing")
        };

        Ok(StaticPodOperatorStatus {
            latest_available_revision: rollout.latest,
            conditions: vec![condition],
            node_statuses: node_names
                .into_iter()
                .map(|node_name| NodeStatus {
                    node_name,
                    current_revision: rollout.node_revision,
                    target_revision: 0,
                })
                .collect(),
        })
    }

    async fn force_operand_redeployment(&self, operand: Operand, _reason: &str) -> Result<(), Error> {
        let mut state = self.state();
        Self::check_api(&state)?;
        let rollout = state
            .rollouts
            .get_mut(&operand)
            .ok_or_else(|| Error::not_found(operand.kind(), "cluster"))?;
        rollout.latest += 1;
        rollout.pending_reads = ROLLOUT_READS;
        Ok(())
    }
}

#[derive(Default)]
struct HostsState {
    files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    unreachable: BTreeSet<String>,
    corrupt_copies_on: Option<String>,
    commands: Vec<(String, String)>,
    snapshots: u32,
}

/// Simulated control-plane hosts
#[derive(Clone)]
pub struct SimHosts {
    state: Arc<Mutex<HostsState>>,
    cluster: SimCluster,
}

fn failed(host: &str, command: &str, message: &str) -> Error {
    Error::remote(host, command, message)
}

impl SimHosts {
    pub fn new(cluster: SimCluster) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostsState::default())),
            cluster,
        }
    }

    fn state(&self) -> MutexGuard<'_, HostsState> {
        self.state.lock().unwrap()
    }

    pub fn unreachable(self, host: &str) -> Self {
        self.state().unreachable.insert(host.to_string());
        self
    }

    /// Copies pulled onto `host` arrive with a flipped byte
    pub fn corrupting_copies_on(self, host: &str) -> Self {
        self.state().corrupt_copies_on = Some(host.to_string());
        self
    }

    pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.state()
            .files
            .get(host)
            .and_then(|files| files.get(path))
            .cloned()
    }

    /// Hosts that ran `needle`, in order
    pub fn hosts_running(&self, needle: &str) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .filter(|(_, command)| command.contains(needle))
            .map(|(host, _)| host.clone())
            .collect()
    }

    fn clear_dir(files: &mut BTreeMap<String, Vec<u8>>) {
        files.retain(|path, _| !path.starts_with(BACKUP_DIR));
    }
}

#[async_trait]
impl RemoteExecutor for SimHosts {
    async fn run(&self, host: &str, command: &str) -> Result<CommandOutput, Error> {
        {
            let mut state = self.state();
            state
                .commands
                .push((host.to_string(), command.to_string()));
            if state.unreachable.contains(host) {
                return Err(failed(host, command, "ssh: connect to host port 22: Connection timed out"));
            }

            if command == "true" {
                return Ok(CommandOutput::default());
            }

            if command.contains("cluster-backup.sh") {
                state.snapshots += 1;
                let n = state.snapshots;
                let files = state.files.entry(host.to_string()).or_default();
                Self::clear_dir(files);
                files.insert(
                    format!("{BACKUP_DIR}/snapshot_2024-05-01_10101{n}.db"),
                    format!("etcd snapshot #{n} taken on {host}").into_bytes(),
                );
                return Ok(CommandOutput::default());
            }

            if command.starts_with("ls -v") {
                let latest = state
                    .files
                    .get(host)
                    .and_then(|files| {
                        files
                            .keys()
                            .filter(|p| p.starts_with(&format!("{BACKUP_DIR}/snapshot_")))
                            .max()
                            .cloned()
                    })
                    .unwrap_or_default();
                return Ok(CommandOutput::stdout(format!("{latest}\n")));
            }

            if let Some(path) = command.strip_prefix("sha256sum ") {
                let bytes = state
                    .files
                    .get(host)
                    .and_then(|files| files.get(path))
                    .ok_or_else(|| {
                        failed(host, command, &format!("sha256sum: {path}: No such file or directory"))
                    })?;
                return Ok(CommandOutput::stdout(format!("{}  {path}\n", sha256_hex(bytes))));
            }

            if command.contains("scp ") && !self.cluster.host_keys_installed() {
                return Err(failed(host, command, "Permission denied (publickey)"));
            }

            if command.contains("scp ") {
                let mut tokens = command.split_whitespace().rev();
                let destination = tokens.next().unwrap_or_default().to_string();
                let source = tokens.next().unwrap_or_default();
                let (remote, path) = source
                    .split_once(':')
                    .ok_or_else(|| failed(host, command, "bad scp source"))?;
                let source_host = remote.rsplit('@').next().unwrap_or_default().to_string();

                let mut bytes = state
                    .files
                    .get(&source_host)
                    .and_then(|files| files.get(path))
                    .cloned()
                    .ok_or_else(|| failed(host, command, "scp: No such file or directory"))?;
                if state.corrupt_copies_on.as_deref() == Some(host) {
                    if let Some(first) = bytes.first_mut() {
                        *first ^= 0xff;
                    }
                }
                let files = state.files.entry(host.to_string()).or_default();
                Self::clear_dir(files);
                files.insert(destination, bytes);
                return Ok(CommandOutput::default());
            }

            if !command.contains("cluster-restore.sh") {
                return Err(failed(host, command, "command not found"));
            }
            let has_snapshot = state.files.get(host).is_some_and(|files| {
                files
                    .keys()
                    .any(|p| p.starts_with(&format!("{BACKUP_DIR}/snapshot_")))
            });
            if !has_snapshot {
                return Err(failed(host, command, "no snapshot to restore from"));
            }
        }

        self.cluster.restore(host);
        Ok(CommandOutput::default())
    }
}
