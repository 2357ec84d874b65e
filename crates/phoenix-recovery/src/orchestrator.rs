//! Quorum-loss recovery, end to end
//!
//! A forward-only sequence of fifteen steps. Each runs in its own tracing span
//! and the first failure ends the run with a [`RecoveryError`] naming the step;
//! nothing is rolled back.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use phoenix_common::crd::{Machine, CONTROL_PLANE_POOL};
use phoenix_common::kube_utils::{is_node_ready, is_pod_ready, node_host};
use phoenix_common::{poll_until, Error, Result};

use crate::backup::{ArchiveCopy, BackupAgent, BackupArchive};
use crate::client::ClusterStateClient;
use crate::config::RecoveryConfig;
use crate::host_access::HostAccessProvisioner;
use crate::machines::{MachineLifecycleManager, MachineRef};
use crate::operands::{OperandRedeploymentController, OperandRollout};
use crate::quorum_guard::QuorumGuardController;
use crate::remote::RemoteExecutor;
use crate::settle::{ClusterSettleMonitor, SettleReport};

/// Command used to check a host answers over the remote transport
pub const REACHABILITY_PROBE: &str = "true";

/// The steps of a recovery, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStep {
    /// Enumerate control-plane Nodes
    DiscoverReplicas,
    /// Scale the quorum guard to zero
    DisableQuorumGuard,
    /// Pick the survivor, check it is reachable and that survivors trust each other
    SelectSurvivor,
    /// Delete the Machines of every non-survivor
    DestroyNonSurvivors,
    /// Wait until the API stops answering
    AwaitControlPlaneUnresponsive,
    /// Snapshot the consensus store on the survivor
    BackupOnSurvivor,
    /// Restore the survivor from the snapshot
    RestoreOnSurvivor,
    /// Wait until the API answers again
    AwaitApiRecoverable,
    /// Recreate the destroyed Machines
    RecreateMachines,
    /// Wait until the control plane is back to its original size, every Node Ready
    AwaitNewNodesJoined,
    /// Force new revisions of the operands
    ForceRedeployOperands,
    /// Wait for the consensus-store pods
    AwaitConsensusPodsReady,
    /// Scale the quorum guard back up
    EnableQuorumGuard,
    /// Wait for the control-plane machine-config pool
    AwaitMachineConfigConvergence,
    /// Wait for every cluster operator to settle
    AwaitOperatorsSettle,
}

impl RecoveryStep {
    /// Every step in execution order
    pub const ALL: [RecoveryStep; 15] = [
        RecoveryStep::DiscoverReplicas,
        RecoveryStep::DisableQuorumGuard,
        RecoveryStep::SelectSurvivor,
        RecoveryStep::DestroyNonSurvivors,
        RecoveryStep::AwaitControlPlaneUnresponsive,
        RecoveryStep::BackupOnSurvivor,
        RecoveryStep::RestoreOnSurvivor,
        RecoveryStep::AwaitApiRecoverable,
        RecoveryStep::RecreateMachines,
        RecoveryStep::AwaitNewNodesJoined,
        RecoveryStep::ForceRedeployOperands,
        RecoveryStep::AwaitConsensusPodsReady,
        RecoveryStep::EnableQuorumGuard,
        RecoveryStep::AwaitMachineConfigConvergence,
        RecoveryStep::AwaitOperatorsSettle,
    ];

    /// 1-based position in the sequence
    pub fn number(&self) -> usize {
        *self as usize + 1
    }

    /// Kebab-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStep::DiscoverReplicas => "discover-replicas",
            RecoveryStep::DisableQuorumGuard => "disable-quorum-guard",
            RecoveryStep::SelectSurvivor => "select-survivor",
            RecoveryStep::DestroyNonSurvivors => "destroy-non-survivors",
            RecoveryStep::AwaitControlPlaneUnresponsive => "await-control-plane-unresponsive",
            RecoveryStep::BackupOnSurvivor => "backup-on-survivor",
            RecoveryStep::RestoreOnSurvivor => "restore-on-survivor",
            RecoveryStep::AwaitApiRecoverable => "await-api-recoverable",
            RecoveryStep::RecreateMachines => "recreate-machines",
            RecoveryStep::AwaitNewNodesJoined => "await-new-nodes-joined",
            RecoveryStep::ForceRedeployOperands => "force-redeploy-operands",
            RecoveryStep::AwaitConsensusPodsReady => "await-consensus-pods-ready",
            RecoveryStep::EnableQuorumGuard => "enable-quorum-guard",
            RecoveryStep::AwaitMachineConfigConvergence => "await-machine-config-convergence",
            RecoveryStep::AwaitOperatorsSettle => "await-operators-settle",
        }
    }
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recovery that stopped at `step`
#[derive(Debug, Error)]
#[error("recovery failed at step {} ({step}): {source}", .step.number())]
pub struct RecoveryError {
    /// Step that failed
    pub step: RecoveryStep,
    /// What went wrong
    pub source: Error,
}

impl RecoveryError {
    /// Table of unsettled operators, when the run failed waiting for them
    pub fn diagnostics(&self) -> Option<&str> {
        match &self.source {
            Error::Unsettled { table, .. } => Some(table),
            _ => None,
        }
    }
}

/// Wall-clock time spent in one step
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepTiming {
    /// Step
    pub step: RecoveryStep,
    /// Seconds spent
    pub elapsed_secs: f64,
    /// False when the step did not apply to this cluster
    pub executed: bool,
}

/// Outcome of a successful recovery
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Control-plane size before recovery
    pub original_size: usize,
    /// Node that took the backup and was restored
    pub survivor: String,
    /// Remote address of the survivor
    pub survivor_host: String,
    /// Every Node kept alive, survivor first
    pub survivors: Vec<String>,
    /// Machines deleted, in deletion order
    pub destroyed_machines: Vec<MachineRef>,
    /// Machines created from the survivor's template
    pub recreated_machines: Vec<String>,
    /// The authoritative snapshot
    pub archive: Option<BackupArchive>,
    /// Verified copies on the other survivors
    pub archive_copies: Vec<ArchiveCopy>,
    /// Revisions before and after each forced redeploy
    pub operand_rollouts: Vec<OperandRollout>,
    /// Quorum guard replicas before (and after) the run
    pub quorum_guard_replicas: i32,
    /// Control-plane Nodes once recovered
    pub final_control_plane_nodes: usize,
    /// Final operator health
    pub settle: SettleReport,
    /// Time per step
    pub timings: Vec<StepTiming>,
}

/// Drives the recovery sequence
pub struct QuorumLossRecoveryOrchestrator {
    config: RecoveryConfig,
    client: Arc<dyn ClusterStateClient>,
    remote: Arc<dyn RemoteExecutor>,
}

/// A control-plane Node chosen to stay alive
struct Survivor {
    name: String,
    host: String,
    machine: MachineRef,
}

impl QuorumLossRecoveryOrchestrator {
    /// Create an orchestrator
    pub fn new(
        config: RecoveryConfig,
        client: Arc<dyn ClusterStateClient>,
        remote: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            config,
            client,
            remote,
        }
    }

    /// The configuration this orchestrator runs with
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run every step to completion, or stop at the first failure
    pub async fn run(&self) -> std::result::Result<RecoveryReport, RecoveryError> {
        let run_span = info_span!("recovery", survivors = self.config.survivors);
        self.run_steps().instrument(run_span).await
    }

    async fn run_steps(&self) -> std::result::Result<RecoveryReport, RecoveryError> {
        use RecoveryStep::*;

        let started = Instant::now();
        let mut report = RecoveryReport::default();
        let mut guard =
            QuorumGuardController::new(self.client.clone(), self.config.quorum_guard.clone());
        let machines =
            MachineLifecycleManager::new(self.client.clone(), self.config.machine_create.clone());
        let backup = BackupAgent::new(self.remote.clone(), self.config.backup.clone());
        let access = HostAccessProvisioner::new(
            self.client.clone(),
            self.config.host_access.clone(),
            self.config.backup.user.clone(),
            self.config.timeouts.host_access.poll_spec(),
        );
        let operands = OperandRedeploymentController::new(
            self.client.clone(),
            self.config.timeouts.redeploy.poll_spec(),
        );
        let settle =
            ClusterSettleMonitor::new(self.client.clone(), self.config.settle_exemption.clone());

        let nodes = step(&mut report.timings, DiscoverReplicas, self.discover_replicas()).await?;
        report.original_size = nodes.len();
        let original_size = nodes.len();

        report.quorum_guard_replicas =
            step(&mut report.timings, DisableQuorumGuard, guard.disable()).await?;

        let (survivors, doomed) = step(&mut report.timings, SelectSurvivor, async {
            let (survivors, doomed) = self.select_survivors(&machines, &nodes).await?;
            self.ensure_host_access(&access, &survivors).await?;
            Ok((survivors, doomed))
        })
        .await?;
        let primary = &survivors[0];
        report.survivor = primary.name.clone();
        report.survivor_host = primary.host.clone();
        report.survivors = survivors.iter().map(|s| s.name.clone()).collect();

        let template = step(
            &mut report.timings,
            DestroyNonSurvivors,
            self.destroy_non_survivors(&machines, primary, &doomed),
        )
        .await?;
        report.destroyed_machines = doomed.clone();

        if self.quorum_can_be_lost(original_size, survivors.len()) {
            step(
                &mut report.timings,
                AwaitControlPlaneUnresponsive,
                self.await_control_plane_unresponsive(),
            )
            .await?;
        } else {
            info!(
                original_size,
                survivors = survivors.len(),
                "survivors keep quorum, not waiting for the control plane to stop answering"
            );
            skipped(&mut report.timings, AwaitControlPlaneUnresponsive);
        }

        let survivor_hosts: Vec<String> = survivors.iter().map(|s| s.host.clone()).collect();
        let (archive, copies) = step(&mut report.timings, BackupOnSurvivor, async {
            let archive = backup.backup(&primary.host).await?;
            let copies = backup.propagate(&archive, &survivor_hosts).await?;
            Ok((archive, copies))
        })
        .await?;
        report.archive_copies = copies;

        step(
            &mut report.timings,
            RestoreOnSurvivor,
            backup.restore(&archive, &primary.host),
        )
        .await?;
        report.archive = Some(archive);

        step(
            &mut report.timings,
            AwaitApiRecoverable,
            self.await_api_recoverable(),
        )
        .await?;

        if original_size > 1 {
            report.recreated_machines = step(
                &mut report.timings,
                RecreateMachines,
                self.recreate_machines(&machines, &template, &doomed),
            )
            .await?;
        } else {
            warn!(
                "single-node control plane: Machines cannot be recreated \
                 without manual intervention"
            );
            skipped(&mut report.timings, RecreateMachines);
        }

        report.final_control_plane_nodes = step(
            &mut report.timings,
            AwaitNewNodesJoined,
            self.await_nodes_joined(original_size, &doomed),
        )
        .await?;

        report.operand_rollouts = step(
            &mut report.timings,
            ForceRedeployOperands,
            operands.redeploy_all(&self.config.ordered_operands()),
        )
        .await?;

        step(
            &mut report.timings,
            AwaitConsensusPodsReady,
            self.await_consensus_pods(original_size),
        )
        .await?;

        step(&mut report.timings, EnableQuorumGuard, guard.enable()).await?;

        let rollouts = &report.operand_rollouts;
        step(&mut report.timings, AwaitMachineConfigConvergence, async {
            self.await_machine_config().await?;
            operands.verify(rollouts).await
        })
        .await?;

        report.settle = step(
            &mut report.timings,
            AwaitOperatorsSettle,
            settle.wait_for_settle(self.config.timeouts.settle.poll_spec()),
        )
        .await?;

        info!(
            survivor = %report.survivor,
            recreated = report.recreated_machines.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "recovery complete"
        );
        Ok(report)
    }

    async fn discover_replicas(&self) -> Result<Vec<Node>> {
        self.config.validate()?;
        let mut nodes = self.client.list_control_plane_nodes().await?;
        nodes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        if nodes.is_empty() {
            return Err(Error::validation("no control-plane nodes found"));
        }
        if nodes.len() < self.config.survivors {
            return Err(Error::validation(format!(
                "{} survivors requested but only {} control-plane nodes exist",
                self.config.survivors,
                nodes.len()
            )));
        }
        info!(
            nodes = nodes.len(),
            survivors = self.config.survivors,
            "control-plane replicas discovered"
        );
        Ok(nodes)
    }

    /// Survivors (selected one first) and the Machines of everyone else
    async fn select_survivors(
        &self,
        machines: &MachineLifecycleManager,
        nodes: &[Node],
    ) -> Result<(Vec<Survivor>, Vec<MachineRef>)> {
        let primary = self.choose_primary(nodes)?;
        let mut ordered: Vec<&Node> = vec![&nodes[primary]];
        ordered.extend(
            nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != primary)
                .map(|(_, n)| n),
        );

        // resolve everything before anything is touched
        let mut survivors = Vec::new();
        let mut doomed = Vec::new();
        for (i, node) in ordered.into_iter().enumerate() {
            let machine = machines.resolve_machine(node)?;
            if i < self.config.survivors {
                survivors.push(Survivor {
                    name: node.metadata.name.clone().unwrap_or_default(),
                    host: node_host(node),
                    machine,
                });
            } else {
                doomed.push(machine);
            }
        }

        for survivor in &survivors {
            self.remote
                .run(&survivor.host, REACHABILITY_PROBE)
                .await?;
            debug!(node = %survivor.name, host = %survivor.host, "survivor reachable");
        }
        info!(
            survivor = %survivors[0].name,
            host = %survivors[0].host,
            doomed = doomed.len(),
            "survivor selected"
        );
        Ok((survivors, doomed))
    }

    /// Survivors pull the archive from each other, so they must accept a shared key
    async fn ensure_host_access(
        &self,
        access: &HostAccessProvisioner,
        survivors: &[Survivor],
    ) -> Result<()> {
        if survivors.len() < 2 {
            debug!("single survivor, no archive copies to authorize");
            return Ok(());
        }
        if !self.config.host_access.enabled {
            info!("host access provisioning disabled, relying on existing host keys");
            return Ok(());
        }
        let hosts: Vec<String> = survivors.iter().map(|s| s.host.clone()).collect();
        access.provision(&hosts).await
    }

    fn choose_primary(&self, nodes: &[Node]) -> Result<usize> {
        match &self.config.survivor {
            Some(name) => nodes
                .iter()
                .position(|n| n.metadata.name.as_deref() == Some(name.as_str()))
                .ok_or_else(|| {
                    Error::validation(format!("survivor {name} is not a control-plane node"))
                }),
            None => {
                let indices: Vec<usize> = (0..nodes.len()).collect();
                indices
                    .choose(&mut rand::thread_rng())
                    .copied()
                    .ok_or_else(|| Error::validation("no control-plane nodes to choose from"))
            }
        }
    }

    /// Fetch the survivor's Machine as template, then delete the doomed ones
    async fn destroy_non_survivors(
        &self,
        machines: &MachineLifecycleManager,
        primary: &Survivor,
        doomed: &[MachineRef],
    ) -> Result<Machine> {
        let template = machines.get(&primary.machine).await?;
        for machine in doomed {
            machines.delete(machine).await?;
        }
        Ok(template)
    }

    /// Losing every member but the survivors only breaks quorum when the
    /// survivors are not a majority
    fn quorum_can_be_lost(&self, original_size: usize, survivors: usize) -> bool {
        original_size > 1 && survivors * 2 <= original_size
    }

    async fn await_control_plane_unresponsive(&self) -> Result<()> {
        let needed = self.config.unresponsive_streak;
        let streak = AtomicU32::new(0);
        let streak = &streak;
        let client = &self.client;
        let limit = self.config.probe_timeout();

        poll_until(
            "control plane to stop answering",
            self.config.timeouts.unresponsive.poll_spec(),
            || async move {
                match bounded(limit, "API probe", client.probe()).await {
                    Ok(()) => {
                        if streak.swap(0, Ordering::SeqCst) > 0 {
                            debug!("control plane answered, failure streak reset");
                        }
                        Ok(false)
                    }
                    Err(e) => {
                        let current = streak.fetch_add(1, Ordering::SeqCst) + 1;
                        debug!(streak = current, needed, error = %e, "control plane probe failed");
                        Ok(current >= needed)
                    }
                }
            },
        )
        .await?;
        info!(streak = needed, "quorum loss confirmed");
        Ok(())
    }

    async fn await_api_recoverable(&self) -> Result<()> {
        let client = &self.client;
        let limit = self.config.probe_timeout();
        poll_until(
            "API to answer after restore",
            self.config.timeouts.api_recoverable.poll_spec(),
            || async move {
                match bounded(limit, "API probe", client.probe()).await {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        debug!(error = %e, "API not answering yet");
                        Ok(false)
                    }
                }
            },
        )
        .await
    }

    async fn recreate_machines(
        &self,
        machines: &MachineLifecycleManager,
        template: &Machine,
        doomed: &[MachineRef],
    ) -> Result<Vec<String>> {
        let mut created = Vec::with_capacity(doomed.len());
        for machine in doomed {
            machines.create_like(template, &machine.name).await?;
            created.push(machine.name.clone());
        }
        Ok(created)
    }

    /// Stale Node objects of destroyed Machines survive the restore as
    /// NotReady, so only Ready Nodes count, and every recreated Machine must
    /// have reached Running
    async fn await_nodes_joined(&self, expected: usize, recreated: &[MachineRef]) -> Result<usize> {
        let client = &self.client;
        poll_until(
            &format!("{expected} ready control-plane nodes"),
            self.config.timeouts.nodes_joined.poll_spec(),
            || async move {
                let Some(nodes) = tolerate_transient(client.list_control_plane_nodes().await)?
                else {
                    return Ok(false);
                };
                let ready = nodes.iter().filter(|n| is_node_ready(n)).count();
                debug!(ready, listed = nodes.len(), expected, "control-plane nodes");
                if ready != expected {
                    return Ok(false);
                }
                recreated_machines_running(client, recreated).await
            },
        )
        .await?;
        Ok(expected)
    }

    async fn await_consensus_pods(&self, expected: usize) -> Result<()> {
        let client = &self.client;
        let pods = &self.config.etcd_pods;
        poll_until(
            &format!("{expected} ready consensus-store pods"),
            self.config.timeouts.consensus_pods.poll_spec(),
            || async move {
                let listed = tolerate_transient(
                    client.list_pods(&pods.namespace, &pods.label_selector).await,
                )?;
                let ready = listed.map(|pods| pods.iter().filter(|p| is_pod_ready(p)).count());
                debug!(ready = ?ready, expected, "consensus-store pods");
                Ok(ready.is_some_and(|r| r >= expected))
            },
        )
        .await
    }

    async fn await_machine_config(&self) -> Result<()> {
        let client = &self.client;
        poll_until(
            "control-plane machine-config pool to converge",
            self.config.timeouts.machine_config.poll_spec(),
            || async move {
                let pool = tolerate_transient(client.get_machine_config_pool(CONTROL_PLANE_POOL).await)?;
                Ok(pool.is_some_and(|p| p.is_converged()))
            },
        )
        .await
    }
}

/// Whether every recreated Machine reports phase Running
async fn recreated_machines_running(
    client: &Arc<dyn ClusterStateClient>,
    recreated: &[MachineRef],
) -> Result<bool> {
    let mut namespaces: Vec<&str> = recreated.iter().map(|m| m.namespace.as_str()).collect();
    namespaces.sort_unstable();
    namespaces.dedup();
    for namespace in namespaces {
        let Some(listed) = tolerate_transient(client.list_machines(namespace).await)? else {
            return Ok(false);
        };
        for machine in recreated.iter().filter(|m| m.namespace == namespace) {
            let running = listed
                .iter()
                .any(|m| m.metadata.name.as_deref() == Some(machine.name.as_str()) && m.is_running());
            if !running {
                debug!(machine = %machine, "recreated Machine not Running yet");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Bound a single API round trip; one that has not answered in time counts as failed
async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call).await.map_err(|_| {
        Error::internal_with_context(what, format!("no answer within {}s", limit.as_secs()))
    })?
}

/// Transient API failures count as "not ready yet"; anything else aborts the poll
fn tolerate_transient<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_retryable() => {
            debug!(error = %e, "transient API error while polling");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Run one step inside its span, timing it and tagging failures with the step
async fn step<T, F>(
    timings: &mut Vec<StepTiming>,
    step: RecoveryStep,
    work: F,
) -> std::result::Result<T, RecoveryError>
where
    F: Future<Output = Result<T>>,
{
    let span = info_span!("step", step = %step, number = step.number());
    let started = Instant::now();
    info!(parent: &span, "starting");
    let result = work.instrument(span.clone()).await;
    let elapsed = started.elapsed();
    timings.push(StepTiming {
        step,
        elapsed_secs: elapsed.as_secs_f64(),
        executed: true,
    });

    match result {
        Ok(value) => {
            info!(parent: &span, elapsed_secs = elapsed.as_secs_f64(), "done");
            Ok(value)
        }
        Err(source) => {
            warn!(parent: &span, error = %source, "failed");
            Err(RecoveryError { step, source })
        }
    }
}

fn skipped(timings: &mut Vec<StepTiming>, step: RecoveryStep) {
    info!(step = %step, "skipped");
    timings.push(StepTiming {
        step,
        elapsed_secs: 0.0,
        executed: false,
    });
}
