//! Recoveries that stop, and where they stop

use std::sync::Arc;

use phoenix_common::crd::MACHINE_NAMESPACE;
use phoenix_common::Error;
use phoenix_recovery::config::{MachineCreateConfig, StepTimeout};
use phoenix_recovery::{
    MachineLifecycleManager, MachineRef, QuorumLossRecoveryOrchestrator, RecoveryConfig,
    RecoveryError, RecoveryStep,
};

use super::sim::{host_of, SimCluster, SimHosts};

async fn recover(
    cluster: &SimCluster,
    hosts: &SimHosts,
    config: RecoveryConfig,
) -> RecoveryError {
    QuorumLossRecoveryOrchestrator::new(config, Arc::new(cluster.clone()), Arc::new(hosts.clone()))
        .run()
        .await
        .unwrap_err()
}

fn keep(survivor: &str, survivors: usize) -> RecoveryConfig {
    RecoveryConfig {
        survivor: Some(survivor.to_string()),
        survivors,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn corrupted_copy_stops_before_any_restore() {
    let cluster = SimCluster::new(3);
    let hosts = SimHosts::new(cluster.clone()).corrupting_copies_on(&host_of(1));

    let err = recover(&cluster, &hosts, keep("master-0", 2)).await;

    assert_eq!(err.step, RecoveryStep::BackupOnSurvivor);
    match &err.source {
        Error::ArchiveMismatch {
            host,
            expected,
            actual,
        } => {
            assert_eq!(host, &host_of(1));
            assert_ne!(expected, actual);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(cluster.restored_from().is_empty());
    assert!(hosts.hosts_running("cluster-restore.sh").is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_survivor_destroys_nothing() {
    let cluster = SimCluster::new(3);
    let hosts = SimHosts::new(cluster.clone()).unreachable(&host_of(0));

    let err = recover(&cluster, &hosts, keep("master-0", 1)).await;

    assert_eq!(err.step, RecoveryStep::SelectSurvivor);
    assert_eq!(err.source.host(), Some(host_of(0).as_str()));
    assert!(cluster.deleted().is_empty());
    assert_eq!(cluster.node_names().len(), 3);
    // the guard stays down: recovery is forward-only
    assert_eq!(cluster.scale_history(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn more_survivors_than_nodes_is_refused_up_front() {
    let cluster = SimCluster::new(1);
    let hosts = SimHosts::new(cluster.clone());

    let err = recover(&cluster, &hosts, keep("master-0", 2)).await;

    assert_eq!(err.step, RecoveryStep::DiscoverReplicas);
    assert!(cluster.scale_history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn operator_that_never_settles_is_reported_in_the_table() {
    let cluster = SimCluster::new(3).with_operator_that_never_settles("network");
    let hosts = SimHosts::new(cluster.clone());
    let mut config = keep("master-0", 1);
    config.timeouts.settle = StepTimeout {
        timeout_secs: 120,
        interval_secs: 30,
    };

    let err = recover(&cluster, &hosts, config).await;

    assert_eq!(err.step, RecoveryStep::AwaitOperatorsSettle);
    match &err.source {
        Error::Unsettled { unsettled, .. } => assert_eq!(unsettled.len(), 1),
        other => panic!("unexpected error: {other}"),
    }
    let table = err.diagnostics().unwrap();
    assert!(table.contains("network"));
    assert!(table.contains("RolloutHung"));
    assert!(!table.contains("kube-apiserver"));

    // everything before the settle wait happened
    assert_eq!(cluster.node_names().len(), 3);
    assert_eq!(cluster.guard_replicas(), 3);
}

#[tokio::test]
async fn deleting_a_machine_twice_is_not_an_error() {
    let cluster = SimCluster::new(3);
    let manager = MachineLifecycleManager::new(
        Arc::new(cluster.clone()),
        MachineCreateConfig::default(),
    );
    let machine = MachineRef {
        namespace: MACHINE_NAMESPACE.to_string(),
        name: "ci-master-2".to_string(),
    };

    assert!(manager.delete(&machine).await.unwrap());
    assert!(!manager.delete(&machine).await.unwrap());
    assert_eq!(cluster.deleted(), vec!["ci-master-2"]);
}

#[tokio::test(start_paused = true)]
async fn copy_without_host_keys_is_refused() {
    let cluster = SimCluster::new(3);
    let hosts = SimHosts::new(cluster.clone());
    let mut config = keep("master-0", 2);
    config.host_access.enabled = false;

    let err = recover(&cluster, &hosts, config).await;

    assert_eq!(err.step, RecoveryStep::BackupOnSurvivor);
    assert_eq!(err.source.host(), Some(host_of(1).as_str()));
    assert!(err.source.to_string().contains("Permission denied"));
    assert!(cluster.restored_from().is_empty());
}
