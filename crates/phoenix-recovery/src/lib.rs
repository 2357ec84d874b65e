//! Quorum-loss recovery for consensus-backed control planes
//!
//! Takes a control plane that lost (or is about to lose) etcd quorum down to
//! a single survivor, restores it from a fresh snapshot, grows it back to its
//! original size and waits until the cluster settles.
//!
//! Related crates:
//! - `phoenix-common`: errors, polling, typed resources, telemetry
//! - `phoenix-cli`: the `phoenix` binary

#![deny(missing_docs)]

pub mod backup;
pub mod client;
pub mod config;
pub mod host_access;
pub mod machines;
pub mod operands;
pub mod orchestrator;
pub mod quorum_guard;
pub mod remote;
pub mod settle;

pub use backup::{ArchiveCopy, BackupAgent, BackupArchive};
pub use client::{ClusterStateClient, KubeClusterClient};
pub use config::RecoveryConfig;
pub use host_access::{HostAccessProvisioner, SshKeyPair};
pub use machines::{MachineLifecycleManager, MachineRef};
pub use operands::{OperandRedeploymentController, OperandRollout};
pub use orchestrator::{
    QuorumLossRecoveryOrchestrator, RecoveryError, RecoveryReport, RecoveryStep, StepTiming,
};
pub use quorum_guard::QuorumGuardController;
pub use remote::{CommandOutput, RemoteExecutor, SshExecutor};
pub use settle::{ClusterSettleMonitor, SettleExemption, SettleReport};

// Re-export common error types
pub use phoenix_common::{Error, Result};
