//! Immutable recovery configuration
//!
//! Loaded once (YAML, every field optional) and handed to the orchestrator by
//! value. Nothing in the recovery path reads global state.

use std::path::PathBuf;
use std::time::Duration;

use phoenix_common::crd::{Operand, CONDITION_AVAILABLE};
use phoenix_common::{Error, PollSpec, Result, RetryConfig};
use serde::{Deserialize, Serialize};

use crate::settle::SettleExemption;

/// Complete configuration of one recovery run
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// Control-plane nodes kept alive; the rest are destroyed
    pub survivors: usize,
    /// Node that takes the backup and restores it; random when unset
    pub survivor: Option<String>,
    /// Quorum guard deployment
    pub quorum_guard: QuorumGuardConfig,
    /// Consensus-store pods counted after redeploy
    pub etcd_pods: PodSelectorConfig,
    /// Backup and restore scripts
    pub backup: BackupConfig,
    /// Remote execution
    pub ssh: SshConfig,
    /// Operands to force-redeploy; always run in canonical order
    pub operands: Vec<Operand>,
    /// Deadlines for every waiting step
    pub timeouts: Timeouts,
    /// Consecutive failed probes that confirm quorum loss
    pub unresponsive_streak: u32,
    /// Upper bound on one API probe, seconds; a probe still hanging counts as failed
    pub probe_timeout_secs: u64,
    /// Key pair installed on control-plane hosts so survivors can copy from each other
    pub host_access: HostAccessConfig,
    /// Bounded retry of Machine creation on "already exists"
    pub machine_create: MachineCreateConfig,
    /// Single tolerated condition during settle
    pub settle_exemption: Option<SettleExemption>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            survivors: 1,
            survivor: None,
            quorum_guard: QuorumGuardConfig::default(),
            etcd_pods: PodSelectorConfig::default(),
            backup: BackupConfig::default(),
            ssh: SshConfig::default(),
            operands: vec![Operand::Etcd, Operand::KubeApiserver],
            timeouts: Timeouts::default(),
            unresponsive_streak: 5,
            probe_timeout_secs: 3,
            host_access: HostAccessConfig::default(),
            machine_create: MachineCreateConfig::default(),
            settle_exemption: None,
        }
    }
}

impl RecoveryConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization("RecoveryConfig", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no recovery could complete with
    pub fn validate(&self) -> Result<()> {
        if self.survivors == 0 {
            return Err(Error::validation("survivors must be at least 1"));
        }
        if self.unresponsive_streak == 0 {
            return Err(Error::validation("unresponsive_streak must be at least 1"));
        }
        if self.probe_timeout_secs == 0 {
            return Err(Error::validation("probe_timeout_secs must be at least 1"));
        }
        if self.operands.is_empty() {
            return Err(Error::validation("at least one operand must be redeployed"));
        }
        if self.machine_create.attempts == 0 || self.ssh.attempts == 0 {
            return Err(Error::validation("retry attempts must be at least 1"));
        }
        if let Some(exemption) = &self.settle_exemption {
            if exemption.condition == CONDITION_AVAILABLE {
                return Err(Error::validation(
                    "settle exemption cannot apply to the Available condition",
                ));
            }
        }
        self.timeouts.validate()
    }

    /// Operands in the order they must be redeployed
    pub fn ordered_operands(&self) -> Vec<Operand> {
        Operand::canonical_order(&self.operands)
    }

    /// Upper bound on one API probe
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Host-to-host SSH access for archive copies
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HostAccessConfig {
    /// Provision a key pair before the first copy; turn off when hosts already trust each other
    pub enabled: bool,
    /// Namespace for the key Secret, the installer DaemonSet and the check Pod
    pub namespace: String,
    /// Name shared by the Secret, the DaemonSet and the check Pod
    pub name: String,
    /// Image with bash and an ssh client
    pub image: String,
    /// SSH directory of the remote user on every host
    pub ssh_dir: String,
    /// Numeric uid owning `ssh_dir`
    pub owner_uid: u32,
}

impl Default for HostAccessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "openshift-etcd".to_string(),
            name: "phoenix-ssh".to_string(),
            image: "registry.redhat.io/rhel9/support-tools:latest".to_string(),
            ssh_dir: "/home/core/.ssh".to_string(),
            owner_uid: 1000,
        }
    }
}

/// Quorum guard deployment coordinates
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QuorumGuardConfig {
    /// Namespace
    pub namespace: String,
    /// Deployment name
    pub deployment: String,
}

impl Default for QuorumGuardConfig {
    fn default() -> Self {
        Self {
            namespace: "openshift-etcd".to_string(),
            deployment: "etcd-quorum-guard".to_string(),
        }
    }
}

/// Pods counted as consensus-store members
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PodSelectorConfig {
    /// Namespace
    pub namespace: String,
    /// Label selector
    pub label_selector: String,
}

impl Default for PodSelectorConfig {
    fn default() -> Self {
        Self {
            namespace: "openshift-etcd".to_string(),
            label_selector: "k8s-app=etcd".to_string(),
        }
    }
}

/// Backup/restore scripts on the control-plane hosts
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// Backup script path
    pub backup_script: String,
    /// Restore script path
    pub restore_script: String,
    /// Directory the backup is written to on every host
    pub backup_dir: String,
    /// Account owning the backup directory (and used for scp between hosts)
    pub user: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_script: "/usr/local/bin/cluster-backup.sh".to_string(),
            restore_script: "/usr/local/bin/cluster-restore.sh".to_string(),
            backup_dir: "/home/core/backup".to_string(),
            user: "core".to_string(),
        }
    }
}

/// SSH transport settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    /// Remote user
    pub user: String,
    /// Private key; ssh defaults apply when unset
    pub identity_file: Option<PathBuf>,
    /// Jump host for nodes without a public address
    pub bastion: Option<String>,
    /// ssh ConnectTimeout, seconds
    pub connect_timeout_secs: u64,
    /// Upper bound on a single command, seconds
    pub command_timeout_secs: u64,
    /// Attempts per command
    pub attempts: u32,
    /// Pause between attempts, seconds
    pub pause_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "core".to_string(),
            identity_file: None,
            bastion: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 600,
            attempts: 10,
            pause_secs: 10,
        }
    }
}

impl SshConfig {
    /// Retry policy for one remote command
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::fixed(self.attempts, Duration::from_secs(self.pause_secs))
    }
}

/// Bounded retry of Machine creation
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MachineCreateConfig {
    /// Attempts before giving up
    pub attempts: u32,
    /// Pause between attempts, seconds
    pub pause_secs: u64,
}

impl Default for MachineCreateConfig {
    fn default() -> Self {
        Self {
            attempts: 30,
            pause_secs: 10,
        }
    }
}

impl MachineCreateConfig {
    /// Retry policy for Machine creation
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::fixed(self.attempts, Duration::from_secs(self.pause_secs))
    }
}

/// Deadline and check interval of one waiting step, in seconds
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StepTimeout {
    /// Give up after this many seconds
    pub timeout_secs: u64,
    /// Check this often
    pub interval_secs: u64,
}

impl StepTimeout {
    const fn new(timeout_secs: u64, interval_secs: u64) -> Self {
        Self {
            timeout_secs,
            interval_secs,
        }
    }

    /// As a poll spec
    pub fn poll_spec(&self) -> PollSpec {
        PollSpec::from_secs(self.timeout_secs, self.interval_secs)
    }
}

/// Deadlines for every waiting step
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Control plane stops answering after non-survivors are destroyed
    pub unresponsive: StepTimeout,
    /// API answers again after restore
    pub api_recoverable: StepTimeout,
    /// Installed key accepted by every survivor
    pub host_access: StepTimeout,
    /// Recreated control-plane Nodes registered and Ready
    pub nodes_joined: StepTimeout,
    /// One operand converges after a forced redeploy
    pub redeploy: StepTimeout,
    /// Consensus-store pods ready
    pub consensus_pods: StepTimeout,
    /// Control-plane machine-config pool converged
    pub machine_config: StepTimeout,
    /// All cluster operators settled
    pub settle: StepTimeout,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            unresponsive: StepTimeout::new(600, 5),
            api_recoverable: StepTimeout::new(900, 10),
            host_access: StepTimeout::new(900, 10),
            nodes_joined: StepTimeout::new(1800, 15),
            redeploy: StepTimeout::new(900, 5),
            consensus_pods: StepTimeout::new(900, 10),
            machine_config: StepTimeout::new(1800, 30),
            settle: StepTimeout::new(900, 30),
        }
    }
}

impl Timeouts {
    fn validate(&self) -> Result<()> {
        let all = [
            ("unresponsive", self.unresponsive),
            ("api_recoverable", self.api_recoverable),
            ("host_access", self.host_access),
            ("nodes_joined", self.nodes_joined),
            ("redeploy", self.redeploy),
            ("consensus_pods", self.consensus_pods),
            ("machine_config", self.machine_config),
            ("settle", self.settle),
        ];
        for (name, t) in all {
            if t.interval_secs == 0 || t.timeout_secs == 0 {
                return Err(Error::validation(format!(
                    "timeouts.{name}: timeout and interval must be non-zero"
                )));
            }
        }
        Ok(())
    }
}
