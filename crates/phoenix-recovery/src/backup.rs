//! Snapshot and restore of consensus-store data on control-plane hosts
//!
//! Exactly one archive exists per recovery: it is taken on the survivor,
//! identified by its sha256 digest, and every other copy (and the restore
//! itself) is checked against that digest.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use phoenix_common::{Error, Result};

use crate::config::BackupConfig;
use crate::remote::{shell_quote, RemoteExecutor};

/// The authoritative snapshot of one recovery
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackupArchive {
    /// Host the snapshot was taken on
    pub host: String,
    /// Absolute path of the snapshot file
    pub path: String,
    /// Hex sha256 of the snapshot file
    pub sha256: String,
}

/// A verified copy of the archive on another host
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArchiveCopy {
    /// Host holding the copy
    pub host: String,
    /// Path of the copy
    pub path: String,
    /// Digest measured on that host
    pub sha256: String,
}

/// Runs the backup/restore scripts and moves the archive between hosts
pub struct BackupAgent {
    remote: Arc<dyn RemoteExecutor>,
    config: BackupConfig,
}

impl BackupAgent {
    /// Create an agent
    pub fn new(remote: Arc<dyn RemoteExecutor>, config: BackupConfig) -> Self {
        Self { remote, config }
    }

    /// Take a fresh snapshot on `host`
    pub async fn backup(&self, host: &str) -> Result<BackupArchive> {
        info!(host = %host, dir = %self.config.backup_dir, "running backup script");
        self.remote.run(host, &backup_command(&self.config)).await?;

        let latest = self
            .remote
            .run(host, &latest_snapshot_command(&self.config.backup_dir))
            .await?;
        let path = latest.first_line().to_string();
        if path.is_empty() {
            return Err(Error::remote(
                host,
                latest_snapshot_command(&self.config.backup_dir),
                format!("no snapshot found under {}", self.config.backup_dir),
            ));
        }

        let sha256 = self.digest(host, &path).await?;
        info!(host = %host, path = %path, sha256 = %sha256, "backup archive created");
        Ok(BackupArchive {
            host: host.to_string(),
            path,
            sha256,
        })
    }

    /// sha256 of a file on a host
    pub async fn digest(&self, host: &str, path: &str) -> Result<String> {
        let command = digest_command(path);
        let output = self.remote.run(host, &command).await?;
        parse_digest(&output.stdout)
            .ok_or_else(|| Error::remote(host, command, "unparseable sha256sum output"))
    }

    /// Pull the archive onto `host` and verify the copy
    pub async fn copy_to(&self, archive: &BackupArchive, host: &str) -> Result<ArchiveCopy> {
        info!(from = %archive.host, to = %host, path = %archive.path, "copying backup archive");
        self.remote
            .run(host, &pull_command(&self.config, archive))
            .await?;

        let sha256 = self.verify(archive, host).await?;
        Ok(ArchiveCopy {
            host: host.to_string(),
            path: archive.path.clone(),
            sha256,
        })
    }

    /// Copy the archive to every host in order, stopping at the first failure
    pub async fn propagate(
        &self,
        archive: &BackupArchive,
        hosts: &[String],
    ) -> Result<Vec<ArchiveCopy>> {
        let mut copies = Vec::with_capacity(hosts.len());
        for host in hosts.iter().filter(|h| **h != archive.host) {
            copies.push(self.copy_to(archive, host).await?);
        }
        Ok(copies)
    }

    /// Check the archive on `host` is byte-identical to the original
    pub async fn verify(&self, archive: &BackupArchive, host: &str) -> Result<String> {
        let actual = self.digest(host, &archive.path).await?;
        if actual != archive.sha256 {
            return Err(Error::ArchiveMismatch {
                host: host.to_string(),
                expected: archive.sha256.clone(),
                actual,
            });
        }
        Ok(actual)
    }

    /// Restore `host` from the archive, collapsing to a single member
    pub async fn restore(&self, archive: &BackupArchive, host: &str) -> Result<()> {
        self.verify(archive, host).await?;
        info!(host = %host, dir = %self.config.backup_dir, "running restore script");
        self.remote.run(host, &restore_command(&self.config)).await?;
        Ok(())
    }
}

/// Fresh backup into an emptied directory, owned by the remote user
pub fn backup_command(config: &BackupConfig) -> String {
    let dir = shell_quote(&config.backup_dir);
    format!(
        "sudo rm -rf {dir} && sudo {script} --force {dir} && sudo chown -R {user} {dir}",
        script = shell_quote(&config.backup_script),
        user = shell_quote(&config.user),
    )
}

/// Newest snapshot file in the backup directory
pub fn latest_snapshot_command(backup_dir: &str) -> String {
    format!(
        "ls -v {}/snapshot_*.db | tail -n 1",
        shell_quote(backup_dir.trim_end_matches('/'))
    )
}

/// sha256 of one file
pub fn digest_command(path: &str) -> String {
    format!("sha256sum {}", shell_quote(path))
}

/// Pull the archive from its source host into an emptied backup directory
pub fn pull_command(config: &BackupConfig, archive: &BackupArchive) -> String {
    let dir = shell_quote(&config.backup_dir);
    let path = shell_quote(&archive.path);
    format!(
        "sudo rm -rf {dir} && mkdir -p {dir} && \
         scp -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null {user}@{src}:{path} {path}",
        user = shell_quote(&config.user),
        src = shell_quote(&archive.host),
    )
}

/// Restore from the backup directory
pub fn restore_command(config: &BackupConfig) -> String {
    format!(
        "sudo {} {}",
        shell_quote(&config.restore_script),
        shell_quote(&config.backup_dir)
    )
}

/// Extract the hex digest from `sha256sum` output
pub fn parse_digest(output: &str) -> Option<String> {
    let digest = output.split_whitespace().next()?;
    (digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| digest.to_ascii_lowercase())
}
