//! restic repository client
//!
//! [`Repository`] turns domain operations into restic invocations through a
//! [`CommandRunner`] and decodes the JSON output into typed records.

pub mod command;
pub mod error;
pub mod types;

pub use command::{
    classify, CommandExecutor, CommandRunner, Invocation, ProcessExecutor, ProcessOutput,
    RetryPolicy, REPOSITORY_ENV,
};
pub use error::{ErrorKind, ResticError};
pub use types::{
    ForgetGroup, GroupKey, GroupedSnapshots, RawDataStats, RestoreSizeStats, RetentionPolicy,
    RetentionReason, Snapshot,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RepoSettings;
use crate::metrics::MetricsHandle;

/// Operations the monitor performs against one repository
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResticRepo: Send + Sync {
    /// Verify repository integrity
    async fn check(&self, cancel: &CancellationToken) -> Result<(), ResticError>;

    /// Apply the retention policy
    async fn forget(&self, cancel: &CancellationToken) -> Result<Vec<ForgetGroup>, ResticError>;

    /// List snapshots grouped by host and paths
    async fn snapshots(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupedSnapshots>, ResticError>;

    /// Repository wide raw data statistics
    async fn raw_stats(&self, cancel: &CancellationToken) -> Result<RawDataStats, ResticError>;

    /// Restore size statistics for a single snapshot
    async fn restore_stats(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
    ) -> Result<RestoreSizeStats, ResticError>;
}

/// restic backed implementation of [`ResticRepo`]
pub struct Repository {
    runner: CommandRunner,
    retention: RetentionPolicy,
    dry_run: bool,
}

impl Repository {
    pub fn new(runner: CommandRunner, retention: RetentionPolicy, dry_run: bool) -> Self {
        Self {
            runner,
            retention,
            dry_run,
        }
    }

    /// Build a repository client from resolved settings
    pub fn from_settings(
        settings: &RepoSettings,
        executor: Arc<dyn CommandExecutor>,
        metrics: MetricsHandle,
        dry_run: bool,
    ) -> Self {
        let runner = CommandRunner::new(
            settings.name.clone(),
            settings.repository.clone(),
            settings.environment.clone(),
            executor,
            metrics,
        );
        Self::new(runner, settings.retention.clone(), dry_run)
    }

    pub fn name(&self) -> &str {
        self.runner.repo()
    }

    /// Arguments passed to `restic forget`
    pub fn forget_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        args.extend(self.retention.to_args());
        args
    }

    async fn query<T: DeserializeOwned>(
        &self,
        command: &'static str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<T, ResticError> {
        let out = self.runner.run_with_retry(command, args, cancel).await?;
        serde_json::from_slice(&out).map_err(|source| ResticError::Decode { command, source })
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[async_trait]
impl ResticRepo for Repository {
    async fn check(&self, cancel: &CancellationToken) -> Result<(), ResticError> {
        self.runner.run_with_retry("check", &[], cancel).await?;
        Ok(())
    }

    async fn forget(&self, cancel: &CancellationToken) -> Result<Vec<ForgetGroup>, ResticError> {
        self.query("forget", &self.forget_args(), cancel).await
    }

    async fn snapshots(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupedSnapshots>, ResticError> {
        self.query("snapshots", &strings(&["--group-by", "host,paths"]), cancel)
            .await
    }

    async fn raw_stats(&self, cancel: &CancellationToken) -> Result<RawDataStats, ResticError> {
        self.query("stats", &strings(&["--mode", "raw-data"]), cancel)
            .await
    }

    async fn restore_stats(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
    ) -> Result<RestoreSizeStats, ResticError> {
        self.query(
            "stats",
            &strings(&["--mode", "restore-size", snapshot_id]),
            cancel,
        )
        .await
    }
}
