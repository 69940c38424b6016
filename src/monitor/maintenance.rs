use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::{MetricsHandle, SNAPSHOTS_FORGOTTEN};
use crate::restic::{ForgetGroup, ResticError, ResticRepo};
use crate::scheduler::Job;

use super::Poller;

/// Scheduled retention pass followed by a metrics refresh
pub struct MaintenanceJob {
    name: String,
    repo: Arc<dyn ResticRepo>,
    poller: Arc<Poller>,
    metrics: MetricsHandle,
    cancel: CancellationToken,
}

impl MaintenanceJob {
    pub fn new(
        name: impl Into<String>,
        repo: Arc<dyn ResticRepo>,
        poller: Arc<Poller>,
        metrics: MetricsHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            repo,
            poller,
            metrics,
            cancel,
        }
    }

    /// Run forget and record removals, returning the total removed
    async fn forget(&self) -> Result<usize, ResticError> {
        let groups = self.repo.forget(&self.cancel).await?;

        let removed = removed_per_group(&groups);
        let mut total = 0;
        for ((host, path), count) in &removed {
            self.metrics.add(
                &SNAPSHOTS_FORGOTTEN,
                &[self.name.as_str(), host.as_str(), path.as_str()],
                *count as f64,
            );
            total += count;
        }
        Ok(total)
    }
}

/// Removed snapshot counts keyed by (host, joined paths)
pub fn removed_per_group(groups: &[ForgetGroup]) -> BTreeMap<(String, String), usize> {
    let mut removed = BTreeMap::new();
    for group in groups {
        let key = (group.hostname.clone(), group.paths.join(","));
        *removed.entry(key).or_insert(0) += group.remove.len();
    }
    removed
}

#[async_trait]
impl Job for MaintenanceJob {
    async fn run(&self) {
        info!(repo = %self.name, "running maintenance");

        match self.forget().await {
            Ok(removed) => info!(repo = %self.name, removed, "forget complete"),
            Err(ResticError::Cancelled) => return,
            Err(e) => error!(repo = %self.name, error = %e, "forget failed"),
        }

        if self.cancel.is_cancelled() {
            return;
        }
        self.poller.poll(&self.cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Metrics, REPO_STATUS};
    use crate::restic::{MockResticRepo, RawDataStats};
    use std::time::Duration;

    fn forget_result() -> Vec<ForgetGroup> {
        serde_json::from_str(
            r#"[
                {"host": "h", "paths": ["/a"], "keep": [],
                 "remove": [
                    {"id": "s1", "time": "2024-01-01T00:00:00Z"},
                    {"id": "s2", "time": "2024-01-02T00:00:00Z"}
                 ]},
                {"host": "h", "paths": ["/b"], "keep": null, "remove": null}
            ]"#,
        )
        .unwrap()
    }

    fn job(repo: MockResticRepo, metrics: Arc<Metrics>) -> MaintenanceJob {
        let repo: Arc<dyn ResticRepo> = Arc::new(repo);
        let poller = Arc::new(Poller::new(
            "home",
            repo.clone(),
            Duration::from_secs(3600),
            metrics.clone(),
        ));
        MaintenanceJob::new("home", repo, poller, metrics, CancellationToken::new())
    }

    fn expect_poll(repo: &mut MockResticRepo) {
        repo.expect_check().times(1).returning(|_| Ok(()));
        repo.expect_snapshots().times(1).returning(|_| Ok(Vec::new()));
        repo.expect_raw_stats()
            .times(1)
            .returning(|_| Ok(RawDataStats::default()));
    }

    #[test]
    fn test_removed_per_group() {
        let removed = removed_per_group(&forget_result());
        assert_eq!(removed.get(&("h".to_string(), "/a".to_string())), Some(&2));
        assert_eq!(removed.get(&("h".to_string(), "/b".to_string())), Some(&0));
    }

    #[tokio::test]
    async fn test_maintenance_counts_forgotten_then_polls() {
        let mut repo = MockResticRepo::new();
        repo.expect_forget()
            .times(1)
            .returning(|_| Ok(forget_result()));
        expect_poll(&mut repo);

        let metrics = Arc::new(Metrics::new());
        job(repo, metrics.clone()).run().await;

        assert_eq!(metrics.value(&SNAPSHOTS_FORGOTTEN, &["home", "h", "/a"]), Some(2.0));
        assert_eq!(metrics.value(&SNAPSHOTS_FORGOTTEN, &["home", "h", "/b"]), Some(0.0));
        assert_eq!(metrics.value(&REPO_STATUS, &["home"]), Some(1.0));
    }

    #[tokio::test]
    async fn test_counter_accumulates_across_runs() {
        let mut repo = MockResticRepo::new();
        repo.expect_forget()
            .times(2)
            .returning(|_| Ok(forget_result()));
        repo.expect_check().returning(|_| Ok(()));
        repo.expect_snapshots().returning(|_| Ok(Vec::new()));
        repo.expect_raw_stats()
            .returning(|_| Ok(RawDataStats::default()));

        let metrics = Arc::new(Metrics::new());
        let job = job(repo, metrics.clone());
        job.run().await;
        job.run().await;

        assert_eq!(metrics.value(&SNAPSHOTS_FORGOTTEN, &["home", "h", "/a"]), Some(4.0));
    }

    #[tokio::test]
    async fn test_failed_forget_still_polls() {
        let mut repo = MockResticRepo::new();
        repo.expect_forget()
            .times(1)
            .returning(|_| Err(ResticError::RepoLocked));
        expect_poll(&mut repo);

        let metrics = Arc::new(Metrics::new());
        job(repo, metrics.clone()).run().await;

        assert_eq!(metrics.value(&SNAPSHOTS_FORGOTTEN, &["home", "h", "/a"]), None);
        assert_eq!(metrics.value(&REPO_STATUS, &["home"]), Some(1.0));
    }

    #[tokio::test]
    async fn test_cancelled_forget_skips_poll() {
        let mut repo = MockResticRepo::new();
        repo.expect_forget()
            .times(1)
            .returning(|_| Err(ResticError::Cancelled));
        repo.expect_check().never();

        let metrics = Arc::new(Metrics::new());
        job(repo, metrics).run().await;
    }
}
