use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::{
    MetricsHandle, LAST_SNAPSHOT, REPO_BLOB_COUNT, REPO_COMPRESSION_RATIO, REPO_SIZE,
    REPO_STATUS, REPO_UNCOMPRESSED_SIZE, SNAPSHOT_COUNT, SNAPSHOT_FILE_COUNT, SNAPSHOT_SIZE,
};
use crate::restic::{GroupedSnapshots, ResticError, ResticRepo};

/// Lifecycle of a poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Constructed, `run` not called yet
    Idle,
    /// Waiting out the initial random delay
    JitterWait,
    /// Polling on every tick
    Active,
    /// Cancelled, terminal
    Stopped,
}

/// Uniformly distributed in `[0, interval)`
pub fn initial_delay(interval: Duration) -> Duration {
    if interval.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..interval)
}

/// Periodically records the state of one repository
pub struct Poller {
    name: String,
    repo: Arc<dyn ResticRepo>,
    interval: Duration,
    metrics: MetricsHandle,
    state: watch::Sender<PollerState>,
}

impl Poller {
    pub fn new(
        name: impl Into<String>,
        repo: Arc<dyn ResticRepo>,
        interval: Duration,
        metrics: MetricsHandle,
    ) -> Self {
        let (state, _) = watch::channel(PollerState::Idle);
        Self {
            name: name.into(),
            repo,
            interval,
            metrics,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    /// Wait a random delay, poll, then poll once per interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        self.state.send_replace(PollerState::JitterWait);

        let delay = initial_delay(self.interval);
        debug!(repo = %self.name, delay = ?delay, "waiting before first poll");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.stop();
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        self.state.send_replace(PollerState::Active);
        self.poll(&cancel).await;

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll(&cancel).await,
            }
        }

        self.stop();
    }

    fn stop(&self) {
        self.state.send_replace(PollerState::Stopped);
        info!(repo = %self.name, "poller stopped");
    }

    /// Refresh every metric for this repository once
    ///
    /// Each step fails independently; only cancellation ends the poll early.
    pub async fn poll(&self, cancel: &CancellationToken) {
        info!(repo = %self.name, "polling repo");

        match self.repo.check(cancel).await {
            Ok(()) => self.metrics.set(&REPO_STATUS, &[self.name.as_str()], 1.0),
            Err(ResticError::Cancelled) => return self.cancelled(),
            Err(e) => {
                error!(repo = %self.name, error = %e, "repo check failed");
                self.metrics.set(&REPO_STATUS, &[self.name.as_str()], 0.0);
            }
        }

        match self.repo.snapshots(cancel).await {
            Ok(groups) => {
                for group in &groups {
                    if let Err(ResticError::Cancelled) = self.record_group(group, cancel).await {
                        return self.cancelled();
                    }
                }
            }
            Err(ResticError::Cancelled) => return self.cancelled(),
            Err(e) => error!(repo = %self.name, error = %e, "failed to get snapshots"),
        }

        let stats = match self.repo.raw_stats(cancel).await {
            Ok(stats) => stats,
            Err(ResticError::Cancelled) => return self.cancelled(),
            Err(e) => {
                error!(repo = %self.name, error = %e, "failed to get raw stats");
                return;
            }
        };

        let labels = [self.name.as_str()];
        self.metrics.set(&REPO_SIZE, &labels, stats.total_size as f64);
        self.metrics
            .set(&REPO_UNCOMPRESSED_SIZE, &labels, stats.total_uncompressed_size as f64);
        self.metrics
            .set(&REPO_COMPRESSION_RATIO, &labels, stats.compression_ratio);
        self.metrics
            .set(&REPO_BLOB_COUNT, &labels, stats.total_blob_count as f64);

        info!(repo = %self.name, "poll complete");
    }

    async fn record_group(
        &self,
        group: &GroupedSnapshots,
        cancel: &CancellationToken,
    ) -> Result<(), ResticError> {
        let path = group.key.path_label();
        let labels = [self.name.as_str(), group.key.hostname.as_str(), path.as_str()];

        self.metrics
            .set(&SNAPSHOT_COUNT, &labels, group.snapshots.len() as f64);

        let Some(latest) = group.latest() else {
            return Ok(());
        };
        self.metrics
            .set(&LAST_SNAPSHOT, &labels, latest.time.timestamp() as f64);

        let stats = match self.repo.restore_stats(cancel, &latest.id).await {
            Ok(stats) => stats,
            Err(e) => {
                if !e.is_cancelled() {
                    error!(
                        repo = %self.name,
                        snapshot = %latest.short_id,
                        error = %e,
                        "failed to get restore stats"
                    );
                }
                return Err(e);
            }
        };

        self.metrics
            .set(&SNAPSHOT_SIZE, &labels, stats.total_size as f64);
        self.metrics
            .set(&SNAPSHOT_FILE_COUNT, &labels, stats.total_file_count as f64);
        Ok(())
    }

    fn cancelled(&self) {
        debug!(repo = %self.name, "poll cancelled");
    }
}
