//! Metrics - labelled gauges and counters published for the monitoring backend
//!
//! A single [`Metrics`] registry is created at startup and handed to every
//! component as a [`MetricsHandle`]. Components record through the
//! [`MetricsSink`] trait only, so tests can inspect the registry directly.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

/// Static description of a metric family
#[derive(Debug, PartialEq, Eq)]
pub struct Metric {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
}

const fn gauge(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Metric {
    Metric { name, help, kind: MetricKind::Gauge, labels }
}

const fn counter(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Metric {
    Metric { name, help, kind: MetricKind::Counter, labels }
}

const REPO: &[&str] = &["repo"];
const REPO_HOST_PATH: &[&str] = &["repo", "host", "path"];

pub const REPO_STATUS: Metric = gauge("restic_repo_status", "status of integrity checks on the repo", REPO);
pub const SNAPSHOT_COUNT: Metric =
    gauge("restic_snapshot_count", "number of snapshots stored in the repo", REPO_HOST_PATH);
pub const LAST_SNAPSHOT: Metric =
    gauge("restic_last_snapshot", "unix timestamp of last snapshot", REPO_HOST_PATH);
pub const REPO_SIZE: Metric = gauge("restic_repo_size_bytes", "raw size of the repo", REPO);
pub const REPO_UNCOMPRESSED_SIZE: Metric =
    gauge("restic_repo_uncompressed_size_bytes", "raw uncompressed size of the repo", REPO);
pub const REPO_COMPRESSION_RATIO: Metric =
    gauge("restic_repo_compression_ratio", "compression ratio of the repo", REPO);
pub const REPO_BLOB_COUNT: Metric = gauge("restic_repo_blob_count", "number of blobs in the repo", REPO);
pub const SNAPSHOT_SIZE: Metric =
    gauge("restic_snapshot_size", "restored size of latest snapshot", REPO_HOST_PATH);
pub const SNAPSHOT_FILE_COUNT: Metric =
    gauge("restic_snapshot_file_count", "number of files in latest snapshot", REPO_HOST_PATH);
pub const SNAPSHOTS_FORGOTTEN: Metric = counter(
    "restic_snapshots_forgotten",
    "number of snapshots forgotten during maintenance",
    REPO_HOST_PATH,
);
pub const COMMAND_TOTAL: Metric =
    counter("restic_command_total", "number of restic commands run", &["repo", "cmd"]);
pub const COMMAND_ERRORS: Metric = counter(
    "restic_command_errors",
    "number of errors when running restic commands",
    &["repo", "cmd", "kind"],
);
pub const COMMAND_REPO_LOCKED: Metric = gauge(
    "restic_command_repo_locked",
    "whether the last restic command found the repo locked",
    REPO,
);

/// Families in exposition order
pub const ALL_METRICS: &[&Metric] = &[
    &REPO_STATUS,
    &SNAPSHOT_COUNT,
    &LAST_SNAPSHOT,
    &REPO_SIZE,
    &REPO_UNCOMPRESSED_SIZE,
    &REPO_COMPRESSION_RATIO,
    &REPO_BLOB_COUNT,
    &SNAPSHOT_SIZE,
    &SNAPSHOT_FILE_COUNT,
    &SNAPSHOTS_FORGOTTEN,
    &COMMAND_TOTAL,
    &COMMAND_ERRORS,
    &COMMAND_REPO_LOCKED,
];

/// Destination for metric updates
pub trait MetricsSink: Send + Sync {
    /// Set a gauge to `value`
    fn set(&self, metric: &'static Metric, labels: &[&str], value: f64);

    /// Add `value` to a counter
    fn add(&self, metric: &'static Metric, labels: &[&str], value: f64);

    fn inc(&self, metric: &'static Metric, labels: &[&str]) {
        self.add(metric, labels, 1.0);
    }
}

pub type MetricsHandle = Arc<dyn MetricsSink>;

type SeriesKey = (&'static str, Vec<String>);

/// In-process metrics registry
#[derive(Default)]
pub struct Metrics {
    series: Mutex<BTreeMap<SeriesKey, f64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a series, if it has ever been recorded
    pub fn value(&self, metric: &Metric, labels: &[&str]) -> Option<f64> {
        let key = (metric.name, labels.iter().map(|l| l.to_string()).collect());
        self.lock().get(&key).copied()
    }

    /// Render every recorded series in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let series = self.lock();
        let mut out = String::new();

        for metric in ALL_METRICS {
            let mut rows = series
                .iter()
                .filter(|((name, _), _)| *name == metric.name)
                .peekable();
            if rows.peek().is_none() {
                continue;
            }

            let _ = writeln!(out, "# HELP {} {}", metric.name, metric.help);
            let _ = writeln!(out, "# TYPE {} {}", metric.name, metric.kind.as_str());
            for ((_, values), value) in rows {
                let labels = metric
                    .labels
                    .iter()
                    .zip(values)
                    .map(|(name, v)| format!("{}=\"{}\"", name, escape_label(v)))
                    .collect::<Vec<_>>()
                    .join(",");
                let _ = writeln!(out, "{}{{{}}} {}", metric.name, labels, value);
            }
        }

        out
    }

    /// Atomically replace `path` with the rendered registry
    pub async fn write_textfile(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("prom.tmp");
        let rendered = self.render();
        tokio::fs::write(&tmp, rendered)
            .await
            .with_context(|| format!("Failed to write metrics file: {:?}", tmp))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move metrics file into place: {:?}", path))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SeriesKey, f64>> {
        // A panic while holding the lock cannot leave a half-written f64
        self.series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(metric: &'static Metric, labels: &[&str]) -> SeriesKey {
        debug_assert_eq!(metric.labels.len(), labels.len(), "label mismatch for {}", metric.name);
        (metric.name, labels.iter().map(|l| l.to_string()).collect())
    }
}

impl MetricsSink for Metrics {
    fn set(&self, metric: &'static Metric, labels: &[&str], value: f64) {
        self.lock().insert(Self::key(metric, labels), value);
    }

    fn add(&self, metric: &'static Metric, labels: &[&str], value: f64) {
        *self.lock().entry(Self::key(metric, labels)).or_insert(0.0) += value;
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Periodically rewrite the metrics textfile until cancelled, then once more
pub async fn run_textfile_writer(
    metrics: Arc<Metrics>,
    path: std::path::PathBuf,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match metrics.write_textfile(&path).await {
                    Ok(()) => debug!(path = %path.display(), "metrics written"),
                    Err(e) => warn!(error = %e, "failed to write metrics textfile"),
                }
            }
        }
    }

    if let Err(e) = metrics.write_textfile(&path).await {
        warn!(error = %e, "failed to write final metrics textfile");
    }
}
