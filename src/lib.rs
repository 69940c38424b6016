//! restic-monitor - Metrics and maintenance for restic backup repositories
//!
//! restic-monitor periodically inspects a set of restic repositories and
//! publishes their state as labelled gauges and counters, and applies each
//! repository's retention policy on a cron schedule.
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`restic`]: restic invocation, failure classification and retries
//! - [`monitor`]: Per repository pollers and maintenance jobs
//! - [`scheduler`]: Cron style job scheduling
//! - [`metrics`]: Metrics registry and textfile output
//! - [`exporter`]: HTTP `/metrics` endpoint
//! - [`daemon`]: Startup, signal handling and shutdown ordering

pub mod config;
pub mod daemon;
pub mod exporter;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod restic;
pub mod scheduler;
pub mod tasks;

pub use config::Config;
pub use daemon::Daemon;
pub use health::HealthCheck;
pub use metrics::{Metrics, MetricsHandle, MetricsSink};
pub use monitor::{MaintenanceJob, Poller, PollerState};
pub use restic::{CommandRunner, ErrorKind, Repository, ResticError, ResticRepo};
