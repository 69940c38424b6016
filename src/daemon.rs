//! Daemon - wires repositories, pollers and the maintenance scheduler together
//!
//! The daemon resolves every configured repository, starts one poller per
//! repository and registers its maintenance job, then runs until SIGTERM or
//! SIGINT. Shutdown cancels a single root token; pollers are joined first and
//! the scheduler is stopped after, waiting for in-flight maintenance. The
//! metrics endpoint and textfile writer are stopped last.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RepoSettings};
use crate::exporter;
use crate::metrics::{run_textfile_writer, Metrics, MetricsHandle};
use crate::monitor::{MaintenanceJob, Poller};
use crate::restic::{CommandExecutor, ProcessExecutor, Repository, ResticRepo};
use crate::scheduler::{chain, Scheduler};
use crate::tasks::TaskSet;

struct Monitored {
    settings: RepoSettings,
    poller: Arc<Poller>,
}

/// The running monitor
pub struct Daemon {
    metrics: Arc<Metrics>,
    repos: Vec<Monitored>,
    scheduler: Scheduler,
    shutdown: CancellationToken,
    listen: Option<SocketAddr>,
    textfile: Option<(PathBuf, Duration)>,
}

impl Daemon {
    /// Build the daemon with restic run as a child process
    pub fn new(config: &Config, dry_run: bool) -> Result<Self> {
        let executor: Arc<dyn CommandExecutor> =
            Arc::new(ProcessExecutor::new(config.restic.binary.clone()));
        Self::with_executor(config, executor, dry_run)
    }

    /// Build the daemon around an arbitrary executor
    ///
    /// Repositories whose settings fail to resolve are logged and skipped.
    /// It is an error when none are left.
    pub fn with_executor(
        config: &Config,
        executor: Arc<dyn CommandExecutor>,
        dry_run: bool,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let handle: MetricsHandle = metrics.clone();
        let shutdown = CancellationToken::new();
        let mut scheduler = Scheduler::new();
        let mut repos = Vec::new();

        for (name, repo_config) in &config.repos {
            let settings = match repo_config.resolve(name) {
                Ok(settings) => settings,
                Err(e) => {
                    error!(repo = %name, error = %format!("{:#}", e), "skipping repository with invalid configuration");
                    continue;
                }
            };

            let repo: Arc<dyn ResticRepo> = Arc::new(Repository::from_settings(
                &settings,
                executor.clone(),
                handle.clone(),
                dry_run,
            ));
            let poller = Arc::new(Poller::new(
                name.clone(),
                repo.clone(),
                settings.polling_interval,
                handle.clone(),
            ));
            let job = MaintenanceJob::new(
                name.clone(),
                repo,
                poller.clone(),
                handle.clone(),
                shutdown.clone(),
            );

            if let Err(e) = scheduler.add_job(name, &settings.maintenance_schedule, chain(name, job)) {
                error!(repo = %name, error = %e, "skipping repository with invalid maintenance schedule");
                continue;
            }

            if settings.retention.is_empty() {
                warn!(repo = %name, "retention policy is empty, forget will not remove anything");
            }

            info!(
                repo = %name,
                interval = ?settings.polling_interval,
                schedule = %settings.maintenance_schedule,
                "repository configured"
            );
            repos.push(Monitored { settings, poller });
        }

        if repos.is_empty() {
            bail!("No valid repositories configured");
        }

        let listen = config.metrics_listen()?;
        let textfile = match config.metrics_textfile()? {
            Some(path) => Some((path, config.metrics_write_interval()?)),
            None => None,
        };

        if dry_run {
            warn!("dry run enabled, forget will not remove snapshots");
        }

        Ok(Self {
            metrics,
            repos,
            scheduler,
            shutdown,
            listen,
            textfile,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Token cancelled when the daemon shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Names of the repositories being monitored
    pub fn repo_names(&self) -> Vec<&str> {
        self.repos.iter().map(|r| r.settings.name.as_str()).collect()
    }

    /// Run until a shutdown signal is received
    pub async fn run(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping monitor...");
            shutdown.cancel();
        });

        self.run_until_cancelled().await
    }

    /// Run until the shutdown token is cancelled
    pub async fn run_until_cancelled(self) -> Result<()> {
        info!(
            repos = self.repos.len(),
            jobs = self.scheduler.len(),
            "starting restic monitor"
        );

        let mut writers = TaskSet::new();
        if let Some(addr) = self.listen {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind metrics endpoint on {}", addr))?;
            writers.spawn(
                "metrics-http",
                exporter::serve(self.metrics.clone(), listener, self.shutdown.clone()),
            );
        }

        let mut pollers = TaskSet::new();
        for repo in &self.repos {
            let poller = repo.poller.clone();
            let cancel = self.shutdown.clone();
            debug!(repo = %poller.name(), interval = ?poller.interval(), "starting poller");
            pollers.spawn(format!("poller-{}", repo.settings.name), async move {
                poller.run(cancel).await
            });
        }

        if let Some((path, every)) = self.textfile.clone() {
            info!(path = %path.display(), interval = ?every, "writing metrics textfile");
            writers.spawn(
                "metrics-textfile",
                run_textfile_writer(self.metrics.clone(), path, every, self.shutdown.clone()),
            );
        }

        let scheduler = self.scheduler.start(self.shutdown.clone());

        pollers.join_all().await;
        debug!("all pollers stopped");
        scheduler.stop().await;
        writers.join_all().await;

        info!("restic monitor stopped");
        Ok(())
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut int) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to install signal handlers, falling back to ctrl-c");
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => debug!("SIGTERM received"),
        _ = int.recv() => debug!("SIGINT received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => debug!("Ctrl+C received"),
        Err(e) => {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
