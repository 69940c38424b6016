//! Scheduler - cron style execution of recurring jobs
//!
//! Jobs are registered with [`Scheduler::add_job`] and driven by a single
//! task once [`Scheduler::start`] is called. Each firing runs on its own
//! task, so a slow job never delays other jobs. Overlap and panic policies
//! are not built in; they are wrappers ([`SkipIfStillRunning`], [`Recover`])
//! composed around a job with [`chain`].

mod cron;

pub use cron::{CronError, CronSpec, Schedule};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// A unit of scheduled work
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self);
}

/// Skips a firing while the previous firing of the same job is still running
pub struct SkipIfStillRunning<J> {
    name: String,
    inner: J,
    running: AtomicBool,
}

impl<J: Job> SkipIfStillRunning<J> {
    pub fn new(name: impl Into<String>, inner: J) -> Self {
        Self {
            name: name.into(),
            inner,
            running: AtomicBool::new(false),
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[async_trait]
impl<J: Job> Job for SkipIfStillRunning<J> {
    async fn run(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(job = %self.name, "skipping job, previous run still in progress");
            return;
        }
        let _guard = RunningGuard(&self.running);
        self.inner.run().await;
    }
}

/// Catches a panic inside a job and logs it instead of unwinding further
pub struct Recover<J> {
    name: String,
    inner: J,
}

impl<J: Job> Recover<J> {
    pub fn new(name: impl Into<String>, inner: J) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

#[async_trait]
impl<J: Job> Job for Recover<J> {
    async fn run(&self) {
        if let Err(panic) = AssertUnwindSafe(self.inner.run()).catch_unwind().await {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(job = %self.name, panic_msg = %message, "job panicked");
        }
    }
}

/// Wrap a job with the standard policies: skip overlapping firings, then recover panics
pub fn chain<J: Job + 'static>(name: &str, job: J) -> Arc<dyn Job> {
    Arc::new(SkipIfStillRunning::new(name, Recover::new(name, job)))
}

struct Entry {
    name: String,
    schedule: Schedule,
    job: Arc<dyn Job>,
}

/// Collection of scheduled jobs, not yet running
#[derive(Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` to run on the cron expression `expr`
    pub fn add_job(&mut self, name: &str, expr: &str, job: Arc<dyn Job>) -> Result<(), CronError> {
        let schedule = Schedule::parse(expr)?;
        debug!(job = %name, schedule = %expr, "job registered");
        self.entries.push(Entry {
            name: name.to_string(),
            schedule,
            job,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start driving the registered jobs
    ///
    /// Cancelling `shutdown` stops new firings; [`SchedulerHandle::stop`]
    /// additionally waits for in-flight jobs.
    pub fn start(self, shutdown: CancellationToken) -> SchedulerHandle {
        let tracker = TaskTracker::new();
        let stop = shutdown.child_token();
        let driver = tokio::spawn(drive(self.entries, stop.clone(), tracker.clone()));

        info!("scheduler started");
        SchedulerHandle {
            stop,
            driver,
            tracker,
        }
    }
}

/// A running scheduler
pub struct SchedulerHandle {
    stop: CancellationToken,
    driver: JoinHandle<()>,
    tracker: TaskTracker,
}

impl SchedulerHandle {
    /// Stop scheduling new firings and wait for in-flight jobs to finish
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.driver.await {
            warn!(error = %e, "scheduler driver exited abnormally");
        }

        self.tracker.close();
        info!(in_flight = self.tracker.len(), "waiting for scheduled jobs to complete");
        self.tracker.wait().await;
        info!("scheduler stopped");
    }
}

async fn drive(entries: Vec<Entry>, stop: CancellationToken, tracker: TaskTracker) {
    let now = Local::now();
    let mut next: Vec<Option<DateTime<Local>>> =
        entries.iter().map(|e| e.schedule.next_after(now)).collect();

    for (entry, at) in entries.iter().zip(&next) {
        match at {
            Some(at) => debug!(job = %entry.name, next = %at, "job scheduled"),
            None => warn!(job = %entry.name, "schedule never fires"),
        }
    }

    loop {
        let Some(soonest) = next.iter().flatten().min().copied() else {
            stop.cancelled().await;
            return;
        };

        let wait = (soonest - Local::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let now = Local::now();
        for (entry, at) in entries.iter().zip(next.iter_mut()) {
            if !matches!(at, Some(t) if *t <= now) {
                continue;
            }

            debug!(job = %entry.name, "firing job");
            let job = entry.job.clone();
            tracker.spawn(async move { job.run().await });
            *at = entry.schedule.next_after(now);
        }
    }
}
