//! Common test utilities and helpers for restic-monitor tests

#![allow(dead_code)]

use async_trait::async_trait;
use restic_monitor::metrics::{Metrics, MetricsHandle};
use restic_monitor::restic::{
    CommandExecutor, CommandRunner, Invocation, ProcessOutput, ResticError,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Canned outcome of one fake restic invocation
#[derive(Debug, Clone)]
pub enum Reply {
    Output(ProcessOutput),
    /// The process could not be started
    SpawnError(String),
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Output(ProcessOutput {
            success: true,
            exit_code: Some(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: String::new(),
        })
    }

    pub fn fail(stderr: &str, exit_code: i32) -> Self {
        Reply::Output(ProcessOutput {
            success: false,
            exit_code: Some(exit_code),
            stdout: Vec::new(),
            stderr: stderr.to_string(),
        })
    }

    pub fn connection_failed() -> Self {
        Self::fail("Fatal: unable to open config file: Stat: dial tcp: connection refused", 1)
    }

    pub fn locked() -> Self {
        Self::fail(
            "unable to create lock in backend: repository is already locked by PID 4242",
            1,
        )
    }
}

/// Scripted stand-in for the restic binary
///
/// Replies are taken from the queue in order; once it is empty the per
/// subcommand default is used, then a successful empty output.
#[derive(Default)]
pub struct FakeExecutor {
    queue: Mutex<VecDeque<Reply>>,
    defaults: Mutex<HashMap<String, Reply>>,
    delay: Duration,
    invocations: Mutex<Vec<Invocation>>,
    started: Mutex<Vec<(String, Instant)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation takes `delay` to complete
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn push(&self, reply: Reply) -> &Self {
        self.queue.lock().unwrap().push_back(reply);
        self
    }

    pub fn set_default(&self, subcommand: &str, reply: Reply) -> &Self {
        self.defaults
            .lock()
            .unwrap()
            .insert(subcommand.to_string(), reply);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn subcommands(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .map(|i| i.subcommand)
            .collect()
    }

    /// When each invocation of `subcommand` reached the executor
    pub fn started_at(&self, subcommand: &str) -> Vec<Instant> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|(cmd, _)| cmd == subcommand)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    /// Highest number of invocations that were in flight at once
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_reply(&self, subcommand: &str) -> Reply {
        if let Some(reply) = self.queue.lock().unwrap().pop_front() {
            return reply;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(subcommand)
            .cloned()
            .unwrap_or_else(|| Reply::ok("{}"))
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ResticError> {
        self.invocations.lock().unwrap().push(invocation.clone());
        self.started
            .lock()
            .unwrap()
            .push((invocation.subcommand.clone(), Instant::now()));

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = RunningGuard(&self.running);
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ResticError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        match self.next_reply(&invocation.subcommand) {
            Reply::Output(output) => Ok(output),
            Reply::SpawnError(message) => Err(ResticError::Unknown(message)),
        }
    }
}

/// Runner for repository `name` backed by `executor`
pub fn runner(
    name: &str,
    executor: Arc<FakeExecutor>,
    metrics: Arc<Metrics>,
) -> CommandRunner {
    let handle: MetricsHandle = metrics;
    CommandRunner::new(
        name,
        format!("/srv/restic/{}", name),
        BTreeMap::new(),
        executor,
        handle,
    )
}

pub const SNAPSHOTS_JSON: &str = r#"[
    {"group_key": {"hostname": "laptop", "paths": ["/home"], "tags": null},
     "snapshots": [
        {"id": "a1", "short_id": "a1", "time": "2024-05-01T02:00:00Z", "hostname": "laptop", "paths": ["/home"]},
        {"id": "a2", "short_id": "a2", "time": "2024-05-02T02:00:00Z", "hostname": "laptop", "paths": ["/home"]}
     ]}
]"#;

pub const RESTORE_STATS_JSON: &str =
    r#"{"total_size": 1048576, "total_file_count": 321, "snapshots_count": 1}"#;

pub const RAW_STATS_JSON: &str = r#"{
    "total_size": 524288,
    "total_uncompressed_size": 1048576,
    "compression_ratio": 2.0,
    "compression_progress": 100,
    "compression_space_saving": 50,
    "total_blob_count": 900,
    "snapshots_count": 2
}"#;

pub const FORGET_JSON: &str = r#"[
    {"host": "laptop", "paths": ["/home"], "tags": null,
     "keep": [{"id": "a2", "time": "2024-05-02T02:00:00Z"}],
     "remove": [{"id": "a0", "time": "2024-04-30T02:00:00Z"}, {"id": "a1", "time": "2024-05-01T02:00:00Z"}],
     "reasons": []}
]"#;
