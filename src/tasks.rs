//! Named background tasks owned by the daemon

use std::future::Future;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// A set of named tasks; dropping the set aborts whatever is still running
#[derive(Default)]
pub struct TaskSet {
    tasks: JoinSet<String>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "spawning task");
        self.tasks.spawn(async move {
            fut.await;
            name
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task to finish, logging panics
    pub async fn join_all(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(name) => debug!(task = %name, "task finished"),
                Err(e) if e.is_panic() => error!(error = %e, "task panicked"),
                Err(e) => debug!(error = %e, "task cancelled"),
            }
        }
    }
}
