//! Background worker: a tokio task paired with its cancellation token.
//!
//! Sweeps, the oscilloscope monitor and calibration recording all run as a
//! [`Worker`], so stopping any of them looks the same: trigger the flag, then
//! join.

use crate::abort::AbortFlag;
use crate::error::{AppResult, CplError};
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::debug;

/// A named background task and the [`AbortFlag`] it polls.
#[derive(Debug)]
pub struct Worker<T> {
    name: String,
    abort: AbortFlag,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn `task` on the runtime, handing it a clone of `abort`.
    pub fn spawn<F, Fut>(name: impl Into<String>, abort: AbortFlag, task: F) -> Self
    where
        F: FnOnce(AbortFlag) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        debug!(worker = %name, "Spawning worker");
        let handle = tokio::spawn(task(abort.clone()));
        Self {
            name,
            abort,
            handle,
        }
    }

    /// Worker name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancellation token polled by the task.
    pub fn abort_flag(&self) -> &AbortFlag {
        &self.abort
    }

    /// Ask the task to stop. Does not wait.
    pub fn stop(&self, reason: impl Into<String>) {
        self.abort.trigger(reason);
    }

    /// Whether the task has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to return.
    pub async fn join(self) -> AppResult<T> {
        let name = self.name;
        self.handle.await.map_err(|e| CplError::Worker {
            name,
            message: e.to_string(),
        })
    }

    /// Trigger the flag and wait for the task to return.
    pub async fn stop_and_join(self, reason: impl Into<String>) -> AppResult<T> {
        self.stop(reason);
        self.join().await
    }
}
