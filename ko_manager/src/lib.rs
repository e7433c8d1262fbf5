//! ABOUTME: Timeout and operation manager bounding every long-running task
//! ABOUTME: Handle table with retention, cancellation, and duration estimation

use futures_util::future::BoxFuture;
use ko_core::{now_iso8601, Error, Id, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub mod estimate;

pub use estimate::{classify_complexity, extract_duration, Complexity, Estimate, Quality};

/// Lifecycle state of an operation handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Running,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

impl OpStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OpStatus::Pending | OpStatus::Running)
    }
}

/// One step of a timeout/cancel cleanup, with its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupStep {
    pub name: String,
    pub ok: bool,
    pub detail: Option<String>,
}

/// Which cleanup steps ran and whether they succeeded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub steps: Vec<CleanupStep>,
}

impl CleanupReport {
    pub fn step(mut self, name: impl Into<String>, ok: bool, detail: Option<String>) -> Self {
        self.steps.push(CleanupStep {
            name: name.into(),
            ok,
            detail,
        });
        self
    }

    pub fn all_ok(&self) -> bool {
        self.steps.iter().all(|step| step.ok)
    }
}

/// Deferred cleanup invoked when a wrapped task times out or is cancelled
pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, CleanupReport> + Send>;

struct HandleState {
    label: String,
    status: OpStatus,
    token: CancellationToken,
    started: Instant,
    started_at: String,
    estimate_s: u64,
    deadline_s: u64,
    finished: Option<Instant>,
    finished_at: Option<String>,
    cleanup: Option<CleanupReport>,
}

/// Serializable view of a handle for status polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleSnapshot {
    pub op_id: String,
    pub label: String,
    pub status: OpStatus,
    pub started_at: String,
    pub estimate_s: u64,
    pub deadline_s: u64,
    pub elapsed_s: f64,
    pub finished_at: Option<String>,
    pub cleanup: Option<CleanupReport>,
}

/// Owner of all operation handles
///
/// Wraps long-running tasks with a hard deadline, tracks active and recently
/// terminated operations, and drives cleanup on expiry. Terminal handles
/// stay pollable for a retention window, then get swept.
pub struct OperationManager {
    handles: RwLock<HashMap<Id, HandleState>>,
    retention: Duration,
}

impl OperationManager {
    pub fn new(retention: Duration) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Run a task under a deadline, registering a pollable handle
    ///
    /// The task receives its operation ID and a cancellation token it must
    /// poll between stages. On expiry the token is cancelled, the cleanup
    /// callback runs, and the handle records which steps succeeded.
    #[instrument(skip(self, cleanup, task))]
    pub async fn execute_with_timeout<T, F, Fut>(
        &self,
        label: &str,
        estimate_s: u64,
        deadline: Duration,
        cleanup: Option<CleanupFn>,
        task: F,
    ) -> Result<T>
    where
        F: FnOnce(Id, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op_id = Id::new();
        let token = CancellationToken::new();

        {
            let mut handles = self.handles.write().await;
            handles.insert(
                op_id.clone(),
                HandleState {
                    label: label.to_string(),
                    status: OpStatus::Running,
                    token: token.clone(),
                    started: Instant::now(),
                    started_at: now_iso8601(),
                    estimate_s,
                    deadline_s: deadline.as_secs(),
                    finished: None,
                    finished_at: None,
                    cleanup: None,
                },
            );
        }
        info!(op_id = %op_id, label, deadline_s = deadline.as_secs(), "Operation started");

        let outcome = tokio::select! {
            result = task(op_id.clone(), token.clone()) => Some(result),
            _ = tokio::time::sleep(deadline) => None,
        };

        match outcome {
            Some(Ok(value)) => {
                self.finish(&op_id, OpStatus::Completed, None).await;
                counter!("operation_completed_total").increment(1);
                Ok(value)
            }
            Some(Err(Error::Cancelled)) => {
                let report = match cleanup {
                    Some(callback) => callback().await,
                    None => CleanupReport::default(),
                };
                self.finish(&op_id, OpStatus::Cancelled, Some(report)).await;
                counter!("operation_cancelled_total").increment(1);
                Err(Error::Cancelled)
            }
            Some(Err(error)) => {
                let report = match cleanup {
                    Some(callback) => callback().await,
                    None => CleanupReport::default(),
                };
                // A task that hit its own command deadline is a timeout, not
                // an ordinary failure
                let status = match &error {
                    Error::ExecTimeout { .. } => OpStatus::TimedOut,
                    _ => OpStatus::Failed,
                };
                self.finish(&op_id, status, Some(report)).await;
                match status {
                    OpStatus::TimedOut => {
                        counter!("operation_timeout_total").increment(1);
                    }
                    _ => {
                        counter!("operation_failed_total").increment(1);
                    }
                }
                Err(error)
            }
            None => {
                warn!(op_id = %op_id, label, "Operation deadline expired, cancelling");
                token.cancel();
                let report = match cleanup {
                    Some(callback) => callback().await,
                    None => CleanupReport::default(),
                };
                self.finish(&op_id, OpStatus::TimedOut, Some(report)).await;
                counter!("operation_timeout_total").increment(1);
                Err(Error::Timeout {
                    op_id: op_id.to_string(),
                    estimate_s,
                    limit_s: deadline.as_secs(),
                })
            }
        }
    }

    async fn finish(&self, op_id: &Id, status: OpStatus, cleanup: Option<CleanupReport>) {
        let mut handles = self.handles.write().await;
        if let Some(state) = handles.get_mut(op_id) {
            state.status = status;
            state.finished = Some(Instant::now());
            state.finished_at = Some(now_iso8601());
            if cleanup.is_some() {
                state.cleanup = cleanup;
            }
        }
    }

    /// Cancel a running operation; cancelling a terminal one is a no-op
    pub async fn cancel(&self, op_id: &Id) -> bool {
        let handles = self.handles.read().await;
        match handles.get(op_id) {
            Some(state) if !state.status.is_terminal() => {
                info!(op_id = %op_id, "Cancelling operation");
                state.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Snapshot of one handle
    pub async fn status(&self, op_id: &Id) -> Option<HandleSnapshot> {
        self.sweep_retired().await;
        let handles = self.handles.read().await;
        handles.get(op_id).map(|state| snapshot(op_id, state))
    }

    /// All non-terminal handles
    pub async fn list_active(&self) -> Vec<HandleSnapshot> {
        self.sweep_retired().await;
        let handles = self.handles.read().await;
        let mut active: Vec<HandleSnapshot> = handles
            .iter()
            .filter(|(_, state)| !state.status.is_terminal())
            .map(|(id, state)| snapshot(id, state))
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Terminal handles still inside the retention window
    pub async fn list_recent(&self) -> Vec<HandleSnapshot> {
        self.sweep_retired().await;
        let handles = self.handles.read().await;
        let mut recent: Vec<HandleSnapshot> = handles
            .iter()
            .filter(|(_, state)| state.status.is_terminal())
            .map(|(id, state)| snapshot(id, state))
            .collect();
        recent.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        recent
    }

    /// Whether any operation is currently running
    pub async fn has_active(&self) -> bool {
        let handles = self.handles.read().await;
        handles.values().any(|state| !state.status.is_terminal())
    }

    /// Drop terminal handles older than the retention window
    async fn sweep_retired(&self) {
        let mut handles = self.handles.write().await;
        let retention = self.retention;
        handles.retain(|_, state| match (state.status.is_terminal(), state.finished) {
            (true, Some(finished)) => finished.elapsed() < retention,
            _ => true,
        });
    }
}

fn snapshot(op_id: &Id, state: &HandleState) -> HandleSnapshot {
    let elapsed = match state.finished {
        Some(finished) => finished.duration_since(state.started),
        None => state.started.elapsed(),
    };
    HandleSnapshot {
        op_id: op_id.to_string(),
        label: state.label.clone(),
        status: state.status,
        started_at: state.started_at.clone(),
        estimate_s: state.estimate_s,
        deadline_s: state.deadline_s,
        elapsed_s: elapsed.as_secs_f64(),
        finished_at: state.finished_at.clone(),
        cleanup: state.cleanup.clone(),
    }
}
