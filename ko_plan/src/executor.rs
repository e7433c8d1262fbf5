//! ABOUTME: Topological build-plan execution with output chaining
//! ABOUTME: Fail-fast, progress events, and partial-output tracking for cleanup

use crate::plan::{BuildPlan, NodeInput};
use ko_core::{Error, MonotonicTimer, Result};
use ko_ops::{Dispatcher, Invocation};
use ko_registry::FileId;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Per-node start/end events emitted to a caller-supplied sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    NodeStarted {
        node_id: String,
        index: usize,
        total: usize,
    },
    NodeFinished {
        node_id: String,
        elapsed_s: f64,
        estimated_remaining_s: f64,
    },
}

pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Files registered during one plan run, for post-failure cleanup
///
/// The surrounding timeout wrapper drains this on expiry or failure; a
/// completed run marks its final artifact so cleanup never touches it.
#[derive(Default)]
pub struct PartialOutputs {
    entries: Mutex<Vec<(FileId, PathBuf)>>,
    final_output: Mutex<Option<FileId>>,
}

impl PartialOutputs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, id: FileId, path: PathBuf) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((id, path));
        }
    }

    fn mark_final(&self, id: FileId) {
        if let Ok(mut slot) = self.final_output.lock() {
            *slot = Some(id);
        }
    }

    /// All recorded outputs except the declared final artifact
    pub fn take_nonfinal(&self) -> Vec<(FileId, PathBuf)> {
        let final_id = self
            .final_output
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        match self.entries.lock() {
            Ok(mut entries) => {
                let (keep, drain): (Vec<_>, Vec<_>) = entries
                    .drain(..)
                    .partition(|(id, _)| Some(id) == final_id.as_ref());
                *entries = keep;
                drain
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.is_empty())
            .unwrap_or(true)
    }
}

/// Result of a fully executed plan
#[derive(Debug, Clone)]
pub struct ExecutedPlan {
    pub final_output: FileId,
    pub final_path: PathBuf,
    pub node_outputs: HashMap<String, FileId>,
}

/// Executes compiled plans node by node through the dispatcher
pub struct PlanExecutor {
    dispatcher: Arc<Dispatcher>,
}

impl PlanExecutor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run the plan in its emitted (topological) order
    ///
    /// Node inputs resolve through the registry for file refs and the
    /// node-output table for node refs. A node failure fails the plan;
    /// nothing is retried here. Outputs are recorded into `scratch` as they
    /// register so the caller's cleanup can find them.
    #[instrument(skip(self, plan, cancel, scratch, sink), fields(plan_id = %plan.id))]
    pub async fn execute(
        &self,
        plan: &BuildPlan,
        deadline: Duration,
        cancel: &CancellationToken,
        scratch: Arc<PartialOutputs>,
        sink: Option<ProgressSink>,
    ) -> Result<ExecutedPlan> {
        plan.validate()?;
        let timer = MonotonicTimer::new();
        let total = plan.nodes.len();
        let mut node_outputs: HashMap<String, FileId> = HashMap::new();
        let mut last_outcome: Option<(FileId, PathBuf)> = None;

        for (index, node) in plan.nodes.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(node = %node.id, "Plan cancelled before node start");
                return Err(Error::Cancelled);
            }

            if let Some(sink) = &sink {
                sink(ProgressEvent::NodeStarted {
                    node_id: node.id.clone(),
                    index,
                    total,
                });
            }

            let mut input_ids = Vec::with_capacity(node.inputs.len());
            for input in &node.inputs {
                match input {
                    NodeInput::File(id) => input_ids.push(id.clone()),
                    NodeInput::Node(reference) => {
                        let id = node_outputs.get(reference).cloned().ok_or_else(|| {
                            Error::PlanCompile(format!(
                                "node {} consumes unexecuted node {}",
                                node.id, reference
                            ))
                        })?;
                        input_ids.push(id);
                    }
                }
            }

            let budget = deadline
                .checked_sub(timer.elapsed())
                .filter(|left| !left.is_zero())
                .ok_or(Error::ExecTimeout {
                    limit_s: deadline.as_secs(),
                })?;

            let invocation = Invocation {
                id: ko_core::Id::new(),
                op: node.op.clone(),
                inputs: input_ids,
                output_name: Some(node.produces.name.clone()),
                output_ext: Some(node.produces.ext.clone()),
            };

            let outcome = self.dispatcher.invoke(invocation, budget, cancel).await?;
            scratch.record(outcome.output.clone(), outcome.output_path.clone());
            node_outputs.insert(node.id.clone(), outcome.output.clone());
            last_outcome = Some((outcome.output, outcome.output_path));

            if let Some(sink) = &sink {
                let remaining: f64 = plan.nodes[index + 1..]
                    .iter()
                    .map(|later| later.estimated_cost_s)
                    .sum();
                sink(ProgressEvent::NodeFinished {
                    node_id: node.id.clone(),
                    elapsed_s: timer.elapsed().as_secs_f64(),
                    estimated_remaining_s: remaining,
                });
            }
        }

        let (final_output, final_path) = last_outcome.ok_or_else(|| {
            Error::PlanCompile("plan produced no terminal output".to_string())
        })?;
        scratch.mark_final(final_output.clone());

        info!(
            final_output = %final_output,
            nodes = total,
            elapsed_s = timer.elapsed().as_secs_f64(),
            "Plan executed"
        );
        Ok(ExecutedPlan {
            final_output,
            final_path,
            node_outputs,
        })
    }
}
