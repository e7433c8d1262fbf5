//! ABOUTME: The kompost kernel façade: typed entry points behind the MCP tools
//! ABOUTME: Owns the registry, dispatcher, operation manager, and collaborators

use ko_config::Config;
use ko_core::{Error, Result};
use ko_hygiene::{ClassificationRecord, KillResult, KillSummary, ProcessHygiene};
use ko_intake::IntakeService;
use ko_manager::{
    estimate::{estimate, Estimate, Quality},
    CleanupFn, CleanupReport, HandleSnapshot, OperationManager,
};
use ko_ops::{Dispatcher, Invocation, Operation, Toolchain};
use ko_plan::{
    BuildPlan, Compiler, PartialOutputs, PlanExecutor, ValidationIssue,
};
use ko_registry::{
    FileEntry, FileId, FileKind, FileRegistry, ListFilter, RescanReport, RootName, WorkspaceRoots,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{info, instrument, warn};

pub mod envelope;

pub use envelope::envelope;

/// Sentinel a batch step uses to consume the previous step's output
pub const OUTPUT_PREVIOUS: &str = "OUTPUT_PREVIOUS";

/// Whether create_video stops after compilation or executes the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    PlanOnly,
    #[default]
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredFile {
    pub file_id: FileId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedFile {
    pub file_id: FileId,
}

/// One step of a batch_process call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStep {
    /// File IDs, or the OUTPUT_PREVIOUS sentinel
    pub inputs: Vec<String>,
    pub op: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub output_ext: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVideoResult {
    pub plan: BuildPlan,
    pub output_id: Option<FileId>,
    pub timeout_info: Estimate,
    pub warnings: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimateResult {
    pub estimated_seconds: u64,
    pub complexity: ko_manager::Complexity,
    pub recommended_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub active: Vec<HandleSnapshot>,
    pub recent: Vec<HandleSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupResult {
    pub removed_files: Vec<String>,
    pub killed_processes: Vec<u32>,
    pub warnings: Vec<String>,
}

/// The orchestration kernel behind the MCP tool surface
///
/// Single owning coordinator: all registry and handle mutation flows
/// through here; collaborators receive handles.
pub struct Kernel {
    config: Config,
    registry: Arc<FileRegistry>,
    dispatcher: Arc<Dispatcher>,
    manager: Arc<OperationManager>,
    compiler: Compiler,
    plan_executor: PlanExecutor,
    intake: IntakeService,
    hygiene: ProcessHygiene,
    /// Partial-output sets of plan runs not yet reconciled by cleanup
    outstanding: Mutex<Vec<Arc<PartialOutputs>>>,
}

impl Kernel {
    /// Wire every component from configuration, creating workspace roots
    pub fn new(config: Config) -> Result<Self> {
        let base = PathBuf::from(&config.workspace.base_dir);
        let roots = WorkspaceRoots::create(
            &base,
            &[
                (RootName::Source, config.workspace.source_dir.as_str()),
                (RootName::Temp, config.workspace.temp_dir.as_str()),
                (RootName::Finished, config.workspace.finished_dir.as_str()),
                (RootName::Metadata, config.workspace.metadata_dir.as_str()),
                (
                    RootName::Screenshots,
                    config.workspace.screenshots_dir.as_str(),
                ),
            ],
        )?;
        let registry = Arc::new(FileRegistry::new(roots));

        let toolchain = Toolchain {
            ffmpeg_path: config.toolchain.ffmpeg_path.clone(),
            ffprobe_path: config.toolchain.ffprobe_path.clone(),
        };
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&registry),
                toolchain,
                config.execution.max_concurrent_processes,
            )
            .with_kill_grace(Duration::from_secs(config.execution.kill_grace_s)),
        );

        let manager = Arc::new(OperationManager::new(Duration::from_secs(
            config.execution.handle_retention_s,
        )));
        let compiler = Compiler::new(Arc::clone(&registry));
        let plan_executor = PlanExecutor::new(Arc::clone(&dispatcher));
        let intake = IntakeService::new(config.intake.clone(), &config.ai);

        let pid_source = Arc::clone(&dispatcher);
        let hygiene = ProcessHygiene::new(
            config.hygiene.clone(),
            Arc::new(move || pid_source.active_pids()),
        );

        info!(base = %base.display(), "Kernel initialized");
        Ok(Self {
            config,
            registry,
            dispatcher,
            manager,
            compiler,
            plan_executor,
            intake,
            hygiene,
            outstanding: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    /// list_files tool
    pub async fn list_files(&self, filter: Option<ListFilter>) -> Result<Vec<FileEntry>> {
        Ok(self.registry.list(&filter.unwrap_or_default()).await)
    }

    /// register_file tool
    pub async fn register_file(&self, path: &Path) -> Result<RegisteredFile> {
        let file_id = self.registry.register(path).await?;
        Ok(RegisteredFile { file_id })
    }

    /// rescan a workspace root
    pub async fn rescan(&self, root: RootName) -> Result<RescanReport> {
        self.registry.rescan(root).await
    }

    /// process_file tool: one named operation under the default deadline
    #[instrument(skip(self, params))]
    pub async fn process_file(
        &self,
        inputs: Vec<FileId>,
        op_name: &str,
        params: serde_json::Value,
        output_ext: Option<String>,
    ) -> Result<ProcessedFile> {
        let op = Operation::parse(op_name, params)?;
        let invocation = Invocation::new(op, inputs).with_output_ext(output_ext);
        let deadline = Duration::from_secs(self.config.execution.default_deadline_s);
        // The dispatcher enforces the real deadline (and removes partial
        // output); the wrapper fires only if that path wedges
        let outer = deadline + Duration::from_secs(self.config.execution.kill_grace_s);
        let dispatcher = Arc::clone(&self.dispatcher);

        let outcome = self
            .manager
            .execute_with_timeout(
                op_name,
                deadline.as_secs(),
                outer,
                None,
                move |_, token| async move { dispatcher.invoke(invocation, deadline, &token).await },
            )
            .await?;

        Ok(ProcessedFile {
            file_id: outcome.output,
        })
    }

    /// batch_process tool: sequential steps with OUTPUT_PREVIOUS chaining
    pub async fn batch_process(&self, steps: Vec<BatchStep>) -> Result<Vec<FileId>> {
        let mut outputs: Vec<FileId> = Vec::with_capacity(steps.len());
        let mut previous: Option<FileId> = None;

        for (index, step) in steps.into_iter().enumerate() {
            let mut inputs = Vec::with_capacity(step.inputs.len());
            for raw in &step.inputs {
                if raw == OUTPUT_PREVIOUS {
                    let id = previous.clone().ok_or_else(|| {
                        Error::validation(
                            format!("steps[{}].inputs", index),
                            "OUTPUT_PREVIOUS used before any step produced output",
                        )
                    })?;
                    inputs.push(id);
                } else {
                    inputs.push(FileId::from(raw.as_str()));
                }
            }

            let processed = self
                .process_file(inputs, &step.op, step.params, step.output_ext)
                .await?;
            previous = Some(processed.file_id.clone());
            outputs.push(processed.file_id);
        }
        Ok(outputs)
    }

    /// create_video_from_description tool
    #[instrument(skip(self))]
    pub async fn create_video_from_description(
        &self,
        description: &str,
        mode: ExecutionMode,
        quality: Quality,
    ) -> Result<CreateVideoResult> {
        let videos = self
            .registry
            .list(&ListFilter {
                kind: Some(FileKind::Video),
                ..Default::default()
            })
            .await;
        let audio = self
            .registry
            .list(&ListFilter {
                kind: Some(FileKind::Audio),
                ..Default::default()
            })
            .await;

        let komposition = self.intake.compose(description, &videos, &audio).await?;
        let compiled = self.compiler.compile(&komposition).await?;
        let timeout_info = estimate(description, quality, &self.config.estimator);

        // Both the accepted document and its plan land under metadata/
        self.compiler.persist_komposition(&komposition).await?;
        self.compiler.persist_plan(&compiled.plan).await?;

        if mode == ExecutionMode::PlanOnly {
            return Ok(CreateVideoResult {
                plan: compiled.plan,
                output_id: None,
                timeout_info,
                warnings: compiled.report.warnings,
            });
        }

        // The plan's own cost estimate drives the deadline; the description
        // estimate is reported to the client
        let plan_deadline_s = ((compiled.plan.total_estimated_cost_s * 1.5) as u64).clamp(60, 1800);
        let deadline = Duration::from_secs(plan_deadline_s.max(timeout_info.deadline_s));
        let outer = deadline + Duration::from_secs(self.config.execution.kill_grace_s);

        let scratch = PartialOutputs::new();
        if let Ok(mut outstanding) = self.outstanding.lock() {
            outstanding.push(Arc::clone(&scratch));
        }

        let cleanup = self.partial_cleanup_fn(Arc::clone(&scratch));
        let plan = compiled.plan.clone();
        let executor = &self.plan_executor;
        let scratch_for_run = Arc::clone(&scratch);

        let result = self
            .manager
            .execute_with_timeout(
                "create_video_from_description",
                timeout_info.cost_s,
                outer,
                Some(cleanup),
                move |_, token| async move {
                    executor
                        .execute(&plan, deadline, &token, scratch_for_run, None)
                        .await
                },
            )
            .await;

        match result {
            Ok(executed) => {
                // Completed runs have nothing left to reconcile
                if let Ok(mut outstanding) = self.outstanding.lock() {
                    outstanding.retain(|set| !Arc::ptr_eq(set, &scratch));
                }
                Ok(CreateVideoResult {
                    plan: compiled.plan,
                    output_id: Some(executed.final_output),
                    timeout_info,
                    warnings: compiled.report.warnings,
                })
            }
            Err(error) => {
                if self.config.cleanup.delete_partial {
                    // Cleanup already drained this set
                    if let Ok(mut outstanding) = self.outstanding.lock() {
                        outstanding.retain(|set| !set.is_empty());
                    }
                }
                Err(error)
            }
        }
    }

    /// estimate_processing_time tool
    pub fn estimate_processing_time(
        &self,
        description: &str,
        mode: ExecutionMode,
        quality: Quality,
    ) -> EstimateResult {
        let estimate = estimate(description, quality, &self.config.estimator);
        match mode {
            ExecutionMode::PlanOnly => EstimateResult {
                estimated_seconds: 5,
                complexity: estimate.complexity,
                recommended_timeout: 60,
            },
            ExecutionMode::Full => EstimateResult {
                estimated_seconds: estimate.cost_s,
                complexity: estimate.complexity,
                recommended_timeout: estimate.deadline_s,
            },
        }
    }

    /// get_operation_status tool
    pub async fn get_operation_status(&self) -> OperationStatus {
        OperationStatus {
            active: self.manager.list_active().await,
            recent: self.manager.list_recent().await,
        }
    }

    /// cleanup_partial_operations tool; idempotent, always succeeds
    #[instrument(skip(self))]
    pub async fn cleanup_partial_operations(&self) -> CleanupResult {
        let mut result = CleanupResult::default();

        let sets: Vec<Arc<PartialOutputs>> = match self.outstanding.lock() {
            Ok(mut outstanding) => outstanding.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for set in sets {
            for (id, path) in set.take_nonfinal() {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    result
                        .warnings
                        .push(format!("could not remove {}: {}", path.display(), e));
                }
                if self.registry.unregister(&id).await.is_ok() {
                    result.removed_files.push(id.to_string());
                }
            }
        }

        let summary = self.hygiene.kill_all_safe(false);
        result.killed_processes = summary.killed;
        result.warnings.extend(summary.warnings);

        info!(
            removed = result.removed_files.len(),
            killed = result.killed_processes.len(),
            "Partial-operation cleanup complete"
        );
        result
    }

    /// scan_zombie_processes tool
    pub fn scan_zombie_processes(&self) -> Vec<ClassificationRecord> {
        self.hygiene.scan()
    }

    /// kill_zombie_processes tool
    pub fn kill_zombie_processes(&self, pids: &[u32], force: bool) -> Vec<KillResult> {
        self.hygiene.kill(pids, force)
    }

    /// kill_all_safe_zombies tool
    pub fn kill_all_safe_zombies(&self, force: bool) -> KillSummary {
        self.hygiene.kill_all_safe(force)
    }

    /// Build the cleanup callback for one plan run
    fn partial_cleanup_fn(&self, scratch: Arc<PartialOutputs>) -> CleanupFn {
        let registry = Arc::clone(&self.registry);
        let delete_partial = self.config.cleanup.delete_partial;
        Box::new(move || {
            Box::pin(async move {
                let mut report = CleanupReport::default();
                if delete_partial {
                    let partials = scratch.take_nonfinal();
                    let mut all_ok = true;
                    let count = partials.len();
                    for (id, path) in partials {
                        if tokio::fs::remove_file(&path).await.is_err() {
                            warn!(path = %path.display(), "Partial output already gone");
                            all_ok = false;
                        }
                        let _ = registry.unregister(&id).await;
                    }
                    report = report.step(
                        "remove_partial_outputs",
                        all_ok,
                        Some(format!("{} files", count)),
                    );
                } else {
                    report = report.step("retain_intermediates", true, None);
                }
                // Child process groups die with the dropped run future
                report.step("kill_child_processes", true, None)
            })
        })
    }
}
