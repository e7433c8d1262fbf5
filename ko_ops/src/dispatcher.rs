//! ABOUTME: Executes named operations: validate, resolve, run ffmpeg, register
//! ABOUTME: Owns concat normalization and the external-process concurrency cap

use crate::argv::{
    build_argv, concat_demuxer_argv, concat_list_contents, concat_normalize_argv, Canvas,
};
use crate::ops::{ExtensionPolicy, Operation};
use ko_core::{Error, Id, MonotonicTimer, Result};
use ko_proc::{run_observed, CommandSpec, SpawnHandler, StderrLineHandler};
use ko_registry::{probe_media, FileId, FileOrigin, FileRegistry, MediaInfo, RootName};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// External toolchain locations
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

/// Immutable record of one operation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: Id,
    pub op: Operation,
    pub inputs: Vec<FileId>,
    pub output_name: Option<String>,
    pub output_ext: Option<String>,
}

impl Invocation {
    pub fn new(op: Operation, inputs: Vec<FileId>) -> Self {
        Self {
            id: Id::new(),
            op,
            inputs,
            output_name: None,
            output_ext: None,
        }
    }

    pub fn with_output_ext(mut self, ext: Option<String>) -> Self {
        self.output_ext = ext;
        self
    }
}

/// Result of a completed invocation
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub invocation_id: Id,
    pub output: FileId,
    pub output_path: PathBuf,
    pub elapsed: Duration,
}

/// Dispatcher over the closed operation set
///
/// All mutation of the registry flows through here for operation outputs;
/// a semaphore provides FIFO back-pressure on external processes.
pub struct Dispatcher {
    registry: Arc<FileRegistry>,
    toolchain: Toolchain,
    run_permits: Arc<Semaphore>,
    kill_grace: Duration,
    in_flight_pids: Arc<Mutex<HashSet<u32>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<FileRegistry>, toolchain: Toolchain, max_concurrent: usize) -> Self {
        Self {
            registry,
            toolchain,
            run_permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            kill_grace: Duration::from_secs(5),
            in_flight_pids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    /// Pids of external processes currently running on behalf of operations
    ///
    /// Hygiene scans consult this so live work is never classified killable.
    pub fn active_pids(&self) -> HashSet<u32> {
        self.in_flight_pids
            .lock()
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// Run one invocation to completion under a deadline
    ///
    /// Stages: validating -> resolving_inputs -> executing ->
    /// registering_output. The cancellation token is polled between stages;
    /// during execution a cancel drops the child (the process group dies
    /// with it).
    #[instrument(skip(self, cancel), fields(invocation = %invocation.id, op = invocation.op.name()))]
    pub async fn invoke(
        &self,
        invocation: Invocation,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome> {
        let timer = MonotonicTimer::new();
        let op_name = invocation.op.name();

        let result = self
            .invoke_inner(&invocation, deadline, cancel, &timer)
            .await;

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        counter!("operation_total", "op" => op_name, "status" => status.to_string()).increment(1);

        result
    }

    async fn invoke_inner(
        &self,
        invocation: &Invocation,
        deadline: Duration,
        cancel: &CancellationToken,
        timer: &MonotonicTimer,
    ) -> Result<InvocationOutcome> {
        // validating
        self.check_cancel(cancel)?;
        invocation.op.validate()?;
        let arity = invocation.op.arity();
        if !arity.contains(&invocation.inputs.len()) {
            return Err(Error::validation(
                "inputs",
                format!(
                    "{} takes {}..={} inputs, got {}",
                    invocation.op.name(),
                    arity.start(),
                    arity.end(),
                    invocation.inputs.len()
                ),
            ));
        }

        // resolving_inputs
        self.check_cancel(cancel)?;
        let mut input_paths = Vec::with_capacity(invocation.inputs.len());
        for id in &invocation.inputs {
            input_paths.push(self.registry.resolve(id).await?);
        }
        let mut probes: Vec<Option<MediaInfo>> = Vec::with_capacity(input_paths.len());
        for path in &input_paths {
            probes.push(probe_media(&self.toolchain.ffprobe_path, path).await.ok());
        }

        // executing
        self.check_cancel(cancel)?;
        let output_path = self.plan_output_path(invocation);
        debug!(output = %output_path.display(), "Executing operation");

        let permit = self
            .run_permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        let exec_result = match &invocation.op {
            Operation::Concat(params) => {
                self.execute_concat(
                    params.normalize,
                    &input_paths,
                    &probes,
                    &output_path,
                    deadline,
                    cancel,
                    timer,
                )
                .await
            }
            op => {
                let input_refs: Vec<&Path> = input_paths.iter().map(|p| p.as_path()).collect();
                let args = build_argv(op, &input_refs, &output_path, &probes)?;
                self.run_ffmpeg(args, remaining(deadline, timer)?, cancel, None)
                    .await
            }
        };
        drop(permit);
        if let Err(e) = exec_result {
            // Never leave a half-written, unregistered output behind
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(e);
        }

        // registering_output
        if cancel.is_cancelled() {
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(Error::Cancelled);
        }
        let output_id = self
            .registry
            .register_with_origin(&output_path, Some(FileOrigin::Generated))
            .await?;
        if let Ok(info) = probe_media(&self.toolchain.ffprobe_path, &output_path).await {
            if let Some(duration) = info.duration_s {
                let _ = self.registry.set_duration(&output_id, duration).await;
            }
        }

        let elapsed = timer.elapsed();
        info!(
            output = %output_id,
            elapsed_ms = elapsed.as_millis(),
            "Operation complete"
        );

        Ok(InvocationOutcome {
            invocation_id: invocation.id.clone(),
            output: output_id,
            output_path,
            elapsed,
        })
    }

    fn check_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn plan_output_path(&self, invocation: &Invocation) -> PathBuf {
        let root = match invocation.op {
            Operation::YoutubeRecommendedEncode => RootName::Finished,
            Operation::ExtractFrame(_) => RootName::Screenshots,
            _ => RootName::Temp,
        };

        let ext = invocation
            .output_ext
            .clone()
            .unwrap_or_else(|| match invocation.op.extension_policy() {
                ExtensionPolicy::Fixed(ext) => ext.to_string(),
                ExtensionPolicy::Inherit => "mp4".to_string(),
            });

        let base = invocation.output_name.clone().unwrap_or_else(|| {
            format!(
                "{}-{}",
                invocation.op.name(),
                invocation.id.to_string().to_lowercase()
            )
        });

        self.registry.derive_output_path(&base, &ext, root)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_concat(
        &self,
        normalize: bool,
        input_paths: &[PathBuf],
        probes: &[Option<MediaInfo>],
        output_path: &Path,
        deadline: Duration,
        cancel: &CancellationToken,
        timer: &MonotonicTimer,
    ) -> Result<()> {
        let known: Vec<&MediaInfo> = probes.iter().flatten().collect();
        let uniform = known.len() == probes.len()
            && known
                .windows(2)
                .all(|pair| pair[0].concat_compatible(pair[1]));

        let needs_normalize = if uniform {
            false
        } else if normalize {
            true
        } else {
            // Concat without normalization over mixed inputs is the classic
            // broken-output path; recover locally instead of failing
            warn!("Concat inputs are heterogeneous, enabling normalization");
            true
        };

        let mut staged: Vec<PathBuf> = Vec::new();
        let concat_inputs: Vec<PathBuf> = if needs_normalize {
            let canvas = Canvas::for_inputs(&known.iter().map(|p| (*p).clone()).collect::<Vec<_>>());
            let mut normalized = Vec::with_capacity(input_paths.len());
            for (index, input) in input_paths.iter().enumerate() {
                self.check_cancel(cancel)?;
                let intermediate = self.registry.derive_output_path(
                    &format!("concat-norm-{}", index),
                    "mp4",
                    RootName::Temp,
                );
                let args = concat_normalize_argv(input, canvas, &intermediate);
                let result = self
                    .run_ffmpeg(args, remaining(deadline, timer)?, cancel, None)
                    .await;
                if let Err(e) = result {
                    cleanup_staged(&staged).await;
                    return Err(e);
                }
                staged.push(intermediate.clone());
                normalized.push(intermediate);
            }
            normalized
        } else {
            input_paths.to_vec()
        };

        let list_path =
            self.registry
                .derive_output_path("concat-list", "txt", RootName::Temp);
        let input_refs: Vec<&Path> = concat_inputs.iter().map(|p| p.as_path()).collect();
        if let Err(e) = tokio::fs::write(&list_path, concat_list_contents(&input_refs)).await {
            cleanup_staged(&staged).await;
            return Err(e.into());
        }
        staged.push(list_path.clone());

        let args = concat_demuxer_argv(&list_path, output_path);
        let result = self
            .run_ffmpeg(args, remaining(deadline, timer)?, cancel, None)
            .await;

        cleanup_staged(&staged).await;
        result
    }

    async fn run_ffmpeg(
        &self,
        args: Vec<String>,
        budget: Duration,
        cancel: &CancellationToken,
        on_stderr_line: Option<StderrLineHandler>,
    ) -> Result<()> {
        let spec = CommandSpec::new(self.toolchain.ffmpeg_path.clone().into())
            .args(args.iter().map(|s| s.as_str()))
            .timeout(budget)
            .kill_after(self.kill_grace);

        let pids = Arc::clone(&self.in_flight_pids);
        let tracked = Arc::new(Mutex::new(None::<u32>));
        let tracked_sink = Arc::clone(&tracked);
        let on_spawn: SpawnHandler = Arc::new(move |pid| {
            if let Ok(mut set) = pids.lock() {
                set.insert(pid);
            }
            if let Ok(mut slot) = tracked_sink.lock() {
                *slot = Some(pid);
            }
        });

        // Dropping the run future on cancel drops the child handle, and
        // kill_on_drop takes the process group down with it
        let result = tokio::select! {
            result = run_observed(spec, on_stderr_line, Some(on_spawn)) => result,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        if let Ok(slot) = tracked.lock() {
            if let Some(pid) = *slot {
                if let Ok(mut set) = self.in_flight_pids.lock() {
                    set.remove(&pid);
                }
            }
        }
        let result = result?;

        if result.timed_out {
            return Err(Error::ExecTimeout {
                limit_s: budget.as_secs(),
            });
        }
        if !result.success() {
            return Err(Error::ExecFailed {
                code: result.exit_code.unwrap_or(-1),
                stderr_tail: result.stderr_tail(12),
            });
        }
        Ok(())
    }
}

fn remaining(deadline: Duration, timer: &MonotonicTimer) -> Result<Duration> {
    deadline
        .checked_sub(timer.elapsed())
        .filter(|left| !left.is_zero())
        .ok_or(Error::ExecTimeout {
            limit_s: deadline.as_secs(),
        })
}

async fn cleanup_staged(staged: &[PathBuf]) {
    for path in staged {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %e, "Staged intermediate already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{ConcatParams, TrimParams};
    use serde_json::json;
    use test_support::TestWorkspace;

    /// Fake ffmpeg/ffprobe: writes a byte to its last argument and exits 0,
    /// so execute/register paths run without a real toolchain
    fn fake_tool(ws: &TestWorkspace, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = ws.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn fake_toolchain(ws: &TestWorkspace) -> Toolchain {
        Toolchain {
            ffmpeg_path: fake_tool(
                ws,
                "fake-ffmpeg",
                r#"for last; do :; done; printf 'x' > "$last""#,
            ),
            // ffprobe that always fails keeps probes at None
            ffprobe_path: fake_tool(ws, "fake-ffprobe", "exit 1"),
        }
    }

    async fn dispatcher(ws: &TestWorkspace) -> (Dispatcher, Arc<FileRegistry>) {
        let roots = ko_registry::WorkspaceRoots::standard(ws.dir.path()).unwrap();
        let registry = Arc::new(FileRegistry::new(roots));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), fake_toolchain(ws), 2);
        (dispatcher, registry)
    }

    #[tokio::test]
    async fn test_invoke_trim_registers_output_in_temp() {
        let ws = TestWorkspace::new();
        let (dispatcher, registry) = dispatcher(&ws).await;
        let input = registry
            .register(&ws.write_fake_mp4("source", "clip.mp4"))
            .await
            .unwrap();

        let op = Operation::Trim(TrimParams {
            start: 2.0,
            duration: 3.0,
        });
        let outcome = dispatcher
            .invoke(
                Invocation::new(op, vec![input]),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let entry = registry.get(&outcome.output).await.unwrap();
        assert_eq!(entry.root, RootName::Temp);
        assert_eq!(entry.origin, FileOrigin::Generated);
    }

    #[tokio::test]
    async fn test_invoke_terminal_encode_lands_in_finished() {
        let ws = TestWorkspace::new();
        let (dispatcher, registry) = dispatcher(&ws).await;
        let input = registry
            .register(&ws.write_fake_mp4("temp", "staged.mp4"))
            .await
            .unwrap();

        let outcome = dispatcher
            .invoke(
                Invocation::new(Operation::YoutubeRecommendedEncode, vec![input]),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let entry = registry.get(&outcome.output).await.unwrap();
        assert_eq!(entry.root, RootName::Finished);
        assert_eq!(entry.path.extension().unwrap(), "mp4");
    }

    #[tokio::test]
    async fn test_extract_frame_lands_in_screenshots() {
        let ws = TestWorkspace::new();
        let (dispatcher, registry) = dispatcher(&ws).await;
        let input = registry
            .register(&ws.write_fake_mp4("source", "clip.mp4"))
            .await
            .unwrap();

        let op = Operation::ExtractFrame(crate::ops::ExtractFrameParams { timestamp: 1.5 });
        let outcome = dispatcher
            .invoke(
                Invocation::new(op, vec![input]),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let entry = registry.get(&outcome.output).await.unwrap();
        assert_eq!(entry.root, RootName::Screenshots);
        assert_eq!(entry.path.extension().unwrap(), "png");
    }

    #[tokio::test]
    async fn test_invoke_arity_mismatch() {
        let ws = TestWorkspace::new();
        let (dispatcher, registry) = dispatcher(&ws).await;
        let input = registry
            .register(&ws.write_fake_mp4("source", "clip.mp4"))
            .await
            .unwrap();

        let op = Operation::Concat(ConcatParams { normalize: true });
        let result = dispatcher
            .invoke(
                Invocation::new(op, vec![input]),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(Error::Validation { field, .. }) => assert_eq!(field, "inputs"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invoke_unknown_input() {
        let ws = TestWorkspace::new();
        let (dispatcher, _) = dispatcher(&ws).await;

        let op = Operation::Trim(TrimParams {
            start: 0.0,
            duration: 1.0,
        });
        let result = dispatcher
            .invoke(
                Invocation::new(op, vec![FileId::from("file_00000000")]),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(Error::UnknownFileId(_)) => {}
            other => panic!("expected UnknownFileId, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invoke_bad_params_short_circuits() {
        let ws = TestWorkspace::new();
        let (dispatcher, registry) = dispatcher(&ws).await;
        let input = registry
            .register(&ws.write_fake_mp4("source", "clip.mp4"))
            .await
            .unwrap();

        let parse = Operation::parse(
            "apply_filter",
            json!({"filter": {"type": "custom", "ffmpeg_filter": "-vf eq=brightness=0.1; rm -rf /"}}),
        );
        assert!(parse.is_err());

        // Pre-cancelled token never reaches execution either
        let cancel = CancellationToken::new();
        cancel.cancel();
        let op = Operation::Trim(TrimParams {
            start: 0.0,
            duration: 1.0,
        });
        let result = dispatcher
            .invoke(
                Invocation::new(op, vec![input]),
                Duration::from_secs(30),
                &cancel,
            )
            .await;
        match result {
            Err(Error::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concat_heterogeneous_normalizes_and_cleans_staging() {
        let ws = TestWorkspace::new();
        let (dispatcher, registry) = dispatcher(&ws).await;
        let a = registry
            .register(&ws.write_fake_mp4("source", "a.mp4"))
            .await
            .unwrap();
        let b = registry
            .register(&ws.write_fake_mp4("source", "b.mp4"))
            .await
            .unwrap();

        // Unprobeable inputs count as heterogeneous, forcing the
        // normalize-then-demux path even with normalize=false
        let op = Operation::Concat(ConcatParams { normalize: false });
        let outcome = dispatcher
            .invoke(
                Invocation::new(op, vec![a, b]),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.output_path.exists());
        // Staged intermediates and the list file are gone
        let leftovers: Vec<_> = std::fs::read_dir(ws.root("temp"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.contains("concat-norm") || name.contains("concat-list"))
            .collect();
        assert!(leftovers.is_empty(), "staging left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_failed_ffmpeg_surfaces_stderr_tail() {
        let ws = TestWorkspace::new();
        let roots = ko_registry::WorkspaceRoots::standard(ws.dir.path()).unwrap();
        let registry = Arc::new(FileRegistry::new(roots));
        let toolchain = Toolchain {
            ffmpeg_path: fake_tool(&ws, "failing-ffmpeg", "echo boom >&2; exit 3"),
            ffprobe_path: fake_tool(&ws, "fake-ffprobe", "exit 1"),
        };
        let dispatcher = Dispatcher::new(Arc::clone(&registry), toolchain, 2);
        let input = registry
            .register(&ws.write_fake_mp4("source", "clip.mp4"))
            .await
            .unwrap();

        let op = Operation::Trim(TrimParams {
            start: 0.0,
            duration: 1.0,
        });
        let result = dispatcher
            .invoke(
                Invocation::new(op, vec![input]),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(Error::ExecFailed { code, stderr_tail }) => {
                assert_eq!(code, 3);
                assert!(stderr_tail.contains("boom"));
            }
            other => panic!("expected ExecFailed, got {:?}", other),
        }
    }
}
