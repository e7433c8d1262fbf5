//! ABOUTME: Process runner for external commands with deadlines and group kill
//! ABOUTME: Manages execution of ffmpeg, ffprobe, and other external tools

use ko_core::{Error, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    time::timeout,
};
use tracing::{debug, info, instrument, warn};

/// Maximum bytes to capture from stdout/stderr
const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024; // 1MB

/// Callback invoked for each stderr line as the child produces it
///
/// Long-running media tools report progress on stderr; callers use this to
/// drive progress heuristics without waiting for process exit.
pub type StderrLineHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked with the child's pid right after a successful spawn
///
/// Lets callers keep an in-flight pid set for hygiene cross-checks.
pub type SpawnHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// Command specification for process execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Path to the program to execute
    pub program: PathBuf,
    /// Command line arguments (always a positional list, never a shell string)
    pub args: Vec<String>,
    /// Environment variables to set
    pub env: Vec<(String, String)>,
    /// Working directory for the command
    pub cwd: Option<PathBuf>,
    /// Bytes written to the child's stdin before it is closed
    pub stdin: Option<String>,
    /// Deadline for command execution
    pub timeout: Duration,
    /// Grace period between soft-terminate and force-kill
    pub kill_after: Duration,
    /// Maximum bytes to capture from stdout
    pub stdout_limit: Option<usize>,
    /// Maximum bytes to capture from stderr
    pub stderr_limit: Option<usize>,
}

impl CommandSpec {
    /// Create a new command spec with default timeout settings
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin: None,
            timeout: Duration::from_secs(300),
            kill_after: Duration::from_secs(5),
            stdout_limit: Some(DEFAULT_OUTPUT_LIMIT),
            stderr_limit: Some(DEFAULT_OUTPUT_LIMIT),
        }
    }

    /// Add command line arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Set environment variables from a HashMap
    pub fn env_map(mut self, env: HashMap<String, String>) -> Self {
        self.env = env.into_iter().collect();
        self
    }

    /// Add a single environment variable
    pub fn env_var<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.env
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Set working directory
    pub fn cwd<P: Into<PathBuf>>(mut self, cwd: P) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Provide stdin contents
    pub fn stdin<S: Into<String>>(mut self, stdin: S) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Set deadline duration
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set kill grace period after the deadline
    pub fn kill_after(mut self, kill_after: Duration) -> Self {
        self.kill_after = kill_after;
        self
    }
}

/// Result of command execution
///
/// A non-zero exit is NOT an error at this layer; the caller classifies.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code if the process exited normally
    pub exit_code: Option<i32>,
    /// Captured stdout (bounded)
    pub stdout: String,
    /// Captured stderr (bounded)
    pub stderr: String,
    /// Total execution duration
    pub duration: Duration,
    /// Whether the command was killed due to deadline expiry
    pub timed_out: bool,
    /// Whether stdout was truncated due to size limits
    pub stdout_truncated: bool,
    /// Whether stderr was truncated due to size limits
    pub stderr_truncated: bool,
}

impl CommandResult {
    /// Check if the command succeeded (exit code 0, no timeout)
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Last `n` lines of stderr, for diagnostic surfacing
    pub fn stderr_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Run a command with no stderr streaming
pub async fn run(spec: CommandSpec) -> Result<CommandResult> {
    run_streamed(spec, None).await
}

/// Run a command, streaming stderr lines to an optional handler
pub async fn run_streamed(
    spec: CommandSpec,
    on_stderr_line: Option<StderrLineHandler>,
) -> Result<CommandResult> {
    run_observed(spec, on_stderr_line, None).await
}

/// Run a command with stderr streaming and spawn observation
///
/// On deadline expiry the child's process group gets a soft terminate, then
/// after the grace period a force kill. The call never returns before the
/// child is reaped.
#[instrument(skip(spec, on_stderr_line, on_spawn), fields(program = %spec.program.display()))]
pub async fn run_observed(
    spec: CommandSpec,
    on_stderr_line: Option<StderrLineHandler>,
    on_spawn: Option<SpawnHandler>,
) -> Result<CommandResult> {
    let start = Instant::now();

    info!(
        program = %spec.program.display(),
        args = ?spec.args,
        timeout_secs = spec.timeout.as_secs(),
        "Starting command execution"
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if spec.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    // New process group so deadline kills take the whole child tree
    #[cfg(unix)]
    cmd.process_group(0);

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|e| Error::ExecSpawn {
        program: spec.program.display().to_string(),
        message: e.to_string(),
    })?;

    let child_pid = child.id();
    if let (Some(handler), Some(pid)) = (&on_spawn, child_pid) {
        handler(pid);
    }

    if let Some(input) = &spec.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = input.clone().into_bytes();
            if let Err(e) = stdin.write_all(&bytes).await {
                warn!(error = %e, "Failed to write child stdin");
            }
            // Dropping the handle closes the pipe
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Config("Failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Config("Failed to capture stderr".to_string()))?;

    // Capture tasks run independently of the wait so partial output survives
    // a deadline kill; they finish at pipe EOF once the child is dead.
    let stdout_limit = spec.stdout_limit.unwrap_or(DEFAULT_OUTPUT_LIMIT);
    let stderr_limit = spec.stderr_limit.unwrap_or(DEFAULT_OUTPUT_LIMIT);
    let stdout_task = tokio::spawn(capture_stdout(stdout, stdout_limit));
    let stderr_task = tokio::spawn(capture_stderr(stderr, stderr_limit, on_stderr_line));

    let (exit_code, timed_out) = match timeout(spec.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "Command completed");
            (status.code(), false)
        }
        Ok(Err(e)) => {
            return Err(Error::Config(format!("Failed to wait for command: {}", e)));
        }
        Err(_) => {
            warn!(
                timeout_secs = spec.timeout.as_secs(),
                "Command deadline expired, terminating process group"
            );

            signal_group(child_pid, Signal::Term);

            let code = match timeout(spec.kill_after, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Command terminated gracefully after deadline");
                    status.code()
                }
                _ => {
                    warn!("Command ignored soft terminate, force killing group");
                    signal_group(child_pid, Signal::Kill);
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Force kill failed");
                    }
                    // kill() waits for exit, so the child is reaped here
                    None
                }
            };
            (code, true)
        }
    };

    let (stdout_output, stdout_truncated) = stdout_task.await.unwrap_or_default();
    let (stderr_output, stderr_truncated) = stderr_task.await.unwrap_or_default();

    let duration = start.elapsed();

    let result = CommandResult {
        exit_code,
        stdout: stdout_output,
        stderr: stderr_output,
        duration,
        timed_out,
        stdout_truncated,
        stderr_truncated,
    };

    let program_name = spec
        .program
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("unknown")
        .to_string();

    histogram!("command_duration_seconds", "program" => program_name.clone())
        .record(duration.as_secs_f64());

    if result.timed_out {
        counter!("command_timeout_total", "program" => program_name.clone()).increment(1);
    }

    if result.success() {
        counter!("command_success_total", "program" => program_name).increment(1);
        info!(
            duration_ms = duration.as_millis(),
            exit_code = result.exit_code,
            "Command completed successfully"
        );
    } else {
        counter!("command_failure_total",
            "program" => program_name,
            "exit_code" => result.exit_code.unwrap_or(-1).to_string())
        .increment(1);
        warn!(
            duration_ms = duration.as_millis(),
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            "Command failed or timed out"
        );
    }

    Ok(result)
}

/// Classify a finished result into the error taxonomy
///
/// Helper for callers that do want non-zero exits surfaced as errors.
pub fn classify_failure(result: &CommandResult) -> Option<Error> {
    if result.timed_out {
        return Some(Error::ExecTimeout {
            limit_s: result.duration.as_secs(),
        });
    }
    match result.exit_code {
        Some(0) => None,
        code => Some(Error::ExecFailed {
            code: code.unwrap_or(-1),
            stderr_tail: result.stderr_tail(12),
        }),
    }
}

enum Signal {
    Term,
    Kill,
}

/// Signal the child's whole process group
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid addresses the group created at spawn (process_group(0))
    let rc = unsafe { libc::kill(-(pid as i32), sig) };
    if rc != 0 {
        debug!(pid, "Process group signal delivered to dead group");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {
    // Non-unix platforms fall back to tokio's kill_on_drop / child.kill()
}

/// Capture stdout with size limits
async fn capture_stdout(stream: tokio::process::ChildStdout, limit: usize) -> (String, bool) {
    let mut reader = BufReader::new(stream);
    let mut output = String::new();
    let mut buffer = String::new();
    let mut truncated = false;

    loop {
        buffer.clear();
        match reader.read_line(&mut buffer).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                if output.len() >= limit {
                    truncated = true;
                    continue; // keep draining so the child never blocks on a full pipe
                }
                let remaining = limit - output.len();
                if buffer.len() > remaining {
                    output.push_str(&buffer[..remaining]);
                    truncated = true;
                } else {
                    output.push_str(&buffer);
                }
            }
            Err(e) => {
                debug!(error = %e, "Error reading from stdout");
                break;
            }
        }
    }

    if truncated {
        debug!(captured_bytes = output.len(), limit, "Stdout truncated due to size limit");
    }

    (output, truncated)
}

/// Capture stderr with size limits, streaming lines to an optional handler
async fn capture_stderr(
    stream: tokio::process::ChildStderr,
    limit: usize,
    on_line: Option<StderrLineHandler>,
) -> (String, bool) {
    let mut reader = BufReader::new(stream);
    let mut output = String::new();
    let mut buffer = String::new();
    let mut truncated = false;

    loop {
        buffer.clear();
        match reader.read_line(&mut buffer).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let line = buffer.trim_end();
                if !line.is_empty() {
                    debug!(line = %line, "Process stderr");
                    if let Some(handler) = &on_line {
                        handler(line);
                    }
                }

                if output.len() >= limit {
                    truncated = true;
                    continue;
                }
                let remaining = limit - output.len();
                if buffer.len() > remaining {
                    output.push_str(&buffer[..remaining]);
                    truncated = true;
                } else {
                    output.push_str(&buffer);
                }
            }
            Err(e) => {
                debug!(error = %e, "Error reading from stderr");
                break;
            }
        }
    }

    if truncated {
        debug!(captured_bytes = output.len(), limit, "Stderr truncated due to size limit");
    }

    (output, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_successful_command() {
        let spec = CommandSpec::new("echo".into()).args(["hello", "world"]);

        let result = run(spec).await.expect("Command should succeed");

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello world");
        assert!(!result.timed_out);
        assert!(!result.stdout_truncated);
    }

    #[tokio::test]
    async fn test_command_with_env() {
        let spec = CommandSpec::new("sh".into())
            .args(["-c", "echo $TEST_VAR"])
            .env_var("TEST_VAR", "test_value");

        let result = run(spec).await.expect("Command should succeed");

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "test_value");
    }

    #[tokio::test]
    async fn test_command_with_cwd() {
        let spec = CommandSpec::new("pwd".into()).cwd("/tmp");

        let result = run(spec).await.expect("Command should succeed");

        assert!(result.success());
        // On macOS, /tmp resolves to /private/tmp, so just check it ends with tmp
        assert!(result.stdout.trim().ends_with("tmp"));
    }

    #[tokio::test]
    async fn test_command_with_stdin() {
        let spec = CommandSpec::new("cat".into()).stdin("fed through stdin");

        let result = run(spec).await.expect("Command should succeed");

        assert!(result.success());
        assert_eq!(result.stdout, "fed through stdin");
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let spec = CommandSpec::new("sleep".into())
            .args(["2"])
            .timeout(Duration::from_millis(100))
            .kill_after(Duration::from_millis(50));

        let result = run(spec).await.expect("Command should complete with timeout");

        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_timeout_reaps_before_return() {
        let spec = CommandSpec::new("sleep".into())
            .args(["5"])
            .timeout(Duration::from_millis(100))
            .kill_after(Duration::from_millis(100));

        let start = Instant::now();
        let result = run(spec).await.expect("Command should complete");

        assert!(result.timed_out);
        // Deadline + grace + reap, nowhere near the 5s sleep
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_output_truncation() {
        let large_text = "x".repeat(2000);
        let mut spec = CommandSpec::new("echo".into()).args([&large_text]);
        spec.stdout_limit = Some(100);

        let result = run(spec).await.expect("Command should succeed");

        assert!(result.success());
        assert!(result.stdout_truncated);
        assert_eq!(result.stdout.len(), 100);
    }

    #[tokio::test]
    async fn test_failed_command_is_not_an_error() {
        let spec = CommandSpec::new("sh".into()).args(["-c", "exit 42"]);

        let result = run(spec).await.expect("Command should execute");

        assert!(!result.success());
        assert_eq!(result.exit_code, Some(42));
        assert!(!result.timed_out);
        match classify_failure(&result) {
            Some(Error::ExecFailed { code, .. }) => assert_eq!(code, 42),
            other => panic!("expected ExecFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonexistent_command_is_spawn_error() {
        let spec = CommandSpec::new("this_command_does_not_exist_12345".into());

        let result = run(spec).await;

        match result {
            Err(Error::ExecSpawn { program, .. }) => {
                assert!(program.contains("this_command_does_not_exist"));
            }
            other => panic!("expected ExecSpawn, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stderr_line_streaming() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: StderrLineHandler = Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        });

        let spec = CommandSpec::new("sh".into()).args(["-c", "echo one >&2; echo two >&2"]);
        let result = run_streamed(spec, Some(handler))
            .await
            .expect("Command should succeed");

        assert!(result.success());
        let lines = seen.lock().unwrap();
        assert_eq!(lines.as_slice(), ["one", "two"]);
    }

    #[tokio::test]
    async fn test_spawn_observation() {
        let observed: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let handler: SpawnHandler = Arc::new(move |pid| {
            *sink.lock().unwrap() = Some(pid);
        });

        let spec = CommandSpec::new("true".into());
        let result = run_observed(spec, None, Some(handler))
            .await
            .expect("Command should succeed");

        assert!(result.success());
        assert!(observed.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stderr_tail() {
        let spec = CommandSpec::new("sh".into())
            .args(["-c", "for i in 1 2 3 4 5; do echo line$i >&2; done; exit 1"]);

        let result = run(spec).await.expect("Command should execute");

        let tail = result.stderr_tail(2);
        assert_eq!(tail, "line4\nline5");
    }
}
