//! ABOUTME: Classifies and safely terminates orphan media processes
//! ABOUTME: Ordered rules with the protected rule first; kill re-verifies

use ko_config::HygieneConfig;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use tracing::{debug, info, instrument, warn};

mod ports;

/// Ordered classification outcome; first matching rule wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessClass {
    Protected,
    SafeToKill,
    Caution,
}

/// One scanned process with its classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub pid: u32,
    pub argv: Vec<String>,
    pub cpu_percent: f32,
    pub age_s: u64,
    pub class: ProcessClass,
    pub reason: String,
}

/// Per-pid kill outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillResult {
    pub pid: u32,
    pub killed: bool,
    pub reason: String,
}

/// Summary of a kill_all_safe pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSummary {
    pub killed: Vec<u32>,
    pub refused: Vec<KillResult>,
    pub warnings: Vec<String>,
}

/// Provider of pids currently running on behalf of live operations
pub type ActivePidProvider = Arc<dyn Fn() -> HashSet<u32> + Send + Sync>;

/// Minimal process facts the rules need; separated from sysinfo so the
/// rule order is testable without live processes
#[derive(Debug, Clone)]
pub struct ProcSnapshot {
    pub pid: u32,
    pub name: String,
    pub argv: Vec<String>,
    pub start_epoch_s: u64,
    pub cpu_percent: f32,
    /// False when the parent is gone or the process was adopted by init
    pub parent_alive: bool,
}

impl ProcSnapshot {
    fn argv_joined(&self) -> String {
        self.argv.join(" ").to_lowercase()
    }
}

/// Substrings marking a process as interesting enough to report at all
const INTEREST: &[&str] = &[
    "ffmpeg", "ffprobe", "java", "node", "python", "deno", "couchdb", "gradle", "vite",
];

/// Zombie-process scanner and terminator
pub struct ProcessHygiene {
    config: HygieneConfig,
    active_pids: ActivePidProvider,
    self_pid: u32,
}

impl ProcessHygiene {
    pub fn new(config: HygieneConfig, active_pids: ActivePidProvider) -> Self {
        Self {
            config,
            active_pids,
            self_pid: std::process::id(),
        }
    }

    /// Classify every interesting process on the host
    #[instrument(skip(self))]
    pub fn scan(&self) -> Vec<ClassificationRecord> {
        let snapshots = collect_snapshots();
        let active = (self.active_pids)();
        let listening = ports::pids_listening_on(&self.config.reserved_ports);
        let now = epoch_now();

        let mut records: Vec<ClassificationRecord> = snapshots
            .iter()
            .filter(|snapshot| is_interesting(snapshot))
            .map(|snapshot| {
                let (class, reason) =
                    classify(snapshot, &self.config, &active, &listening, self.self_pid, now);
                ClassificationRecord {
                    pid: snapshot.pid,
                    argv: snapshot.argv.clone(),
                    cpu_percent: snapshot.cpu_percent,
                    age_s: now.saturating_sub(snapshot.start_epoch_s),
                    class,
                    reason,
                }
            })
            .collect();
        records.sort_by_key(|record| record.pid);

        info!(
            total = records.len(),
            safe = records
                .iter()
                .filter(|r| r.class == ProcessClass::SafeToKill)
                .count(),
            "Process scan complete"
        );
        records
    }

    /// Kill specific pids; each is re-verified as safe_to_kill at the moment
    /// of the call and refused otherwise
    #[instrument(skip(self))]
    pub fn kill(&self, pids: &[u32], force: bool) -> Vec<KillResult> {
        let current: Vec<ClassificationRecord> = self.scan();
        pids.iter()
            .map(|&pid| {
                let record = current.iter().find(|record| record.pid == pid);
                match record {
                    Some(record) if record.class == ProcessClass::SafeToKill => {
                        self.terminate(pid, force)
                    }
                    Some(record) => KillResult {
                        pid,
                        killed: false,
                        reason: format!("refused: classified {:?}", record.class),
                    },
                    None => KillResult {
                        pid,
                        killed: false,
                        reason: "refused: not present in scan".to_string(),
                    },
                }
            })
            .collect()
    }

    /// Kill everything currently classified safe_to_kill
    #[instrument(skip(self))]
    pub fn kill_all_safe(&self, force: bool) -> KillSummary {
        let mut summary = KillSummary::default();
        for record in self.scan() {
            match record.class {
                ProcessClass::SafeToKill => {
                    let result = self.terminate(record.pid, force);
                    if result.killed {
                        summary.killed.push(record.pid);
                    } else {
                        summary.warnings.push(result.reason.clone());
                        summary.refused.push(result);
                    }
                }
                _ => debug!(pid = record.pid, class = ?record.class, "Left alone"),
            }
        }
        info!(killed = summary.killed.len(), "Safe-zombie sweep complete");
        summary
    }

    fn terminate(&self, pid: u32, force: bool) -> KillResult {
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        let Some(process) = system.process(Pid::from_u32(pid)) else {
            return KillResult {
                pid,
                killed: false,
                reason: "process already gone".to_string(),
            };
        };

        let signal = if force { Signal::Kill } else { Signal::Term };
        match process.kill_with(signal) {
            Some(true) => {
                info!(pid, force, "Terminated zombie process");
                KillResult {
                    pid,
                    killed: true,
                    reason: format!("signalled {:?}", signal),
                }
            }
            Some(false) | None => {
                warn!(pid, "Failed to signal process");
                KillResult {
                    pid,
                    killed: false,
                    reason: "signal delivery failed".to_string(),
                }
            }
        }
    }
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn is_interesting(snapshot: &ProcSnapshot) -> bool {
    let haystack = format!("{} {}", snapshot.name.to_lowercase(), snapshot.argv_joined());
    INTEREST.iter().any(|needle| haystack.contains(needle))
}

fn collect_snapshots() -> Vec<ProcSnapshot> {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    system
        .processes()
        .iter()
        .map(|(pid, process)| {
            let parent_alive = process
                .parent()
                .map(|parent| parent.as_u32() > 1 && system.process(parent).is_some())
                .unwrap_or(false);
            ProcSnapshot {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                argv: process.cmd().to_vec(),
                start_epoch_s: process.start_time(),
                cpu_percent: process.cpu_usage(),
                parent_alive,
            }
        })
        .collect()
}

/// The ordered rule list; the protected rule always runs first
pub fn classify(
    snapshot: &ProcSnapshot,
    config: &HygieneConfig,
    active_pids: &HashSet<u32>,
    listening_pids: &HashSet<u32>,
    self_pid: u32,
    now_epoch_s: u64,
) -> (ProcessClass, String) {
    let haystack = format!("{} {}", snapshot.name.to_lowercase(), snapshot.argv_joined());

    // protected
    if snapshot.pid == self_pid {
        return (ProcessClass::Protected, "own process".to_string());
    }
    for pattern in &config.protected_patterns {
        if haystack.contains(&pattern.to_lowercase()) {
            return (
                ProcessClass::Protected,
                format!("argv matches protected pattern '{}'", pattern),
            );
        }
    }
    if listening_pids.contains(&snapshot.pid) {
        return (
            ProcessClass::Protected,
            "listening on a reserved port".to_string(),
        );
    }

    // safe_to_kill
    let age_s = now_epoch_s.saturating_sub(snapshot.start_epoch_s);
    let is_ffmpeg = snapshot.name.to_lowercase().contains("ffmpeg");
    if is_ffmpeg {
        if active_pids.contains(&snapshot.pid) {
            return (
                ProcessClass::Caution,
                "ffmpeg owned by a live operation".to_string(),
            );
        }
        if age_s >= config.ffmpeg_age_threshold_s {
            return (
                ProcessClass::SafeToKill,
                format!("unreferenced ffmpeg, {}s old", age_s),
            );
        }
        return (
            ProcessClass::Caution,
            format!("ffmpeg below age threshold ({}s old)", age_s),
        );
    }
    let is_python = haystack.contains("python");
    if is_python && haystack.contains("spawn_main") && !snapshot.parent_alive {
        return (
            ProcessClass::SafeToKill,
            "orphaned multiprocessing child".to_string(),
        );
    }

    // caution
    (
        ProcessClass::Caution,
        "external tool of interest".to_string(),
    )
}
