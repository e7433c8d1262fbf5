//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Workspace roots, toolchain paths, estimator tunables, and presets

use config::{Config as ConfigBuilder, Environment, File};
use ko_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use validator::Validate;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub workspace: WorkspaceConfig,
    #[validate(nested)]
    pub toolchain: ToolchainConfig,
    #[validate(nested)]
    pub execution: ExecutionConfig,
    #[validate(nested)]
    pub estimator: EstimatorConfig,
    #[validate(nested)]
    pub cleanup: CleanupConfig,
    #[validate(nested)]
    pub intake: IntakeConfig,
    #[validate(nested)]
    pub hygiene: HygieneConfig,
    #[validate(nested)]
    pub ai: AiConfig,
}

/// Workspace root directories
///
/// The root set is established at startup and immutable for the process
/// lifetime; every registered file must live under one of them.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WorkspaceConfig {
    /// Base directory containing the five standard roots
    #[validate(length(min = 1))]
    pub base_dir: String,
    pub source_dir: String,
    pub temp_dir: String,
    pub finished_dir: String,
    pub metadata_dir: String,
    pub screenshots_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: "./workspace".to_string(),
            source_dir: "source".to_string(),
            temp_dir: "temp".to_string(),
            finished_dir: "finished".to_string(),
            metadata_dir: "metadata".to_string(),
            screenshots_dir: "screenshots".to_string(),
        }
    }
}

impl WorkspaceConfig {
    /// Absolute-ish path of a named root under the base directory
    pub fn root_path(&self, name: &str) -> PathBuf {
        PathBuf::from(&self.base_dir).join(name)
    }

    /// All five roots in declaration order
    pub fn all_roots(&self) -> Vec<(String, PathBuf)> {
        [
            &self.source_dir,
            &self.temp_dir,
            &self.finished_dir,
            &self.metadata_dir,
            &self.screenshots_dir,
        ]
        .iter()
        .map(|name| ((*name).clone(), self.root_path(name)))
        .collect()
    }
}

/// External toolchain binaries
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ToolchainConfig {
    #[validate(length(min = 1))]
    pub ffmpeg_path: String,
    #[validate(length(min = 1))]
    pub ffprobe_path: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

/// Execution limits for external processes and operation handles
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ExecutionConfig {
    /// Default deadline for single-op tool calls, seconds
    #[validate(range(min = 10, max = 3600))]
    pub default_deadline_s: u64,
    /// Grace period between soft-terminate and force-kill, seconds
    #[validate(range(min = 1, max = 60))]
    pub kill_grace_s: u64,
    /// Maximum concurrently running external processes
    #[validate(range(min = 1, max = 64))]
    pub max_concurrent_processes: usize,
    /// How long terminated operation handles stay pollable, seconds
    #[validate(range(min = 60, max = 86400))]
    pub handle_retention_s: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_deadline_s: 600,
            kill_grace_s: 5,
            max_concurrent_processes: 2,
            handle_retention_s: 900, // 15 minutes
        }
    }
}

/// Duration estimator coefficients
///
/// No single authority fixes these numbers; they are deliberately exposed
/// as tunables to be validated empirically per deployment.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EstimatorConfig {
    #[validate(range(min = 0.1, max = 10.0))]
    pub simple_factor: f64,
    #[validate(range(min = 0.1, max = 20.0))]
    pub effects_heavy_factor: f64,
    #[validate(range(min = 0.1, max = 20.0))]
    pub multi_segment_factor: f64,
    /// Portrait output roughly doubles encode cost
    #[validate(range(min = 1.0, max = 4.0))]
    pub portrait_factor: f64,
    #[validate(range(min = 0.1, max = 2.0))]
    pub draft_quality_factor: f64,
    #[validate(range(min = 0.1, max = 4.0))]
    pub standard_quality_factor: f64,
    #[validate(range(min = 0.1, max = 8.0))]
    pub high_quality_factor: f64,
    /// Lower clamp on any estimate, seconds
    #[validate(range(min = 1, max = 600))]
    pub min_estimate_s: u64,
    /// Upper clamp on any estimate, seconds
    #[validate(range(min = 60, max = 7200))]
    pub max_estimate_s: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            simple_factor: 1.0,
            effects_heavy_factor: 2.5,
            multi_segment_factor: 1.6,
            portrait_factor: 2.0,
            draft_quality_factor: 0.6,
            standard_quality_factor: 1.0,
            high_quality_factor: 1.8,
            min_estimate_s: 5,
            max_estimate_s: 3600,
        }
    }
}

/// Partial-output cleanup policy
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CleanupConfig {
    /// Delete intermediates of failed/timed-out plans (false retains the
    /// last successful intermediate and reports it instead)
    pub delete_partial: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_partial: true,
        }
    }
}

/// Natural-language intake settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct IntakeConfig {
    /// BPM assumed when the brief does not state one
    #[validate(range(min = 30, max = 300))]
    pub default_bpm: u32,
    /// Maximum sources picked when the brief matches nothing by name
    #[validate(range(min = 1, max = 16))]
    pub fallback_source_count: usize,
    /// Named musical-role partition preset to use
    #[validate(length(min = 1))]
    pub role_preset: String,
    /// Registered audio file used when no background music matches
    pub default_background_music: Option<String>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            default_bpm: 120,
            fallback_source_count: 3,
            role_preset: "standard".to_string(),
            default_background_music: None,
        }
    }
}

/// Process-hygiene thresholds
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HygieneConfig {
    /// Minimum age before an unreferenced ffmpeg process is safe to kill, seconds
    #[validate(range(min = 60, max = 86400))]
    pub ffmpeg_age_threshold_s: u64,
    /// Listen ports that mark a process as protected
    pub reserved_ports: Vec<u16>,
    /// Argv substrings that mark a process as protected
    pub protected_patterns: Vec<String>,
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            ffmpeg_age_threshold_s: 7200, // 2 hours
            reserved_ports: vec![8080],
            protected_patterns: vec!["kompost".to_string()],
        }
    }
}

/// AI adapter settings with secret redaction
#[derive(Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct AiConfig {
    /// Whether the online adapter may be used at all
    pub use_online: bool,
    /// API key for the online adapter
    pub api_key: Option<String>,
    /// Base URL override for the online adapter
    pub base_url: Option<String>,
    /// Model name for the online adapter
    pub model: String,
    /// Per-call timeout, seconds (hard ceiling 30)
    #[validate(range(min = 1, max = 30))]
    pub timeout_seconds: u64,
    /// Daily spend ceiling in USD cents; 0 disables the adapter
    #[validate(range(min = 0, max = 1000000))]
    pub daily_budget_cents: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            use_online: false, // Default to the deterministic pipeline
            api_key: None,
            base_url: None,
            model: "gpt-4o-mini".to_string(),
            timeout_seconds: 30,
            daily_budget_cents: 500,
        }
    }
}

impl fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiConfig")
            .field("use_online", &self.use_online)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("daily_budget_cents", &self.daily_budget_cents)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables and optional .env file
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // Set defaults first
        builder = builder
            .set_default("workspace.base_dir", "./workspace")?
            .set_default("workspace.source_dir", "source")?
            .set_default("workspace.temp_dir", "temp")?
            .set_default("workspace.finished_dir", "finished")?
            .set_default("workspace.metadata_dir", "metadata")?
            .set_default("workspace.screenshots_dir", "screenshots")?
            .set_default("toolchain.ffmpeg_path", "ffmpeg")?
            .set_default("toolchain.ffprobe_path", "ffprobe")?
            .set_default("execution.default_deadline_s", 600)?
            .set_default("execution.kill_grace_s", 5)?
            .set_default("execution.max_concurrent_processes", 2)?
            .set_default("execution.handle_retention_s", 900)?
            .set_default("estimator.simple_factor", 1.0)?
            .set_default("estimator.effects_heavy_factor", 2.5)?
            .set_default("estimator.multi_segment_factor", 1.6)?
            .set_default("estimator.portrait_factor", 2.0)?
            .set_default("estimator.draft_quality_factor", 0.6)?
            .set_default("estimator.standard_quality_factor", 1.0)?
            .set_default("estimator.high_quality_factor", 1.8)?
            .set_default("estimator.min_estimate_s", 5)?
            .set_default("estimator.max_estimate_s", 3600)?
            .set_default("cleanup.delete_partial", true)?
            .set_default("intake.default_bpm", 120)?
            .set_default("intake.fallback_source_count", 3)?
            .set_default("intake.role_preset", "standard")?
            .set_default("hygiene.ffmpeg_age_threshold_s", 7200)?
            .set_default("hygiene.reserved_ports", vec![8080i64])?
            .set_default("hygiene.protected_patterns", vec!["kompost".to_string()])?
            .set_default("ai.use_online", false)?
            .set_default("ai.model", "gpt-4o-mini")?
            .set_default("ai.timeout_seconds", 30)?
            .set_default("ai.daily_budget_cents", 500)?;

        // API key comes from a dedicated variable so it never collides with
        // the separator-based parsing below
        if let Ok(api_key) = std::env::var("KOMPOST_AI_API_KEY") {
            builder = builder.set_override("ai.api_key", api_key)?;
        }

        // Try to load from .env file if it exists (optional)
        if std::path::Path::new(".env").exists() {
            builder = builder.add_source(File::with_name(".env").required(false));
        }

        // Load from environment variables with KOMPOST_ prefix (highest
        // priority). Double-underscore separates sections from snake_case
        // keys: KOMPOST_EXECUTION__KILL_GRACE_S -> execution.kill_grace_s
        builder = builder.add_source(
            Environment::with_prefix("KOMPOST")
                .try_parsing(true)
                .separator("__"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }
}

/// Fractions of the total duration given to each musical role
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RolePartition {
    pub intro: f64,
    pub verse: f64,
    pub refrain: f64,
    pub outro: f64,
}

impl RolePartition {
    /// Look up a named preset, shifted toward the refrain at high BPM
    pub fn preset(name: &str, bpm: u32) -> Option<Self> {
        let base = match name {
            "standard" => Self {
                intro: 0.15,
                verse: 0.35,
                refrain: 0.35,
                outro: 0.15,
            },
            "verse_heavy" => Self {
                intro: 0.10,
                verse: 0.50,
                refrain: 0.30,
                outro: 0.10,
            },
            "refrain_heavy" => Self {
                intro: 0.10,
                verse: 0.25,
                refrain: 0.55,
                outro: 0.10,
            },
            _ => return None,
        };

        // Fast tracks spend proportionally longer in the hook
        if bpm >= 140 {
            let shift = 0.05_f64.min(base.verse / 2.0);
            Some(Self {
                verse: base.verse - shift,
                refrain: base.refrain + shift,
                ..base
            })
        } else {
            Some(base)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Use a mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let vars_to_clear = [
            "KOMPOST_WORKSPACE__BASE_DIR",
            "KOMPOST_TOOLCHAIN__FFMPEG_PATH",
            "KOMPOST_EXECUTION__DEFAULT_DEADLINE_S",
            "KOMPOST_AI_API_KEY",
        ];

        let original_values: Vec<_> = vars_to_clear.iter().map(|key| env::var(key).ok()).collect();
        for key in &vars_to_clear {
            env::remove_var(key);
        }

        let config = Config::load().expect("Should load with defaults");

        assert_eq!(config.workspace.base_dir, "./workspace");
        assert_eq!(config.toolchain.ffmpeg_path, "ffmpeg");
        assert_eq!(config.execution.default_deadline_s, 600);
        assert_eq!(config.execution.handle_retention_s, 900);
        assert!(config.cleanup.delete_partial);
        assert!(!config.ai.use_online);

        for (key, value) in vars_to_clear.iter().zip(original_values.iter()) {
            if let Some(val) = value {
                env::set_var(key, val);
            }
        }
    }

    #[test]
    fn test_config_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();

        env::set_var("KOMPOST_WORKSPACE__BASE_DIR", "/srv/kompost");
        env::set_var("KOMPOST_EXECUTION__MAX_CONCURRENT_PROCESSES", "4");

        let config = Config::load().expect("Should load from env");
        assert_eq!(config.workspace.base_dir, "/srv/kompost");
        assert_eq!(config.execution.max_concurrent_processes, 4);

        env::remove_var("KOMPOST_WORKSPACE__BASE_DIR");
        env::remove_var("KOMPOST_EXECUTION__MAX_CONCURRENT_PROCESSES");
    }

    #[test]
    fn test_config_validation_failure() {
        let _lock = ENV_MUTEX.lock().unwrap();

        env::set_var("KOMPOST_EXECUTION__KILL_GRACE_S", "500"); // Invalid - too big

        let result = Config::load();
        assert!(result.is_err());

        env::remove_var("KOMPOST_EXECUTION__KILL_GRACE_S");
    }

    #[test]
    fn test_api_key_redaction() {
        let config = AiConfig {
            api_key: Some("sk-secret-value".to_string()),
            ..Default::default()
        };
        let debug_output = format!("{:?}", config);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("sk-secret-value"));
    }

    #[test]
    fn test_workspace_roots_enumeration() {
        let ws = WorkspaceConfig::default();
        let roots = ws.all_roots();
        assert_eq!(roots.len(), 5);
        assert!(roots.iter().any(|(name, _)| name == "temp"));
        assert!(roots
            .iter()
            .all(|(_, path)| path.starts_with("./workspace")));
    }

    #[test]
    fn test_role_partition_presets_sum_to_one() {
        for preset in ["standard", "verse_heavy", "refrain_heavy"] {
            for bpm in [90, 120, 150] {
                let p = RolePartition::preset(preset, bpm).unwrap();
                let sum = p.intro + p.verse + p.refrain + p.outro;
                assert!((sum - 1.0).abs() < 1e-9, "{preset}@{bpm} sums to {sum}");
            }
        }
    }

    #[test]
    fn test_role_partition_unknown_preset() {
        assert!(RolePartition::preset("nonexistent", 120).is_none());
    }

    #[test]
    fn test_high_bpm_shifts_toward_refrain() {
        let slow = RolePartition::preset("standard", 100).unwrap();
        let fast = RolePartition::preset("standard", 150).unwrap();
        assert!(fast.refrain > slow.refrain);
        assert!(fast.verse < slow.verse);
    }
}
