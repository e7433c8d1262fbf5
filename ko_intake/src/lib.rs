//! ABOUTME: Natural-language intake producing komposition documents
//! ABOUTME: Deterministic heuristic planner plus an optional online AI adapter

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use ko_config::{AiConfig, IntakeConfig};
use ko_core::{Error, Result};
use ko_plan::Komposition;
use ko_registry::FileEntry;
use std::sync::Mutex;
use tracing::{debug, warn};

pub mod heuristic;
#[cfg(feature = "ai_online")]
pub mod openai;

pub use heuristic::HeuristicPlanner;
#[cfg(feature = "ai_online")]
pub use openai::OpenAiPlanner;

/// Turns a free-text brief plus the registered media into a komposition
#[async_trait]
pub trait KompositionPlanner: Send + Sync {
    /// Produce a komposition; `videos` is non-empty, `audio` may be empty
    async fn plan(
        &self,
        brief: &str,
        videos: &[FileEntry],
        audio: &[FileEntry],
    ) -> Result<Komposition>;

    /// Health check for the planner backend
    async fn health_check(&self) -> Result<()>;
}

/// In-memory daily spend ceiling for the online adapter
///
/// Resets at UTC midnight; exhaustion surfaces as an adapter error, which
/// the intake service treats as a fallback trigger.
pub struct BudgetGuard {
    ceiling_cents: u64,
    state: Mutex<(NaiveDate, u64)>,
}

impl BudgetGuard {
    pub fn new(ceiling_cents: u64) -> Self {
        Self {
            ceiling_cents,
            state: Mutex::new((Utc::now().date_naive(), 0)),
        }
    }

    /// Reserve `cents` against today's budget
    pub fn charge(&self, cents: u64) -> Result<()> {
        let today = Utc::now().date_naive();
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Adapter("budget guard poisoned".to_string()))?;
        if state.0 != today {
            *state = (today, 0);
        }
        if self.ceiling_cents == 0 || state.1 + cents > self.ceiling_cents {
            return Err(Error::Adapter(format!(
                "daily budget exhausted ({} of {} cents spent)",
                state.1, self.ceiling_cents
            )));
        }
        state.1 += cents;
        Ok(())
    }

    pub fn spent_today(&self) -> u64 {
        self.state.lock().map(|state| state.1).unwrap_or(0)
    }
}

/// Intake façade: optional AI adapter with a deterministic fallback
///
/// Adapter output must pass structural validation; any adapter failure or
/// invalid document falls back to the heuristic pipeline instead of
/// propagating.
pub struct IntakeService {
    heuristic: HeuristicPlanner,
    adapter: Option<Box<dyn KompositionPlanner>>,
}

impl IntakeService {
    pub fn new(intake_config: IntakeConfig, ai_config: &AiConfig) -> Self {
        Self {
            heuristic: HeuristicPlanner::new(intake_config),
            adapter: create_adapter(ai_config),
        }
    }

    pub fn heuristic_only(intake_config: IntakeConfig) -> Self {
        Self {
            heuristic: HeuristicPlanner::new(intake_config),
            adapter: None,
        }
    }

    pub async fn compose(
        &self,
        brief: &str,
        videos: &[FileEntry],
        audio: &[FileEntry],
    ) -> Result<Komposition> {
        if let Some(adapter) = &self.adapter {
            match adapter.plan(brief, videos, audio).await {
                Ok(doc) => {
                    let report = doc.validate_structure();
                    if report.is_fatal() {
                        warn!(
                            errors = %report.summarize_errors(),
                            "Adapter komposition failed validation, falling back"
                        );
                    } else {
                        debug!("Adapter komposition accepted");
                        return Ok(doc);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Adapter failed, falling back to heuristic pipeline");
                }
            }
        }
        self.heuristic.plan(brief, videos, audio).await
    }
}

/// Create the online adapter when configured and compiled in
fn create_adapter(config: &AiConfig) -> Option<Box<dyn KompositionPlanner>> {
    if !config.use_online {
        debug!("Online adapter disabled, heuristic pipeline only");
        return None;
    }
    #[cfg(feature = "ai_online")]
    {
        Some(Box::new(OpenAiPlanner::new(config.clone())))
    }
    #[cfg(not(feature = "ai_online"))]
    {
        warn!("Online adapter requested but ai_online feature not enabled");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ko_plan::{KompositionMetadata, Segment, SegmentParams};
    use ko_registry::{FileId, FileKind, FileOrigin, RootName};
    use std::path::PathBuf;

    pub(crate) fn entry(name: &str, kind: FileKind) -> FileEntry {
        FileEntry {
            id: FileId::from(format!("file_{:08x}", name.len() * 7919).as_str()),
            path: PathBuf::from(format!("/ws/source/{}", name)),
            root: RootName::Source,
            kind,
            format: "mp4".to_string(),
            size_bytes: 1024,
            duration_s: None,
            registered_at: "2025-01-01T00:00:00Z".to_string(),
            origin: FileOrigin::Source,
        }
    }

    struct FailingAdapter;

    #[async_trait]
    impl KompositionPlanner for FailingAdapter {
        async fn plan(
            &self,
            _brief: &str,
            _videos: &[FileEntry],
            _audio: &[FileEntry],
        ) -> Result<Komposition> {
            Err(Error::Adapter("no network".to_string()))
        }

        async fn health_check(&self) -> Result<()> {
            Err(Error::Adapter("no network".to_string()))
        }
    }

    struct InvalidAdapter;

    #[async_trait]
    impl KompositionPlanner for InvalidAdapter {
        async fn plan(
            &self,
            _brief: &str,
            _videos: &[FileEntry],
            _audio: &[FileEntry],
        ) -> Result<Komposition> {
            Ok(Komposition {
                metadata: KompositionMetadata {
                    title: None,
                    bpm: 0.0, // fails validation
                    total_beats: 8,
                    estimated_duration: 4.0,
                },
                segments: vec![Segment {
                    id: None,
                    source_ref: "file_deadbeef".to_string(),
                    musical_role: None,
                    params: SegmentParams {
                        start: 0.0,
                        duration: 4.0,
                    },
                    filters: Vec::new(),
                }],
                audio: None,
                global_filters: Vec::new(),
                effects_tree: None,
                extra: serde_json::Map::new(),
            })
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_adapter_failure_falls_back() {
        let service = IntakeService {
            heuristic: HeuristicPlanner::new(IntakeConfig::default()),
            adapter: Some(Box::new(FailingAdapter)),
        };
        let videos = vec![entry("sunset.mp4", FileKind::Video)];

        let doc = service
            .compose("a 20 second sunset video", &videos, &[])
            .await
            .unwrap();
        assert!(!doc.validate_structure().is_fatal());
    }

    #[tokio::test]
    async fn test_invalid_adapter_output_falls_back() {
        let service = IntakeService {
            heuristic: HeuristicPlanner::new(IntakeConfig::default()),
            adapter: Some(Box::new(InvalidAdapter)),
        };
        let videos = vec![entry("sunset.mp4", FileKind::Video)];

        let doc = service
            .compose("a 20 second sunset video", &videos, &[])
            .await
            .unwrap();
        assert!(doc.metadata.bpm > 0.0);
    }

    #[test]
    fn test_budget_guard_exhaustion() {
        let guard = BudgetGuard::new(5);
        guard.charge(2).unwrap();
        guard.charge(3).unwrap();
        assert_eq!(guard.spent_today(), 5);
        match guard.charge(1) {
            Err(Error::Adapter(message)) => assert!(message.contains("budget exhausted")),
            other => panic!("expected Adapter error, got {:?}", other),
        }
    }

    #[test]
    fn test_budget_guard_zero_disables() {
        let guard = BudgetGuard::new(0);
        assert!(guard.charge(1).is_err());
    }
}
