//! ABOUTME: The user-facing komposition document model and its validation
//! ABOUTME: Unknown top-level fields survive a round-trip untouched

use ko_ops::FilterSpec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Durations must reconcile with the declared total within this window
pub const DURATION_EPSILON_S: f64 = 0.010;

/// Musical role a segment plays in the arrangement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MusicalRole {
    Intro,
    Verse,
    Refrain,
    Bridge,
    Outro,
}

impl fmt::Display for MusicalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MusicalRole::Intro => "intro",
            MusicalRole::Verse => "verse",
            MusicalRole::Refrain => "refrain",
            MusicalRole::Bridge => "bridge",
            MusicalRole::Outro => "outro",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KompositionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub bpm: f64,
    #[serde(rename = "totalBeats")]
    pub total_beats: u32,
    #[serde(rename = "estimatedDuration")]
    pub estimated_duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentParams {
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "sourceRef")]
    pub source_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub musical_role: Option<MusicalRole>,
    pub params: SegmentParams,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterSpec>,
}

fn default_music_volume() -> f64 {
    0.8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSpec {
    #[serde(rename = "backgroundMusic")]
    pub background_music: String,
    #[serde(rename = "musicVolume", default = "default_music_volume")]
    pub music_volume: f64,
}

/// The komposition document an MCP client submits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Komposition {
    pub metadata: KompositionMetadata,
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_filters: Vec<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects_tree: Option<serde_json::Value>,
    /// Unknown top-level fields, preserved on round-trip
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One finding from validation, anchored to a field path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Collected validation findings; errors are fatal, warnings are not
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn error(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.into(),
            reason: reason.into(),
        });
    }

    pub fn warning(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            field: field.into(),
            reason: reason.into(),
        });
    }

    pub fn is_fatal(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn summarize_errors(&self) -> String {
        self.errors
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl Komposition {
    /// Structural, semantic, and numeric validation
    ///
    /// Referential checks (do sourceRefs resolve?) need the registry and
    /// live in the compiler.
    pub fn validate_structure(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.metadata.bpm <= 0.0 {
            report.error("metadata.bpm", "must be > 0");
        }
        if self.metadata.total_beats == 0 {
            report.error("metadata.totalBeats", "must be > 0");
        }
        if self.metadata.estimated_duration <= 0.0 {
            report.error("metadata.estimatedDuration", "must be > 0");
        }
        if self.segments.is_empty() {
            report.error("segments", "at least one segment required");
        }

        let mut duration_sum = 0.0;
        for (index, segment) in self.segments.iter().enumerate() {
            let field = format!("segments[{}]", index);
            if segment.params.start < 0.0 {
                report.error(format!("{}.params.start", field), "must be >= 0");
            }
            if segment.params.duration <= 0.0 {
                report.error(format!("{}.params.duration", field), "must be > 0");
            }
            duration_sum += segment.params.duration;

            for (filter_index, filter) in segment.filters.iter().enumerate() {
                let filter_field = format!("{}.filters[{}]", field, filter_index);
                if let Err(e) = filter.validate(&filter_field) {
                    report.error(filter_field, e.to_string());
                }
            }
        }

        if !self.segments.is_empty()
            && (duration_sum - self.metadata.estimated_duration).abs() > DURATION_EPSILON_S
        {
            report.error(
                "segments",
                format!(
                    "segment durations sum to {:.3}s but estimatedDuration is {:.3}s",
                    duration_sum, self.metadata.estimated_duration
                ),
            );
        }

        // BPM consistency: the declared beat count should roughly cover the
        // declared duration
        if self.metadata.bpm > 0.0 && self.metadata.total_beats > 0 {
            let beats_duration = self.metadata.total_beats as f64 / self.metadata.bpm * 60.0;
            if (beats_duration - self.metadata.estimated_duration).abs() > 1.0 {
                report.warning(
                    "metadata.totalBeats",
                    format!(
                        "{} beats at {} BPM spans {:.1}s, estimatedDuration is {:.1}s",
                        self.metadata.total_beats,
                        self.metadata.bpm,
                        beats_duration,
                        self.metadata.estimated_duration
                    ),
                );
            }
        }

        if let Some(audio) = &self.audio {
            if !(0.0..=1.0).contains(&audio.music_volume) {
                report.error("audio.musicVolume", "must be in [0, 1]");
            }
        }

        for (index, filter) in self.global_filters.iter().enumerate() {
            let field = format!("global_filters[{}]", index);
            if let Err(e) = filter.validate(&field) {
                report.error(field, e.to_string());
            }
        }

        report
    }

    /// Fade declared among the global filters, if any
    pub fn global_fade(&self) -> Option<(f64, f64)> {
        self.global_filters.iter().find_map(|filter| match filter {
            FilterSpec::Fade { fade_in, fade_out } => Some((*fade_in, *fade_out)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample() -> Komposition {
        serde_json::from_value(json!({
            "metadata": {"title": "demo", "bpm": 120.0, "totalBeats": 32, "estimatedDuration": 16.0},
            "segments": [
                {"sourceRef": "file_aaaa0001", "musical_role": "intro",
                 "params": {"start": 0.0, "duration": 4.0}},
                {"sourceRef": "file_aaaa0002", "musical_role": "verse",
                 "params": {"start": 0.0, "duration": 4.0}},
                {"sourceRef": "file_aaaa0001", "musical_role": "refrain",
                 "params": {"start": 5.0, "duration": 4.0}},
                {"sourceRef": "file_aaaa0001", "musical_role": "outro",
                 "params": {"start": 10.0, "duration": 4.0}}
            ],
            "audio": {"backgroundMusic": "file_bbbb0001", "musicVolume": 0.8}
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_document_passes() {
        let report = sample().validate_structure();
        assert!(!report.is_fatal(), "{:?}", report.errors);
    }

    #[test]
    fn test_zero_duration_segment_rejected() {
        let mut doc = sample();
        doc.segments[1].params.duration = 0.0;
        let report = doc.validate_structure();
        assert!(report.is_fatal());
        assert!(report
            .errors
            .iter()
            .any(|issue| issue.field == "segments[1].params.duration"));
    }

    #[test]
    fn test_nonpositive_bpm_rejected() {
        for bpm in [0.0, -120.0] {
            let mut doc = sample();
            doc.metadata.bpm = bpm;
            assert!(doc.validate_structure().is_fatal());
        }
    }

    #[test]
    fn test_duration_sum_mismatch_rejected() {
        let mut doc = sample();
        doc.metadata.estimated_duration = 20.0;
        let report = doc.validate_structure();
        assert!(report.is_fatal());
        assert!(report.errors.iter().any(|issue| issue.field == "segments"));
    }

    #[test]
    fn test_duration_sum_within_epsilon_accepted() {
        let mut doc = sample();
        doc.metadata.estimated_duration = 16.005;
        doc.metadata.total_beats = 32;
        assert!(!doc.validate_structure().is_fatal());
    }

    #[test]
    fn test_injection_filter_rejected() {
        let mut doc = sample();
        doc.segments[0].filters = vec![FilterSpec::Custom {
            ffmpeg_filter: "eq=b=0.1; rm -rf /".to_string(),
        }];
        let report = doc.validate_structure();
        assert!(report.is_fatal());
    }

    #[test]
    fn test_music_volume_range() {
        let mut doc = sample();
        doc.audio.as_mut().unwrap().music_volume = 1.5;
        assert!(doc.validate_structure().is_fatal());
    }

    #[test]
    fn test_beats_inconsistency_is_warning_only() {
        let mut doc = sample();
        doc.metadata.total_beats = 300;
        let report = doc.validate_structure();
        assert!(!report.is_fatal());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn test_unknown_fields_roundtrip() {
        let json_in = json!({
            "metadata": {"bpm": 100.0, "totalBeats": 10, "estimatedDuration": 6.0},
            "segments": [
                {"sourceRef": "file_aaaa0001", "params": {"start": 0.0, "duration": 6.0}}
            ],
            "client_notes": {"prompt": "sunset vibes"},
            "x-revision": 3
        });
        let doc: Komposition = serde_json::from_value(json_in.clone()).unwrap();
        assert_eq!(doc.extra.len(), 2);

        let json_out = serde_json::to_value(&doc).unwrap();
        assert_eq!(json_out["client_notes"], json_in["client_notes"]);
        assert_eq!(json_out["x-revision"], json_in["x-revision"]);
        assert_eq!(json_out["metadata"]["totalBeats"], json!(10));
    }

    #[test]
    fn test_global_fade_lookup() {
        let mut doc = sample();
        assert_eq!(doc.global_fade(), None);
        doc.global_filters = vec![FilterSpec::Fade {
            fade_in: 0.5,
            fade_out: 1.0,
        }];
        assert_eq!(doc.global_fade(), Some((0.5, 1.0)));
    }
}
