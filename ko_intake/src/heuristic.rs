//! ABOUTME: Deterministic brief-to-komposition pipeline
//! ABOUTME: Source ranking, role partitioning, and role/keyword filter presets

use crate::KompositionPlanner;
use async_trait::async_trait;
use ko_config::{IntakeConfig, RolePartition};
use ko_core::{Error, Result};
use ko_manager::estimate::extract_duration;
use ko_ops::FilterSpec;
use ko_plan::{
    AudioSpec, Komposition, KompositionMetadata, MusicalRole, Segment, SegmentParams,
};
use ko_registry::FileEntry;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A role's slice of the timeline gets split when longer than this
const MAX_SEGMENT_S: f64 = 8.0;

/// Style words recognized but deliberately unmapped; they only warn
const UNMAPPED_STYLES: &[&str] = &["moody", "noir", "retro", "cinematic", "glitch", "psychedelic"];

pub struct HeuristicPlanner {
    config: IntakeConfig,
}

impl HeuristicPlanner {
    pub fn new(config: IntakeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl KompositionPlanner for HeuristicPlanner {
    async fn plan(
        &self,
        brief: &str,
        videos: &[FileEntry],
        audio: &[FileEntry],
    ) -> Result<Komposition> {
        if videos.is_empty() {
            return Err(Error::validation(
                "sources",
                "at least one registered video is required",
            ));
        }

        let (target_duration, brief_bpm) = extract_duration(brief);
        let bpm = brief_bpm.unwrap_or(self.config.default_bpm);

        let sources = rank_sources(brief, videos, self.config.fallback_source_count);
        let background = pick_audio(
            brief,
            audio,
            self.config.default_background_music.as_deref(),
        );

        let partition = RolePartition::preset(&self.config.role_preset, bpm).ok_or_else(|| {
            Error::Config(format!("unknown role preset '{}'", self.config.role_preset))
        })?;

        let role_slices = partition_roles(target_duration, partition);
        let styles = extract_styles(brief);

        let mut segments = Vec::with_capacity(role_slices.len());
        let mut duration_sum = 0.0;
        for (index, (role, duration)) in role_slices.iter().enumerate() {
            let source = &sources[index % sources.len()];
            duration_sum += duration;
            segments.push(Segment {
                id: Some(format!("seg-{}", index)),
                source_ref: source.id.to_string(),
                musical_role: Some(*role),
                params: SegmentParams {
                    start: 0.0,
                    duration: *duration,
                },
                filters: role_filters(*role),
            });
        }

        let total_beats = ((duration_sum * bpm as f64 / 60.0).round() as u32).max(1);
        let doc = Komposition {
            metadata: KompositionMetadata {
                title: None,
                bpm: bpm as f64,
                total_beats,
                estimated_duration: round_ms(duration_sum),
            },
            segments,
            audio: background.map(|entry| AudioSpec {
                background_music: entry.id.to_string(),
                music_volume: 0.8,
            }),
            global_filters: styles,
            effects_tree: None,
            extra: serde_json::Map::new(),
        };

        debug!(
            segments = doc.segments.len(),
            duration_s = doc.metadata.estimated_duration,
            bpm,
            "Heuristic komposition assembled"
        );
        Ok(doc)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn round_ms(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() >= 3)
        .map(|token| token.to_string())
        .collect()
}

/// Rank videos by name-token overlap with the brief; fall back to the
/// first N in registry order when nothing matches
fn rank_sources(brief: &str, videos: &[FileEntry], fallback_count: usize) -> Vec<FileEntry> {
    let brief_tokens = tokens(brief);
    let mut scored: Vec<(usize, &FileEntry)> = videos
        .iter()
        .map(|entry| {
            let name = entry
                .path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default();
            let score = tokens(&name)
                .iter()
                .filter(|token| brief_tokens.contains(token))
                .count();
            (score, entry)
        })
        .collect();

    if scored.iter().all(|(score, _)| *score == 0) {
        return videos.iter().take(fallback_count.max(1)).cloned().collect();
    }

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.path.cmp(&b.1.path)));
    scored
        .into_iter()
        .filter(|(score, _)| *score > 0)
        .map(|(_, entry)| entry.clone())
        .collect()
}

/// First audio whose name tokens appear in the brief, else the configured
/// default, else nothing
fn pick_audio<'a>(
    brief: &str,
    audio: &'a [FileEntry],
    default_name: Option<&str>,
) -> Option<&'a FileEntry> {
    let brief_tokens = tokens(brief);
    let matched = audio.iter().find(|entry| {
        let name = entry
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        tokens(&name)
            .iter()
            .any(|token| brief_tokens.contains(token))
    });
    matched.or_else(|| {
        default_name.and_then(|wanted| {
            audio.iter().find(|entry| {
                entry
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy() == wanted)
                    .unwrap_or(false)
            })
        })
    })
}

/// Slice the timeline by musical role, splitting long slices; durations are
/// millisecond-rounded with the final slice absorbing the remainder so the
/// total is exact
fn partition_roles(total: f64, partition: RolePartition) -> Vec<(MusicalRole, f64)> {
    let weighted = [
        (MusicalRole::Intro, partition.intro),
        (MusicalRole::Verse, partition.verse),
        (MusicalRole::Refrain, partition.refrain),
        (MusicalRole::Outro, partition.outro),
    ];

    let mut slices: Vec<(MusicalRole, f64)> = Vec::new();
    for (role, fraction) in weighted {
        let role_duration = total * fraction;
        let pieces = (role_duration / MAX_SEGMENT_S).ceil().max(1.0) as usize;
        for _ in 0..pieces {
            slices.push((role, round_ms(role_duration / pieces as f64)));
        }
    }

    // Absorb rounding drift into the last slice
    let target = round_ms(total);
    let sum_except_last: f64 = slices[..slices.len() - 1]
        .iter()
        .map(|(_, duration)| duration)
        .sum();
    if let Some(last) = slices.last_mut() {
        last.1 = round_ms(target - sum_except_last);
    }
    slices
}

/// Fixed role presets; verses stay clean
fn role_filters(role: MusicalRole) -> Vec<FilterSpec> {
    match role {
        MusicalRole::Intro => vec![FilterSpec::Fade {
            fade_in: 1.0,
            fade_out: 0.0,
        }],
        MusicalRole::Refrain => {
            let mut params = BTreeMap::new();
            params.insert("contrast".to_string(), 1.15);
            vec![FilterSpec::Color { params }]
        }
        MusicalRole::Outro => vec![FilterSpec::Fade {
            fade_in: 0.0,
            fade_out: 1.0,
        }],
        MusicalRole::Verse | MusicalRole::Bridge => Vec::new(),
    }
}

/// Map style keywords in the brief to whole-video filters
///
/// Recognized-but-unmapped style words are ignored with a warning.
fn extract_styles(brief: &str) -> Vec<FilterSpec> {
    let brief_tokens = tokens(brief);
    let mut filters = Vec::new();

    for token in &brief_tokens {
        match token.as_str() {
            "dark" => {
                let mut params = BTreeMap::new();
                params.insert("brightness".to_string(), -0.2);
                filters.push(FilterSpec::Color { params });
            }
            "bright" => {
                let mut params = BTreeMap::new();
                params.insert("brightness".to_string(), 0.15);
                filters.push(FilterSpec::Color { params });
            }
            "vintage" => {
                filters.push(FilterSpec::Custom {
                    ffmpeg_filter: "curves=preset=vintage".to_string(),
                });
            }
            "dreamy" => {
                filters.push(FilterSpec::Blur { radius: 1.5 });
            }
            "dramatic" => {
                let mut params = BTreeMap::new();
                params.insert("contrast".to_string(), 1.4);
                filters.push(FilterSpec::Color { params });
            }
            other if UNMAPPED_STYLES.contains(&other) => {
                warn!(keyword = other, "Unknown style keyword ignored");
            }
            _ => {}
        }
    }
    filters
}
