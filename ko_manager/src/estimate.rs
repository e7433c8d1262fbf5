//! ABOUTME: Duration estimation from natural-language description cues
//! ABOUTME: Cost model with configurable coefficients and a deadline clamp

use ko_config::EstimatorConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Duration assumed when a description names neither seconds nor beats
const DEFAULT_DURATION_S: f64 = 30.0;

/// Complexity class extracted from a description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    EffectsHeavy,
    MultiSegment,
}

/// Requested output quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Draft,
    #[default]
    Standard,
    High,
}

/// Cost estimate for a described job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    /// Target output duration extracted from the description
    pub duration_s: f64,
    /// Predicted processing cost
    pub cost_s: u64,
    /// Hard deadline derived from the cost
    pub deadline_s: u64,
    pub complexity: Complexity,
    pub portrait: bool,
    pub bpm: Option<u32>,
}

fn seconds_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*-?\s*(?:seconds?|secs?)\b").unwrap())
}

fn minutes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*-?\s*(?:minutes?|mins?)\b").unwrap())
}

fn bpm_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*-?\s*bpm\b").unwrap())
}

fn beats_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*-?\s*beats?\b").unwrap())
}

fn segments_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*-?\s*(?:segments?|clips?|parts?)\b").unwrap())
}

fn capture_f64(re: &Regex, text: &str) -> Option<f64> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn capture_u32(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Target duration in seconds: explicit time wins, then beats at the BPM
pub fn extract_duration(description: &str) -> (f64, Option<u32>) {
    let bpm = capture_u32(bpm_re(), description);

    if let Some(seconds) = capture_f64(seconds_re(), description) {
        return (seconds, bpm);
    }
    if let Some(minutes) = capture_f64(minutes_re(), description) {
        return (minutes * 60.0, bpm);
    }
    if let Some(beats) = capture_u32(beats_re(), description) {
        let bpm_value = bpm.unwrap_or(120) as f64;
        if bpm_value > 0.0 {
            return (beats as f64 / bpm_value * 60.0, bpm);
        }
    }
    (DEFAULT_DURATION_S, bpm)
}

/// Whether a description asks for portrait output
pub fn wants_portrait(description: &str) -> bool {
    let lowered = description.to_lowercase();
    ["portrait", "vertical", "9:16", "tiktok", "shorts", "reel"]
        .iter()
        .any(|cue| lowered.contains(cue))
}

/// Complexity classification; effects cues outrank segment counts
pub fn classify_complexity(description: &str) -> Complexity {
    let lowered = description.to_lowercase();
    let effect_cues = [
        "effects-heavy",
        "effects heavy",
        "heavy effects",
        "lots of effects",
        "transitions",
        "filters",
        "dramatic",
    ];
    if effect_cues.iter().any(|cue| lowered.contains(cue)) {
        return Complexity::EffectsHeavy;
    }
    if let Some(count) = capture_u32(segments_re(), description) {
        if count >= 4 {
            return Complexity::MultiSegment;
        }
    }
    Complexity::Simple
}

/// Estimate processing cost for a described job
///
/// cost = duration * complexity_factor * resolution_factor * quality_factor,
/// clamped to the configured window; the hard deadline is
/// max(60, min(cost * 1.5, 1800)).
pub fn estimate(description: &str, quality: Quality, config: &EstimatorConfig) -> Estimate {
    let (duration_s, bpm) = extract_duration(description);
    let complexity = classify_complexity(description);
    let portrait = wants_portrait(description);

    let complexity_factor = match complexity {
        Complexity::Simple => config.simple_factor,
        Complexity::EffectsHeavy => config.effects_heavy_factor,
        Complexity::MultiSegment => config.multi_segment_factor,
    };
    let resolution_factor = if portrait { config.portrait_factor } else { 1.0 };
    let quality_factor = match quality {
        Quality::Draft => config.draft_quality_factor,
        Quality::Standard => config.standard_quality_factor,
        Quality::High => config.high_quality_factor,
    };

    let raw = duration_s * complexity_factor * resolution_factor * quality_factor;
    let cost_s = (raw.round() as u64).clamp(config.min_estimate_s, config.max_estimate_s);
    let deadline_s = ((cost_s as f64 * 1.5) as u64).clamp(60, 1800);

    Estimate {
        duration_s,
        cost_s,
        deadline_s,
        complexity,
        portrait,
        bpm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EstimatorConfig {
        EstimatorConfig::default()
    }

    #[test]
    fn test_explicit_seconds() {
        let (duration, _) = extract_duration("a 45-second clip montage");
        assert_eq!(duration, 45.0);
        let (duration, _) = extract_duration("roughly 90 seconds long");
        assert_eq!(duration, 90.0);
    }

    #[test]
    fn test_minutes() {
        let (duration, _) = extract_duration("a 2 minute video");
        assert_eq!(duration, 120.0);
    }

    #[test]
    fn test_beats_with_bpm() {
        let (duration, bpm) = extract_duration("32 beats at 120 bpm");
        assert_eq!(bpm, Some(120));
        assert!((duration - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_duration() {
        let (duration, bpm) = extract_duration("a chill video of my dog");
        assert_eq!(duration, DEFAULT_DURATION_S);
        assert_eq!(bpm, None);
    }

    #[test]
    fn test_portrait_cues() {
        assert!(wants_portrait("vertical video for TikTok"));
        assert!(wants_portrait("9:16 edit"));
        assert!(!wants_portrait("widescreen cinematic edit"));
    }

    #[test]
    fn test_complexity_effects_outranks_segments() {
        assert_eq!(
            classify_complexity("effects-heavy video with 8 segments"),
            Complexity::EffectsHeavy
        );
        assert_eq!(
            classify_complexity("video with 8 segments"),
            Complexity::MultiSegment
        );
        assert_eq!(classify_complexity("simple slideshow"), Complexity::Simple);
    }

    #[test]
    fn test_cost_model_scenario() {
        // "135 BPM effects-heavy 60-second music video with 8 segments"
        let estimate = estimate(
            "135 BPM effects-heavy 60-second music video with 8 segments",
            Quality::Standard,
            &config(),
        );
        assert_eq!(estimate.duration_s, 60.0);
        assert_eq!(estimate.complexity, Complexity::EffectsHeavy);
        assert_eq!(estimate.bpm, Some(135));
        assert_eq!(estimate.cost_s, 150); // 60 * 2.5
        assert_eq!(estimate.deadline_s, 225);
    }

    #[test]
    fn test_portrait_doubles_cost() {
        let landscape = estimate("30 second video", Quality::Standard, &config());
        let portrait = estimate("30 second vertical video", Quality::Standard, &config());
        assert_eq!(portrait.cost_s, landscape.cost_s * 2);
    }

    #[test]
    fn test_deadline_clamps() {
        let tiny = estimate("1 second clip", Quality::Draft, &config());
        assert_eq!(tiny.deadline_s, 60); // floor

        let huge = estimate(
            "a 60 minute effects-heavy portrait epic",
            Quality::High,
            &config(),
        );
        assert_eq!(huge.cost_s, config().max_estimate_s);
        assert_eq!(huge.deadline_s, 1800); // ceiling
    }
}
