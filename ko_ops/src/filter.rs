//! ABOUTME: Tagged filter specifications and the custom-filter escape hatch
//! ABOUTME: Sanitizes custom strings before they reach an ffmpeg argv

use ko_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Substrings that disqualify a custom filter string outright
const FORBIDDEN: &[&str] = &[";", "`", "$(", "&&", "||", "\n", "\r"];

/// Parameters accepted by the `color` filter, with allowed ranges
const COLOR_PARAMS: &[(&str, f64, f64)] = &[
    ("brightness", -1.0, 1.0),
    ("contrast", 0.0, 4.0),
    ("saturation", 0.0, 3.0),
    ("gamma", 0.1, 10.0),
];

/// A video filter in one of the supported shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    Blur {
        radius: f64,
    },
    Fade {
        #[serde(rename = "in")]
        fade_in: f64,
        #[serde(rename = "out")]
        fade_out: f64,
    },
    Color {
        params: BTreeMap<String, f64>,
    },
    Custom {
        ffmpeg_filter: String,
    },
}

impl FilterSpec {
    /// Short tag for error paths and plan display
    pub fn name(&self) -> &'static str {
        match self {
            FilterSpec::Blur { .. } => "blur",
            FilterSpec::Fade { .. } => "fade",
            FilterSpec::Color { .. } => "color",
            FilterSpec::Custom { .. } => "custom",
        }
    }

    /// Validate parameter ranges and sanitize custom strings
    pub fn validate(&self, field: &str) -> Result<()> {
        match self {
            FilterSpec::Blur { radius } => {
                if !(*radius > 0.0 && *radius <= 50.0) {
                    return Err(Error::validation(
                        format!("{}.radius", field),
                        "must be in (0, 50]",
                    ));
                }
            }
            FilterSpec::Fade { fade_in, fade_out } => {
                if *fade_in < 0.0 || *fade_out < 0.0 {
                    return Err(Error::validation(field, "fade times must be >= 0"));
                }
            }
            FilterSpec::Color { params } => {
                if params.is_empty() {
                    return Err(Error::validation(
                        format!("{}.params", field),
                        "at least one color parameter required",
                    ));
                }
                for (key, value) in params {
                    let spec = COLOR_PARAMS.iter().find(|(name, _, _)| name == key);
                    match spec {
                        Some((_, min, max)) => {
                            if value < min || value > max {
                                return Err(Error::validation(
                                    format!("{}.params.{}", field, key),
                                    format!("must be in [{}, {}]", min, max),
                                ));
                            }
                        }
                        None => {
                            return Err(Error::validation(
                                format!("{}.params.{}", field, key),
                                "unknown color parameter",
                            ));
                        }
                    }
                }
            }
            FilterSpec::Custom { ffmpeg_filter } => {
                sanitize_custom(ffmpeg_filter, field)?;
            }
        }
        Ok(())
    }

    /// Render to an ffmpeg -vf fragment
    ///
    /// A trailing fade-out needs the clip duration; when it is unknown the
    /// fade-out is dropped (the fade-in still applies).
    pub fn to_filter_string(&self, clip_duration_s: Option<f64>) -> String {
        match self {
            FilterSpec::Blur { radius } => format!("gblur=sigma={}", radius),
            FilterSpec::Fade { fade_in, fade_out } => {
                let mut parts = Vec::new();
                if *fade_in > 0.0 {
                    parts.push(format!("fade=t=in:st=0:d={}", fade_in));
                }
                if *fade_out > 0.0 {
                    if let Some(duration) = clip_duration_s {
                        let start = (duration - fade_out).max(0.0);
                        parts.push(format!("fade=t=out:st={}:d={}", start, fade_out));
                    }
                }
                if parts.is_empty() {
                    "null".to_string()
                } else {
                    parts.join(",")
                }
            }
            FilterSpec::Color { params } => {
                let rendered: Vec<String> = params
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect();
                format!("eq={}", rendered.join(":"))
            }
            FilterSpec::Custom { ffmpeg_filter } => ffmpeg_filter.clone(),
        }
    }
}

/// Reject custom filter strings that could smuggle arguments or commands
///
/// The string becomes a single argv element, so the checks are belt and
/// braces on top of positional-list construction: no shell metacharacters,
/// no whitespace (which excludes `-i` / `-f` flag injection), no path
/// separators.
pub fn sanitize_custom(filter: &str, field: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::validation(field, "custom filter must not be empty"));
    }
    for forbidden in FORBIDDEN {
        if filter.contains(forbidden) {
            return Err(Error::validation(
                field,
                format!("forbidden sequence {:?} in custom filter", forbidden),
            ));
        }
    }
    if filter.chars().any(|c| c.is_whitespace()) {
        return Err(Error::validation(
            field,
            "whitespace not allowed in custom filter",
        ));
    }
    if filter.contains('/') || filter.contains('\\') {
        return Err(Error::validation(
            field,
            "path separators not allowed in custom filter",
        ));
    }
    if filter.starts_with('-') {
        return Err(Error::validation(
            field,
            "custom filter must not start with a dash",
        ));
    }
    Ok(())
}
