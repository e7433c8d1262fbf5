//! ABOUTME: The closed set of named media operations and their parameter records
//! ABOUTME: Validation, arity, and output-extension policy per operation

use crate::filter::FilterSpec;
use ko_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Letterbox/crop policy for resize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Fit {
    #[default]
    Cover,
    Contain,
    Stretch,
}

/// Audio container for extract_audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Flac,
    Mp3,
    Aac,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Aac => "aac",
        }
    }

    pub fn codec(&self) -> &'static str {
        match self {
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "libmp3lame",
            AudioFormat::Aac => "aac",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_music_volume() -> f64 {
    0.8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimParams {
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeParams {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub fit: Fit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatParams {
    #[serde(default = "default_true")]
    pub normalize: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceAudioParams {
    #[serde(default = "default_music_volume")]
    pub music_volume: f64,
    #[serde(default)]
    pub fade_in: f64,
    #[serde(default)]
    pub fade_out: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractAudioParams {
    #[serde(default)]
    pub format: AudioFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyFilterParams {
    pub filter: FilterSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractFrameParams {
    #[serde(default)]
    pub timestamp: f64,
}

/// The closed tagged variant of media operations
///
/// Every variant consumes 1..N inputs and produces exactly one new file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Trim(TrimParams),
    Resize(ResizeParams),
    Concat(ConcatParams),
    ReplaceAudio(ReplaceAudioParams),
    ExtractAudio(ExtractAudioParams),
    ApplyFilter(ApplyFilterParams),
    YoutubeRecommendedEncode,
    ExtractFrame(ExtractFrameParams),
}

/// How the output extension is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionPolicy {
    /// Inherit the (first) input's extension
    Inherit,
    /// Fixed extension regardless of input
    Fixed(&'static str),
}

impl Operation {
    /// Parse the string-named MCP form: op name + JSON parameter map
    pub fn parse(name: &str, params: serde_json::Value) -> Result<Self> {
        let mut tagged = match params {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            _ => {
                return Err(Error::validation("params", "must be a JSON object"));
            }
        };
        tagged.insert(
            "op".to_string(),
            serde_json::Value::String(name.to_string()),
        );
        let op: Operation = serde_json::from_value(serde_json::Value::Object(tagged))
            .map_err(|e| Error::validation("params", format!("bad parameters for {}: {}", name, e)))?;
        op.validate()?;
        Ok(op)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Trim(_) => "trim",
            Operation::Resize(_) => "resize",
            Operation::Concat(_) => "concat",
            Operation::ReplaceAudio(_) => "replace_audio",
            Operation::ExtractAudio(_) => "extract_audio",
            Operation::ApplyFilter(_) => "apply_filter",
            Operation::YoutubeRecommendedEncode => "youtube_recommended_encode",
            Operation::ExtractFrame(_) => "extract_frame",
        }
    }

    /// Allowed input count
    pub fn arity(&self) -> RangeInclusive<usize> {
        match self {
            Operation::Concat(_) => 2..=64,
            Operation::ReplaceAudio(_) => 2..=2,
            _ => 1..=1,
        }
    }

    pub fn extension_policy(&self) -> ExtensionPolicy {
        match self {
            Operation::ExtractAudio(params) => ExtensionPolicy::Fixed(params.format.extension()),
            Operation::YoutubeRecommendedEncode => ExtensionPolicy::Fixed("mp4"),
            Operation::ExtractFrame(_) => ExtensionPolicy::Fixed("png"),
            _ => ExtensionPolicy::Inherit,
        }
    }

    /// Check parameter ranges; `BadParams` short-circuits the invocation
    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::Trim(params) => {
                if params.start < 0.0 {
                    return Err(Error::validation("trim.start", "must be >= 0"));
                }
                if params.duration <= 0.0 {
                    return Err(Error::validation("trim.duration", "must be > 0"));
                }
            }
            Operation::Resize(params) => {
                if params.width == 0 || params.height == 0 {
                    return Err(Error::validation("resize", "width and height must be > 0"));
                }
            }
            Operation::Concat(_) => {}
            Operation::ReplaceAudio(params) => {
                if !(0.0..=1.0).contains(&params.music_volume) {
                    return Err(Error::validation(
                        "replace_audio.music_volume",
                        "must be in [0, 1]",
                    ));
                }
                if params.fade_in < 0.0 || params.fade_out < 0.0 {
                    return Err(Error::validation(
                        "replace_audio",
                        "fades must be >= 0",
                    ));
                }
            }
            Operation::ExtractAudio(_) => {}
            Operation::ApplyFilter(params) => {
                params.filter.validate("apply_filter.filter")?;
            }
            Operation::YoutubeRecommendedEncode => {}
            Operation::ExtractFrame(params) => {
                if params.timestamp < 0.0 {
                    return Err(Error::validation("extract_frame.timestamp", "must be >= 0"));
                }
            }
        }
        Ok(())
    }
}
