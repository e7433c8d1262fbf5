//! ABOUTME: ffprobe wrapper extracting duration, resolution, fps, and codecs
//! ABOUTME: Parses the -print_format json output into typed media info

use ko_core::{Error, Result};
use ko_proc::{run, CommandSpec};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tracing::{debug, instrument};

/// A single stream as reported by ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FfprobeStream {
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pix_fmt: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub sample_aspect_ratio: Option<String>,
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FfprobeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

/// Normalized media properties for dispatcher decisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_s: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub pix_fmt: Option<String>,
    pub sample_aspect_ratio: Option<String>,
    pub container: Option<String>,
}

impl MediaInfo {
    pub fn is_portrait(&self) -> bool {
        matches!((self.width, self.height), (Some(w), Some(h)) if h > w)
    }

    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    /// Whether two inputs can hit the concat demuxer without re-encoding
    pub fn concat_compatible(&self, other: &MediaInfo) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.fps == other.fps
            && self.video_codec == other.video_codec
            && self.sample_aspect_ratio == other.sample_aspect_ratio
    }
}

/// Parse "30000/1001" style rational frame rates
fn parse_rate(rate: &str) -> Option<f64> {
    let mut parts = rate.splitn(2, '/');
    let num: f64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some(den) => {
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => Some(num),
    }
}

fn parse_output(json: &str) -> Result<MediaInfo> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| Error::Config(format!("Unparseable ffprobe output: {}", e)))?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let duration_s = output
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or_else(|| video.and_then(|s| s.duration.as_deref()))
        .or_else(|| audio.and_then(|s| s.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok());

    Ok(MediaInfo {
        duration_s,
        width: video.and_then(|s| s.width),
        height: video.and_then(|s| s.height),
        fps: video
            .and_then(|s| s.avg_frame_rate.as_deref())
            .and_then(parse_rate),
        video_codec: video.and_then(|s| s.codec_name.clone()),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        pix_fmt: video.and_then(|s| s.pix_fmt.clone()),
        sample_aspect_ratio: video.and_then(|s| s.sample_aspect_ratio.clone()),
        container: output.format.and_then(|f| f.format_name),
    })
}

/// Probe a media file with ffprobe
#[instrument(skip(ffprobe_path))]
pub async fn probe_media(ffprobe_path: &str, path: &Path) -> Result<MediaInfo> {
    let spec = CommandSpec::new(ffprobe_path.into())
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .args([path.to_string_lossy().as_ref()])
        .timeout(Duration::from_secs(30));

    let result = run(spec).await?;
    if !result.success() {
        return Err(Error::ExecFailed {
            code: result.exit_code.unwrap_or(-1),
            stderr_tail: result.stderr_tail(8),
        });
    }

    let info = parse_output(&result.stdout)?;
    debug!(?info, "Probed media file");
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "codec_type": "video",
                "codec_name": "h264",
                "width": 1920,
                "height": 1080,
                "pix_fmt": "yuv420p",
                "avg_frame_rate": "30000/1001",
                "sample_aspect_ratio": "1:1"
            },
            {
                "codec_type": "audio",
                "codec_name": "aac"
            }
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "10.500000"
        }
    }"#;

    #[test]
    fn test_parse_full_output() {
        let info = parse_output(SAMPLE).unwrap();
        assert_eq!(info.duration_s, Some(10.5));
        assert_eq!(info.width, Some(1920));
        assert_eq!(info.height, Some(1080));
        assert_eq!(info.video_codec.as_deref(), Some("h264"));
        assert_eq!(info.audio_codec.as_deref(), Some("aac"));
        assert_eq!(info.pix_fmt.as_deref(), Some("yuv420p"));
        assert!((info.fps.unwrap() - 29.97).abs() < 0.01);
        assert!(!info.is_portrait());
    }

    #[test]
    fn test_parse_audio_only() {
        let json = r#"{
            "streams": [{"codec_type": "audio", "codec_name": "flac", "duration": "180.0"}],
            "format": {"format_name": "flac"}
        }"#;
        let info = parse_output(json).unwrap();
        assert!(!info.has_video());
        assert_eq!(info.duration_s, Some(180.0));
        assert_eq!(info.audio_codec.as_deref(), Some("flac"));
    }

    #[test]
    fn test_parse_rate_forms() {
        assert_eq!(parse_rate("30"), Some(30.0));
        assert_eq!(parse_rate("25/1"), Some(25.0));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("bogus"), None);
    }

    #[test]
    fn test_concat_compatibility() {
        let a = parse_output(SAMPLE).unwrap();
        let mut b = a.clone();
        assert!(a.concat_compatible(&b));
        b.width = Some(1280);
        assert!(!a.concat_compatible(&b));
    }

    #[test]
    fn test_portrait_detection() {
        let mut info = parse_output(SAMPLE).unwrap();
        info.width = Some(1080);
        info.height = Some(1920);
        assert!(info.is_portrait());
    }

    #[test]
    fn test_unparseable_output() {
        assert!(parse_output("not json").is_err());
    }
}
