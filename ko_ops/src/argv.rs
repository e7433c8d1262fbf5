//! ABOUTME: FFmpeg argv templates for every named operation
//! ABOUTME: Always positional lists, never shell strings

use crate::ops::{Fit, Operation, ReplaceAudioParams, TrimParams};
use ko_core::{Error, Result};
use ko_registry::MediaInfo;
use std::path::Path;

/// Target canvas for concat normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

impl Canvas {
    pub const LANDSCAPE: Canvas = Canvas {
        width: 1920,
        height: 1080,
    };
    pub const PORTRAIT: Canvas = Canvas {
        width: 1080,
        height: 1920,
    };

    /// Landscape 1920x1080 unless every input is portrait
    pub fn for_inputs(probes: &[MediaInfo]) -> Canvas {
        let all_portrait = !probes.is_empty() && probes.iter().all(|p| p.is_portrait());
        if all_portrait {
            Canvas::PORTRAIT
        } else {
            Canvas::LANDSCAPE
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn common_prefix() -> Vec<String> {
    ["-hide_banner", "-nostdin", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Build argv for a single-invocation operation
///
/// `concat` goes through [`concat_normalize_argv`] / [`concat_demuxer_argv`]
/// instead; asking for it here is a caller bug surfaced as an error.
pub fn build_argv(
    op: &Operation,
    inputs: &[&Path],
    output: &Path,
    probes: &[Option<MediaInfo>],
) -> Result<Vec<String>> {
    match op {
        Operation::Trim(params) => {
            let copy = trim_can_copy(params, probes.first().and_then(|p| p.as_ref()));
            Ok(trim_argv(params, inputs[0], output, copy))
        }
        Operation::Resize(params) => {
            let vf = match params.fit {
                Fit::Cover => format!(
                    "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}",
                    w = params.width,
                    h = params.height
                ),
                Fit::Contain => format!(
                    "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black",
                    w = params.width,
                    h = params.height
                ),
                Fit::Stretch => format!("scale={}:{}", params.width, params.height),
            };
            let mut args = common_prefix();
            args.extend([
                "-i".into(),
                path_arg(inputs[0]),
                "-vf".into(),
                vf,
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "medium".into(),
                "-crf".into(),
                "18".into(),
                "-c:a".into(),
                "copy".into(),
                path_arg(output),
            ]);
            Ok(args)
        }
        Operation::Concat(_) => Err(Error::Config(
            "concat is assembled by the dispatcher, not build_argv".into(),
        )),
        Operation::ReplaceAudio(params) => {
            let video_duration = probes.first().and_then(|p| p.as_ref()).and_then(|p| p.duration_s);
            Ok(replace_audio_argv(
                params,
                inputs[0],
                inputs[1],
                output,
                video_duration,
            ))
        }
        Operation::ExtractAudio(params) => {
            let mut args = common_prefix();
            args.extend([
                "-i".into(),
                path_arg(inputs[0]),
                "-vn".into(),
                "-acodec".into(),
                params.format.codec().into(),
                path_arg(output),
            ]);
            Ok(args)
        }
        Operation::ApplyFilter(params) => {
            let duration = probes.first().and_then(|p| p.as_ref()).and_then(|p| p.duration_s);
            let mut args = common_prefix();
            args.extend([
                "-i".into(),
                path_arg(inputs[0]),
                "-vf".into(),
                params.filter.to_filter_string(duration),
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "medium".into(),
                "-crf".into(),
                "18".into(),
                "-c:a".into(),
                "copy".into(),
                path_arg(output),
            ]);
            Ok(args)
        }
        Operation::YoutubeRecommendedEncode => {
            let mut args = common_prefix();
            args.extend([
                "-i".into(),
                path_arg(inputs[0]),
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "medium".into(),
                "-crf".into(),
                "20".into(),
                "-maxrate".into(),
                "8M".into(),
                "-bufsize".into(),
                "16M".into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                "192k".into(),
                "-movflags".into(),
                "+faststart".into(),
                path_arg(output),
            ]);
            Ok(args)
        }
        Operation::ExtractFrame(params) => {
            let mut args = common_prefix();
            args.extend([
                "-ss".into(),
                params.timestamp.to_string(),
                "-i".into(),
                path_arg(inputs[0]),
                "-vframes".into(),
                "1".into(),
                path_arg(output),
            ]);
            Ok(args)
        }
    }
}

/// Stream copy is only keyframe-safe from the start of the file
fn trim_can_copy(params: &TrimParams, probe: Option<&MediaInfo>) -> bool {
    params.start == 0.0
        && matches!(
            probe.and_then(|p| p.video_codec.as_deref()),
            Some("h264") | Some("hevc")
        )
}

fn trim_argv(params: &TrimParams, input: &Path, output: &Path, copy: bool) -> Vec<String> {
    let mut args = common_prefix();
    args.extend([
        "-ss".into(),
        params.start.to_string(),
        "-i".into(),
        path_arg(input),
        "-t".into(),
        params.duration.to_string(),
    ]);
    if copy {
        // Keyframe rounding: start down, duration up
        args.extend(["-c".into(), "copy".into()]);
    } else {
        // Exact times via re-encode
        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-crf".into(),
            "18".into(),
            "-c:a".into(),
            "aac".into(),
        ]);
    }
    args.push(path_arg(output));
    args
}

fn replace_audio_argv(
    params: &ReplaceAudioParams,
    video: &Path,
    audio: &Path,
    output: &Path,
    video_duration_s: Option<f64>,
) -> Vec<String> {
    let mut chain = vec![format!("volume={}", params.music_volume)];
    if params.fade_in > 0.0 {
        chain.push(format!("afade=t=in:st=0:d={}", params.fade_in));
    }
    if params.fade_out > 0.0 {
        if let Some(duration) = video_duration_s {
            let start = (duration - params.fade_out).max(0.0);
            chain.push(format!("afade=t=out:st={}:d={}", start, params.fade_out));
        }
    }
    let filter_complex = format!("[1:a]{}[aout]", chain.join(","));

    let mut args = common_prefix();
    args.extend([
        "-i".into(),
        path_arg(video),
        "-i".into(),
        path_arg(audio),
        "-filter_complex".into(),
        filter_complex,
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "[aout]".into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        "-shortest".into(),
        path_arg(output),
    ]);
    args
}

/// First pass of heterogeneous concat: re-encode one input to the canonical
/// canvas (letterbox-center), fps, SAR, and codecs
pub fn concat_normalize_argv(input: &Path, canvas: Canvas, output: &Path) -> Vec<String> {
    let vf = format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black,setsar=1,fps=30",
        w = canvas.width,
        h = canvas.height
    );
    let mut args = common_prefix();
    args.extend([
        "-i".into(),
        path_arg(input),
        "-vf".into(),
        vf,
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "veryfast".into(),
        "-crf".into(),
        "18".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-c:a".into(),
        "aac".into(),
        "-ar".into(),
        "48000".into(),
        "-b:a".into(),
        "192k".into(),
        path_arg(output),
    ]);
    args
}

/// Second pass: the concat demuxer over uniform inputs, stream copy
pub fn concat_demuxer_argv(list_file: &Path, output: &Path) -> Vec<String> {
    let mut args = common_prefix();
    args.extend([
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        path_arg(list_file),
        "-c".into(),
        "copy".into(),
        path_arg(output),
    ]);
    args
}

/// Contents of the concat demuxer list file
pub fn concat_list_contents(inputs: &[&Path]) -> String {
    inputs
        .iter()
        .map(|path| {
            // Single quotes in paths are escaped per the demuxer's rules
            let escaped = path.to_string_lossy().replace('\'', "'\\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterSpec;
    use crate::ops::{ApplyFilterParams, ExtractAudioParams, ResizeParams};
    use std::path::PathBuf;

    fn probe(width: u32, height: u32, codec: &str) -> MediaInfo {
        MediaInfo {
            duration_s: Some(10.0),
            width: Some(width),
            height: Some(height),
            fps: Some(30.0),
            video_codec: Some(codec.to_string()),
            audio_codec: Some("aac".to_string()),
            pix_fmt: Some("yuv420p".to_string()),
            sample_aspect_ratio: Some("1:1".to_string()),
            container: Some("mp4".to_string()),
        }
    }

    #[test]
    fn test_trim_copy_from_zero() {
        let op = Operation::Trim(TrimParams {
            start: 0.0,
            duration: 3.0,
        });
        let input = PathBuf::from("/ws/temp/in.mp4");
        let output = PathBuf::from("/ws/temp/out.mp4");
        let args = build_argv(&op, &[&input], &output, &[Some(probe(1920, 1080, "h264"))]).unwrap();

        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
        assert!(args.windows(2).any(|w| w == ["-ss", "0"]));
        assert!(args.windows(2).any(|w| w == ["-t", "3"]));
    }

    #[test]
    fn test_trim_reencodes_midstream_start() {
        let op = Operation::Trim(TrimParams {
            start: 2.0,
            duration: 3.0,
        });
        let input = PathBuf::from("/ws/temp/in.mp4");
        let output = PathBuf::from("/ws/temp/out.mp4");
        let args = build_argv(&op, &[&input], &output, &[Some(probe(1920, 1080, "h264"))]).unwrap();

        assert!(!args.windows(2).any(|w| w == ["-c", "copy"]));
        assert!(args.contains(&"libx264".to_string()));
    }

    #[test]
    fn test_resize_cover_crops() {
        let op = Operation::Resize(ResizeParams {
            width: 1280,
            height: 720,
            fit: Fit::Cover,
        });
        let input = PathBuf::from("/ws/temp/in.mp4");
        let output = PathBuf::from("/ws/temp/out.mp4");
        let args = build_argv(&op, &[&input], &output, &[None]).unwrap();
        let vf = &args[args.iter().position(|a| a == "-vf").unwrap() + 1];
        assert!(vf.contains("force_original_aspect_ratio=increase"));
        assert!(vf.contains("crop=1280:720"));
    }

    #[test]
    fn test_replace_audio_fades_and_volume() {
        let op = Operation::ReplaceAudio(ReplaceAudioParams {
            music_volume: 0.8,
            fade_in: 1.0,
            fade_out: 2.0,
        });
        let video = PathBuf::from("/ws/temp/v.mp4");
        let audio = PathBuf::from("/ws/source/a.flac");
        let output = PathBuf::from("/ws/temp/out.mp4");
        let args = build_argv(
            &op,
            &[&video, &audio],
            &output,
            &[Some(probe(1920, 1080, "h264")), None],
        )
        .unwrap();

        let fc = &args[args.iter().position(|a| a == "-filter_complex").unwrap() + 1];
        assert!(fc.starts_with("[1:a]volume=0.8"));
        assert!(fc.contains("afade=t=in:st=0:d=1"));
        assert!(fc.contains("afade=t=out:st=8:d=2"));
        assert!(args.contains(&"-shortest".to_string()));
        // Original audio dropped: only 0:v and [aout] mapped
        assert!(args.windows(2).any(|w| w == ["-map", "0:v:0"]));
        assert!(args.windows(2).any(|w| w == ["-map", "[aout]"]));
    }

    #[test]
    fn test_terminal_encode_contract() {
        let input = PathBuf::from("/ws/temp/in.mp4");
        let output = PathBuf::from("/ws/finished/out.mp4");
        let args = build_argv(
            &Operation::YoutubeRecommendedEncode,
            &[&input],
            &output,
            &[None],
        )
        .unwrap();

        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "yuv420p"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "aac"]));
        assert!(args.windows(2).any(|w| w == ["-movflags", "+faststart"]));
        assert!(args.windows(2).any(|w| w == ["-maxrate", "8M"]));
    }

    #[test]
    fn test_extract_audio_codec() {
        let op = Operation::ExtractAudio(ExtractAudioParams {
            format: crate::ops::AudioFormat::Mp3,
        });
        let input = PathBuf::from("/ws/source/in.mp4");
        let output = PathBuf::from("/ws/temp/out.mp3");
        let args = build_argv(&op, &[&input], &output, &[None]).unwrap();
        assert!(args.contains(&"-vn".to_string()));
        assert!(args.windows(2).any(|w| w == ["-acodec", "libmp3lame"]));
    }

    #[test]
    fn test_apply_filter_uses_probe_duration() {
        let op = Operation::ApplyFilter(ApplyFilterParams {
            filter: FilterSpec::Fade {
                fade_in: 0.5,
                fade_out: 1.0,
            },
        });
        let input = PathBuf::from("/ws/temp/in.mp4");
        let output = PathBuf::from("/ws/temp/out.mp4");
        let args = build_argv(&op, &[&input], &output, &[Some(probe(1920, 1080, "h264"))]).unwrap();
        let vf = &args[args.iter().position(|a| a == "-vf").unwrap() + 1];
        assert!(vf.contains("fade=t=out:st=9:d=1"));
    }

    #[test]
    fn test_canvas_selection() {
        let landscape = probe(1920, 1080, "h264");
        let portrait = probe(1080, 1920, "h264");

        assert_eq!(
            Canvas::for_inputs(&[landscape.clone(), portrait.clone()]),
            Canvas::LANDSCAPE
        );
        assert_eq!(
            Canvas::for_inputs(&[portrait.clone(), portrait]),
            Canvas::PORTRAIT
        );
        assert_eq!(Canvas::for_inputs(&[landscape.clone(), landscape]), Canvas::LANDSCAPE);
    }

    #[test]
    fn test_concat_list_escaping() {
        let plain = PathBuf::from("/ws/temp/a.mp4");
        let quoted = PathBuf::from("/ws/temp/it's.mp4");
        let contents = concat_list_contents(&[&plain, &quoted]);
        assert!(contents.contains("file '/ws/temp/a.mp4'\n"));
        assert!(contents.contains(r"it'\''s.mp4"));
    }

    #[test]
    fn test_normalize_argv_canonicalizes() {
        let input = PathBuf::from("/ws/source/in.mov");
        let output = PathBuf::from("/ws/temp/norm.mp4");
        let args = concat_normalize_argv(&input, Canvas::LANDSCAPE, &output);
        let vf = &args[args.iter().position(|a| a == "-vf").unwrap() + 1];
        assert!(vf.contains("scale=1920:1080"));
        assert!(vf.contains("pad=1920:1080"));
        assert!(vf.contains("setsar=1"));
        assert!(vf.contains("fps=30"));
    }

    #[test]
    fn test_concat_demuxer_stream_copies() {
        let list = PathBuf::from("/ws/temp/list.txt");
        let output = PathBuf::from("/ws/temp/out.mp4");
        let args = concat_demuxer_argv(&list, &output);
        assert!(args.windows(2).any(|w| w == ["-f", "concat"]));
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
    }
}
