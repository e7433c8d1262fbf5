//! ABOUTME: Media kind detection from file headers with extension confirmation
//! ABOUTME: Probes magic bytes first, falls back to the extension map

use serde::{Deserialize, Serialize};

/// Broad media kind used for listing and source selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Video = 0,
    Audio = 1,
    Image = 2,
    Unknown = 3,
}

/// Sniff a media kind from the first bytes of a file
pub fn sniff_kind(header: &[u8]) -> Option<(FileKind, &'static str)> {
    if header.len() >= 12 && &header[4..8] == b"ftyp" {
        // ISO base media container; audio-only brands refined by extension
        return Some((FileKind::Video, "mp4"));
    }
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some((FileKind::Video, "matroska"));
    }
    if header.len() >= 12 && header.starts_with(b"RIFF") {
        return match &header[8..12] {
            b"AVI " => Some((FileKind::Video, "avi")),
            b"WAVE" => Some((FileKind::Audio, "wav")),
            _ => None,
        };
    }
    if header.starts_with(b"ID3")
        || (header.len() >= 2 && header[0] == 0xFF && (header[1] & 0xE0) == 0xE0)
    {
        return Some((FileKind::Audio, "mp3"));
    }
    if header.starts_with(b"fLaC") {
        return Some((FileKind::Audio, "flac"));
    }
    if header.starts_with(b"OggS") {
        return Some((FileKind::Audio, "ogg"));
    }
    if header.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return Some((FileKind::Image, "png"));
    }
    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some((FileKind::Image, "jpeg"));
    }
    if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        return Some((FileKind::Image, "gif"));
    }
    None
}

/// Kind implied by a file extension alone
pub fn kind_for_extension(ext: &str) -> (FileKind, &str) {
    match ext {
        "mp4" | "mov" | "mkv" | "webm" | "avi" | "m4v" => (FileKind::Video, ext),
        "mp3" | "flac" | "wav" | "aac" | "m4a" | "ogg" | "opus" => (FileKind::Audio, ext),
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => (FileKind::Image, ext),
        _ => (FileKind::Unknown, ext),
    }
}

/// Content-sniff, then confirm against the extension
///
/// The header wins for the container, the extension refines kind inside
/// ambiguous containers (`.m4a` is ISO media but audio).
pub fn classify(header: &[u8], extension: &str) -> (FileKind, String) {
    match sniff_kind(header) {
        Some((sniffed_kind, format)) => {
            let (ext_kind, _) = kind_for_extension(extension);
            let kind = if ext_kind != FileKind::Unknown && ext_kind != sniffed_kind {
                ext_kind
            } else {
                sniffed_kind
            };
            (kind, format.to_string())
        }
        None => {
            let (kind, format) = kind_for_extension(extension);
            (kind, format.to_string())
        }
    }
}
