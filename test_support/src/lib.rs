//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Common test fixtures and fake media files for all crates

use std::path::{Path, PathBuf};

/// Simple test helper function to demonstrate cross-crate testing
pub fn create_test_id() -> String {
    "test-id-123".to_string()
}

/// Helper for creating temporary directories in tests
pub fn temp_dir_path() -> std::path::PathBuf {
    std::env::temp_dir().join("kompost-test")
}

/// A disposable workspace with the five standard roots created
///
/// The tempdir is removed when the fixture drops.
pub struct TestWorkspace {
    pub dir: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        for root in ["source", "temp", "finished", "metadata", "screenshots"] {
            std::fs::create_dir_all(dir.path().join(root)).expect("create root");
        }
        Self { dir }
    }

    pub fn root(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a fake MP4 (valid ftyp header, garbage payload) into a root
    pub fn write_fake_mp4(&self, root: &str, name: &str) -> PathBuf {
        let path = self.root(root).join(name);
        std::fs::write(&path, fake_mp4_bytes()).expect("write fake mp4");
        path
    }

    /// Write a fake FLAC file into a root
    pub fn write_fake_flac(&self, root: &str, name: &str) -> PathBuf {
        let path = self.root(root).join(name);
        std::fs::write(&path, fake_flac_bytes()).expect("write fake flac");
        path
    }

    /// Write a fake PNG file into a root
    pub fn write_fake_png(&self, root: &str, name: &str) -> PathBuf {
        let path = self.root(root).join(name);
        std::fs::write(&path, fake_png_bytes()).expect("write fake png");
        path
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal bytes that pass MP4 magic sniffing (size box + "ftypisom")
pub fn fake_mp4_bytes() -> Vec<u8> {
    let mut bytes = vec![0x00, 0x00, 0x00, 0x18];
    bytes.extend_from_slice(b"ftypisom");
    bytes.extend_from_slice(&[0u8; 64]);
    bytes
}

/// Minimal bytes that pass FLAC magic sniffing
pub fn fake_flac_bytes() -> Vec<u8> {
    let mut bytes = b"fLaC".to_vec();
    bytes.extend_from_slice(&[0u8; 64]);
    bytes
}

/// Minimal bytes that pass PNG magic sniffing
pub fn fake_png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0u8; 64]);
    bytes
}

/// Touch a plain file with arbitrary contents
pub fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, contents).expect("write file");
}
