//! ABOUTME: Workspace roots and the file-ID to path registry with sandboxing
//! ABOUTME: Content sniffing, rescans, output-path derivation, ffprobe wrapper

use ko_core::{now_iso8601, Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

pub mod probe;
pub mod sniff;

pub use probe::{probe_media, MediaInfo};
pub use sniff::{sniff_kind, FileKind};

/// The five standard workspace roots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootName {
    Source,
    Temp,
    Finished,
    Metadata,
    Screenshots,
}

impl RootName {
    pub fn all() -> [RootName; 5] {
        [
            RootName::Source,
            RootName::Temp,
            RootName::Finished,
            RootName::Metadata,
            RootName::Screenshots,
        ]
    }
}

impl fmt::Display for RootName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RootName::Source => "source",
            RootName::Temp => "temp",
            RootName::Finished => "finished",
            RootName::Metadata => "metadata",
            RootName::Screenshots => "screenshots",
        };
        write!(f, "{}", name)
    }
}

/// Immutable set of declared root directories
///
/// Established at init; every path handed out by the registry lies under
/// one of these.
#[derive(Debug, Clone)]
pub struct WorkspaceRoots {
    roots: HashMap<RootName, PathBuf>,
}

impl WorkspaceRoots {
    /// Build the root set, creating directories and canonicalizing each
    pub fn create(base: &Path, names: &[(RootName, &str)]) -> Result<Self> {
        let mut roots = HashMap::new();
        for (root, dir) in names {
            let path = base.join(dir);
            std::fs::create_dir_all(&path)?;
            let canonical = path.canonicalize()?;
            roots.insert(*root, canonical);
        }
        Ok(Self { roots })
    }

    /// Standard layout under a base directory
    pub fn standard(base: &Path) -> Result<Self> {
        Self::create(
            base,
            &[
                (RootName::Source, "source"),
                (RootName::Temp, "temp"),
                (RootName::Finished, "finished"),
                (RootName::Metadata, "metadata"),
                (RootName::Screenshots, "screenshots"),
            ],
        )
    }

    pub fn path(&self, root: RootName) -> &Path {
        // Construction guarantees all five names are present
        &self.roots[&root]
    }

    /// Which root a canonical path lives under, if any
    pub fn containing_root(&self, path: &Path) -> Option<RootName> {
        self.roots
            .iter()
            .find(|(_, root_path)| path.starts_with(root_path))
            .map(|(name, _)| *name)
    }
}

/// Where a registered file came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrigin {
    Source,
    Generated,
    Downloaded,
}

/// Opaque, content-derived file identifier
///
/// `file_` + 8 lowercase hex over canonical path + size + mtime-seconds.
/// Stable across restarts for unchanged files; clients treat it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    fn derive(canonical: &Path, size: u64, mtime_s: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        hasher.update(size.to_le_bytes());
        hasher.update(mtime_s.to_le_bytes());
        let digest = hasher.finalize();
        Self(format!("file_{}", hex::encode(&digest[..4])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A registered workspace file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: FileId,
    pub path: PathBuf,
    pub root: RootName,
    pub kind: FileKind,
    /// Container format inferred from sniffing/extension ("mp4", "flac", ...)
    pub format: String,
    pub size_bytes: u64,
    /// Filled lazily from ffprobe
    pub duration_s: Option<f64>,
    pub registered_at: String,
    pub origin: FileOrigin,
}

/// Filter for registry listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    pub kind: Option<FileKind>,
    pub name_contains: Option<String>,
}

/// Result of a root rescan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RescanReport {
    pub added: Vec<FileId>,
    pub removed: Vec<FileId>,
}

#[derive(Default)]
struct Tables {
    entries: HashMap<FileId, FileEntry>,
    by_path: HashMap<PathBuf, FileId>,
}

/// Bijection between opaque file IDs and real files under declared roots
///
/// The registry is the only writer of file entries; all mutation flows
/// through the kernel that owns it.
pub struct FileRegistry {
    roots: WorkspaceRoots,
    tables: RwLock<Tables>,
}

impl FileRegistry {
    pub fn new(roots: WorkspaceRoots) -> Self {
        Self {
            roots,
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn roots(&self) -> &WorkspaceRoots {
        &self.roots
    }

    /// Register a file, inferring origin from its root
    pub async fn register(&self, path: &Path) -> Result<FileId> {
        self.register_with_origin(path, None).await
    }

    /// Register a file under a declared root
    ///
    /// Idempotent: the same canonical path (unchanged) yields the same ID.
    /// Fails with `OutsidePolicy` for paths escaping the roots and
    /// `NotFound` for missing files.
    #[instrument(skip(self))]
    pub async fn register_with_origin(
        &self,
        path: &Path,
        origin: Option<FileOrigin>,
    ) -> Result<FileId> {
        let canonical = path
            .canonicalize()
            .map_err(|_| Error::NotFound(format!("File not found: {}", path.display())))?;

        let root = self
            .roots
            .containing_root(&canonical)
            .ok_or_else(|| Error::OutsidePolicy(canonical.display().to_string()))?;

        let meta = tokio::fs::metadata(&canonical).await?;
        if !meta.is_file() {
            return Err(Error::NotFound(format!(
                "Not a regular file: {}",
                canonical.display()
            )));
        }
        let size = meta.len();
        let mtime_s = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let id = FileId::derive(&canonical, size, mtime_s);

        {
            let tables = self.tables.read().await;
            if let Some(existing) = tables.by_path.get(&canonical) {
                if *existing == id {
                    debug!(id = %id, "File already registered");
                    return Ok(id);
                }
                // Same path, changed content: the old entry is dead
            }
        }

        let header = read_header(&canonical).await?;
        let extension = canonical
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let (kind, format) = sniff::classify(&header, &extension);

        let origin = origin.unwrap_or(match root {
            RootName::Source => FileOrigin::Source,
            _ => FileOrigin::Generated,
        });

        let entry = FileEntry {
            id: id.clone(),
            path: canonical.clone(),
            root,
            kind,
            format,
            size_bytes: size,
            duration_s: None,
            registered_at: now_iso8601(),
            origin,
        };

        let mut tables = self.tables.write().await;
        if let Some(stale) = tables.by_path.insert(canonical, id.clone()) {
            if stale != id {
                tables.entries.remove(&stale);
                debug!(stale = %stale, fresh = %id, "Replaced stale entry for changed file");
            }
        }
        tables.entries.insert(id.clone(), entry);
        info!(id = %id, root = %root, "File registered");

        Ok(id)
    }

    /// Resolve an ID back to its workspace path
    pub async fn resolve(&self, id: &FileId) -> Result<PathBuf> {
        let tables = self.tables.read().await;
        tables
            .entries
            .get(id)
            .map(|entry| entry.path.clone())
            .ok_or_else(|| Error::UnknownFileId(id.to_string()))
    }

    /// Fetch a full entry
    pub async fn get(&self, id: &FileId) -> Result<FileEntry> {
        let tables = self.tables.read().await;
        tables
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownFileId(id.to_string()))
    }

    /// Record a lazily probed duration on an entry
    pub async fn set_duration(&self, id: &FileId, duration_s: f64) -> Result<()> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::UnknownFileId(id.to_string()))?;
        entry.duration_s = Some(duration_s);
        Ok(())
    }

    /// List entries, ordered by kind then name (stable)
    pub async fn list(&self, filter: &ListFilter) -> Vec<FileEntry> {
        let tables = self.tables.read().await;
        let mut entries: Vec<FileEntry> = tables
            .entries
            .values()
            .filter(|entry| {
                if let Some(kind) = filter.kind {
                    if entry.kind != kind {
                        return false;
                    }
                }
                if let Some(needle) = &filter.name_contains {
                    let name = entry
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_lowercase())
                        .unwrap_or_default();
                    if !name.contains(&needle.to_lowercase()) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        entries.sort_by(|a, b| {
            (a.kind as u8)
                .cmp(&(b.kind as u8))
                .then_with(|| a.path.file_name().cmp(&b.path.file_name()))
        });
        entries
    }

    /// Drop an entry, returning it; the file itself is untouched
    pub async fn unregister(&self, id: &FileId) -> Result<FileEntry> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .entries
            .remove(id)
            .ok_or_else(|| Error::UnknownFileId(id.to_string()))?;
        tables.by_path.remove(&entry.path);
        info!(id = %id, "File unregistered");
        Ok(entry)
    }

    /// Re-walk a root: register new files, drop entries whose files vanished
    #[instrument(skip(self))]
    pub async fn rescan(&self, root: RootName) -> Result<RescanReport> {
        let root_path = self.roots.path(root).to_path_buf();
        let mut report = RescanReport::default();

        // Drop vanished entries first
        let stale: Vec<FileId> = {
            let tables = self.tables.read().await;
            tables
                .entries
                .values()
                .filter(|entry| entry.root == root && !entry.path.exists())
                .map(|entry| entry.id.clone())
                .collect()
        };
        for id in stale {
            if let Ok(entry) = self.unregister(&id).await {
                report.removed.push(entry.id);
            }
        }

        // Walk the root for unregistered files
        let mut pending = vec![root_path];
        while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await?;
            while let Some(dir_entry) = read_dir.next_entry().await? {
                let path = dir_entry.path();
                let file_type = dir_entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let known = {
                    let tables = self.tables.read().await;
                    path.canonicalize()
                        .map(|canonical| tables.by_path.contains_key(&canonical))
                        .unwrap_or(false)
                };
                if !known {
                    match self.register(&path).await {
                        Ok(id) => report.added.push(id),
                        Err(e) => warn!(path = %path.display(), error = %e, "Rescan skipped file"),
                    }
                }
            }
        }

        info!(
            root = %root,
            added = report.added.len(),
            removed = report.removed.len(),
            "Rescan complete"
        );
        Ok(report)
    }

    /// Derive a collision-free output path under a root
    ///
    /// The returned path is not registered; registration happens once the
    /// producing operation completes.
    pub fn derive_output_path(&self, base_name: &str, ext: &str, root: RootName) -> PathBuf {
        let safe_base: String = base_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let root_path = self.roots.path(root);

        let candidate = root_path.join(format!("{}.{}", safe_base, ext));
        if !candidate.exists() {
            return candidate;
        }

        loop {
            let token: u16 = rand::thread_rng().gen();
            let candidate = root_path.join(format!("{}-{:04x}.{}", safe_base, token, ext));
            if !candidate.exists() {
                return candidate;
            }
        }
    }
}

async fn read_header(path: &Path) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = vec![0u8; 16];
    let n = file.read(&mut header).await?;
    header.truncate(n);
    Ok(header)
}
