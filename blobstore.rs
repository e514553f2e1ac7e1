use crate::error::{Error, Result};
use crate::models::BlobMeta;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use walkdir::WalkDir;

const PARTIAL_SUFFIX: &str = ".partial";

/// Remote object storage as the tracker sees it: a flat namespace of
/// `/`-separated blob names.
pub trait BlobStore: Send + Sync {
    /// Every blob whose name starts with `prefix`, sorted by name.
    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>>;

    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Stores `data` at `path` and returns the path written.
    fn put(&self, path: &str, data: &[u8]) -> Result<String>;

    fn exists(&self, path: &str) -> Result<bool>;

    fn get_text(&self, path: &str) -> Result<String> {
        let bytes = self.get(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A directory used as a bucket (mounted bucket or local development).
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(Error::Path(format!("Invalid blob path: {path}")));
        }
        Ok(self.root.join(relative))
    }

    fn blob_name(&self, full: &Path) -> Option<String> {
        let relative = full.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

impl BlobStore for FsBlobStore {
    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let mut blobs = Vec::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Some(name) = self.blob_name(entry.path()) else {
                continue;
            };
            if !name.starts_with(prefix) || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata().map_err(|e| Error::Blob(e.to_string()))?;
            let updated: DateTime<Utc> = metadata.modified()?.into();
            blobs.push(BlobMeta {
                name,
                updated,
                size: metadata.len(),
            });
        }
        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blobs)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path)?;
        fs::read(&full).map_err(|e| Error::Blob(format!("{path}: {e}")))
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<String> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut partial = full.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);
        fs::write(&partial, data)?;
        fs::rename(&partial, &full)?;
        log::debug!("Stored blob {} ({} bytes)", path, data.len());
        Ok(path.to_string())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.full_path(path)?.is_file())
    }
}

/// In-process bucket with caller-controlled modification times.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
    offline: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_at(&self, path: &str, data: &[u8], updated: DateTime<Utc>) -> Result<()> {
        self.check_online()?;
        self.lock()?
            .insert(path.to_string(), (data.to_vec(), updated));
        Ok(())
    }

    /// While offline every call fails like an unreachable bucket would.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(Error::Blob("object store unreachable".into()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>> {
        self.blobs
            .lock()
            .map_err(|_| Error::Blob("blob map poisoned".into()))
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        self.check_online()?;
        Ok(self
            .lock()?
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, (data, updated))| BlobMeta {
                name: name.clone(),
                updated: *updated,
                size: data.len() as u64,
            })
            .collect())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.check_online()?;
        self.lock()?
            .get(path)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::Blob(format!("{path}: not found")))
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<String> {
        self.put_at(path, data, Utc::now())?;
        Ok(path.to_string())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.lock()?.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fs_store_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        store.put("upload/summary/a.jpg.summary.txt", b"cable\n").unwrap();
        store.put("upload/a.jpg", b"jpeg").unwrap();
        store.put("db-backups/backup-2025-05-06.sqlite3", b"db").unwrap();

        let summaries = store.list("upload/summary").unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "upload/summary/a.jpg.summary.txt");
        assert_eq!(summaries[0].size, 6);
        assert_eq!(store.get_text("upload/summary/a.jpg.summary.txt").unwrap(), "cable\n");
        assert!(store.exists("upload/a.jpg").unwrap());
        assert!(!store.exists("upload/b.jpg").unwrap());
        assert_eq!(store.list("").unwrap().len(), 3);
    }

    #[test]
    fn fs_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("bucket")).unwrap();
        assert!(matches!(store.put("../outside", b"x"), Err(Error::Path(_))));
        assert!(matches!(store.get("/etc/passwd"), Err(Error::Path(_))));
        assert!(matches!(store.get("missing"), Err(Error::Blob(_))));
    }

    #[test]
    fn memory_store_keeps_explicit_times() {
        let store = MemoryBlobStore::new();
        let when = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        store.put_at("upload/summary/x.jpg.summary.txt", b"lamp", when).unwrap();
        store.put("upload/x.jpg", b"jpeg").unwrap();
        let listed = store.list("upload/summary").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].updated, when);

        store.set_offline(true);
        assert!(store.list("upload").is_err());
        assert!(store.put("upload/y.jpg", b"jpeg").is_err());
        store.set_offline(false);
        assert!(store.exists("upload/x.jpg").unwrap());
    }
}
