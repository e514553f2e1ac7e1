use crate::artifacts::{is_snapshot_name, snapshot_blob_path, snapshot_date, snapshot_file_name};
use crate::blobstore::BlobStore;
use crate::config::RetentionPolicy;
use crate::db::{self, Store};
use crate::error::{Error, Result};
use crate::models::{BackupOutcome, RestoreOutcome};
use crate::rebuild::Rebuilder;
use crate::util::{format_utc, parse_utc_timestamp};
use chrono::{NaiveDate, Utc};
use crossbeam_channel::{bounded, select, tick, Sender};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};
use uuid::Uuid;
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_128;

const LOCAL_SNAPSHOT_PREFIX: &str = "backup-";

/// Daily snapshots of the store, pushed to the bucket and pulled back on
/// startup.
pub struct SnapshotEngine {
    store: Store,
    blobs: Arc<dyn BlobStore>,
    backup_dir: PathBuf,
    snapshot_prefix: String,
    retention: RetentionPolicy,
    // Serializes backups taken through this engine (scheduler, manual
    // trigger, startup).
    backup_lock: Mutex<()>,
}

impl SnapshotEngine {
    pub fn new(
        store: Store,
        blobs: Arc<dyn BlobStore>,
        backup_dir: PathBuf,
        snapshot_prefix: &str,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            blobs,
            backup_dir,
            snapshot_prefix: snapshot_prefix.trim_end_matches('/').to_string(),
            retention,
            backup_lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Snapshots the live store to `backup-<today>.sqlite3` and uploads it
    /// unless it matches the newest snapshot already on disk.
    pub fn perform_backup(&self) -> Result<BackupOutcome> {
        self.perform_backup_on(Utc::now().date_naive())
    }

    pub fn perform_backup_on(&self, day: NaiveDate) -> Result<BackupOutcome> {
        if !self.store.exists() {
            return Err(Error::NoDatabase(self.store.path().display().to_string()));
        }
        let _guard = self
            .backup_lock
            .lock()
            .map_err(|_| Error::Backup("backup lock poisoned".into()))?;
        fs::create_dir_all(&self.backup_dir)?;

        let previous_hash = match latest_local_snapshot(&self.backup_dir)? {
            Some(previous) => Some(compute_hash(&previous)?),
            None => None,
        };

        let file_name = snapshot_file_name(day);
        let snapshot_path = self.backup_dir.join(&file_name);
        // The backup API bumps header counters when it overwrites an existing
        // database, so always copy into a fresh file. The name is unique per
        // attempt since another process may share the backup directory.
        let partial = self
            .backup_dir
            .join(format!("{file_name}.{}.partial", Uuid::new_v4()));
        if let Err(err) = self.store.snapshot_to(&partial) {
            remove_logged(&partial);
            return Err(err);
        }
        fs::rename(&partial, &snapshot_path)?;

        let current_hash = compute_hash(&snapshot_path)?;
        if previous_hash.as_deref() == Some(current_hash.as_str()) {
            log::info!("No DB changes since last backup. Skipping upload.");
            return Ok(BackupOutcome::Skipped {
                reason: "No changes detected.".into(),
            });
        }

        log::info!("DB backup created: {file_name}");
        let remote_path = snapshot_blob_path(&self.snapshot_prefix, &file_name);
        let bytes = fs::read(&snapshot_path)?;
        if let Err(err) = self.blobs.put(&remote_path, &bytes) {
            // Drop the local copy so the next attempt does not mistake it for
            // an uploaded snapshot.
            remove_logged(&snapshot_path);
            return Err(err);
        }
        log::info!("Uploaded snapshot to {remote_path}");

        self.cleanup_old_backups();
        Ok(BackupOutcome::Uploaded {
            snapshot: file_name,
            remote_path,
        })
    }

    /// Replaces the local store with the newest remote snapshot, then replays
    /// summaries newer than the newest image it contains. `None` when there
    /// is nothing to restore or the restore failed.
    pub fn restore_from_snapshot(&self, rebuilder: &Rebuilder) -> Option<RestoreOutcome> {
        match self.try_restore(rebuilder) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("Failed to restore snapshot: {err}");
                None
            }
        }
    }

    fn try_restore(&self, rebuilder: &Rebuilder) -> Result<Option<RestoreOutcome>> {
        let listing_prefix = format!("{}/", self.snapshot_prefix);
        let snapshots: Vec<_> = self
            .blobs
            .list(&listing_prefix)?
            .into_iter()
            .filter(|blob| is_snapshot_name(&blob.name))
            .collect();

        let Some(latest) = snapshots.iter().max_by(|a, b| {
            snapshot_date(&a.name)
                .cmp(&snapshot_date(&b.name))
                .then_with(|| a.name.cmp(&b.name))
        }) else {
            log::warn!("No SQLite snapshots found under {listing_prefix}");
            return Ok(None);
        };

        log::info!("Restoring DB snapshot: {}", latest.name);
        let bytes = self.blobs.get(&latest.name)?;
        fs::create_dir_all(&self.backup_dir)?;
        let download = self
            .backup_dir
            .join(format!("restore-{}.partial", Uuid::new_v4()));
        fs::write(&download, &bytes)?;
        let restored = db::check_snapshot_file(&download)
            .and_then(|()| self.store.restore_from(&download));
        remove_logged(&download);
        restored?;

        let latest_timestamp = match self.store.latest_image_timestamp()? {
            Some(raw) => match parse_utc_timestamp(&raw) {
                Ok(ts) => Some(format_utc(ts)),
                Err(err) => {
                    log::warn!("Unreadable image timestamp in snapshot: {err}");
                    None
                }
            },
            None => None,
        };
        log::info!(
            "Latest DB image timestamp: {}",
            latest_timestamp.as_deref().unwrap_or("None")
        );

        let delta = match latest_timestamp.as_deref() {
            Some(since) => rebuilder.rebuild(false, Some(since)),
            // Nothing to anchor a delta on: replay every summary.
            None => rebuilder.rebuild(true, None),
        };

        Ok(Some(RestoreOutcome {
            snapshot: latest.name.clone(),
            latest_timestamp,
            delta,
        }))
    }

    /// Applies the retention policy to the local snapshot directory.
    pub fn cleanup_old_backups(&self) -> Vec<PathBuf> {
        prune_backups(&self.backup_dir, self.retention, SystemTime::now())
    }
}

/// Keeps the `min_backups` newest snapshots unconditionally and deletes
/// older ones past `max_age_days`. Returns the files removed.
pub fn prune_backups(dir: &Path, policy: RetentionPolicy, now: SystemTime) -> Vec<PathBuf> {
    let mut backups = match local_snapshots(dir) {
        Ok(backups) => backups,
        Err(err) => {
            log::warn!("Could not list backups in {}: {}", dir.display(), err);
            return Vec::new();
        }
    };
    if backups.len() <= policy.min_backups {
        return Vec::new();
    }
    backups.sort_by(|a, b| b.1.cmp(&a.1));

    let max_age = Duration::from_secs(policy.max_age_days.max(0) as u64 * 86_400);
    let cutoff = now.checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = Vec::new();
    for (path, modified) in backups.into_iter().skip(policy.min_backups) {
        if modified >= cutoff {
            continue;
        }
        log::info!("Removing old backup: {}", path.display());
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(err) => log::warn!("Could not delete {}: {}", path.display(), err),
        }
    }
    removed
}

fn local_snapshots(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>> {
    let mut snapshots = Vec::new();
    if !dir.exists() {
        return Ok(snapshots);
    }
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy();
        if !name.starts_with(LOCAL_SNAPSHOT_PREFIX) || !is_snapshot_name(&name) {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(|e| Error::Path(e.to_string()))?
            .modified()?;
        snapshots.push((entry.into_path(), modified));
    }
    Ok(snapshots)
}

fn latest_local_snapshot(dir: &Path) -> Result<Option<PathBuf>> {
    Ok(local_snapshots(dir)?
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(path, _)| path))
}

fn compute_hash(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    let digest = xxh3_128(&data);
    Ok(format!("{:x}", digest))
}

fn remove_logged(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(err) = fs::remove_file(path) {
        log::warn!("Could not remove {}: {}", path.display(), err);
    }
}

/// Periodic `perform_backup` on its own thread.
pub struct BackupScheduler {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl BackupScheduler {
    pub fn spawn(engine: Arc<SnapshotEngine>, interval: Duration) -> Self {
        let (stop, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let handle = thread::spawn(move || loop {
            select! {
                recv(ticker) -> _ => match engine.perform_backup() {
                    Ok(outcome) => log::info!("Scheduled backup: {outcome:?}"),
                    Err(err) => log::warn!("Scheduled backup failed: {err}"),
                },
                recv(stop_rx) -> _ => break,
            }
        });
        Self { stop, handle }
    }

    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            log::warn!("Backup scheduler thread panicked");
        }
    }
}
