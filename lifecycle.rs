use crate::artifacts::ArtifactLayout;
use crate::auth::{self, BackupAuthorizer, Caller};
use crate::blobstore::BlobStore;
use crate::config::{AppPaths, EnvOverrides, TrackerConfig};
use crate::db::Store;
use crate::error::Result;
use crate::jobs::{IngestContext, IngestQueue};
use crate::models::{
    BackupOutcome, HealthReport, IngestStats, RebuildReport, RestoreOutcome, UploadReceipt,
};
use crate::rebuild::Rebuilder;
use crate::snapshot::{BackupScheduler, SnapshotEngine};
use crate::tagging::Tagger;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What happened while bringing the store up.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub restored: Option<RestoreOutcome>,
    pub rebuild: RebuildReport,
    pub backup: Option<BackupOutcome>,
}

/// Restore, rebuild, schema, backup, in that order. Only a store that
/// cannot be initialized is an error; everything else is logged.
pub fn run_startup(
    store: &Store,
    snapshots: &SnapshotEngine,
    rebuilder: &Rebuilder,
) -> Result<StartupReport> {
    let mut report = StartupReport {
        restored: snapshots.restore_from_snapshot(rebuilder),
        ..StartupReport::default()
    };
    if report.restored.is_some() {
        log::info!("Snapshot restored; taking a fresh backup");
        backup_logged(snapshots);
    }

    // A failed restore can leave an empty store file behind, which would
    // make the normal rebuild check think there is nothing to do.
    let force = report.restored.is_none() && store_has_no_images(store);
    report.rebuild = rebuilder.rebuild(force, None);
    store.init_schema()?;
    report.backup = backup_logged(snapshots);
    Ok(report)
}

fn store_has_no_images(store: &Store) -> bool {
    !store.exists() || store.counts().map(|c| c.images == 0).unwrap_or(true)
}

fn backup_logged(snapshots: &SnapshotEngine) -> Option<BackupOutcome> {
    match snapshots.perform_backup() {
        Ok(outcome) => {
            log::info!("Backup result: {outcome:?}");
            Some(outcome)
        }
        Err(err) => {
            log::warn!("Backup failed: {err}");
            None
        }
    }
}

/// Owns the store, the engines and the ingestion queue for one process.
pub struct Tracker {
    config: TrackerConfig,
    store: Store,
    rebuilder: Rebuilder,
    snapshots: Arc<SnapshotEngine>,
    authorizer: BackupAuthorizer,
    queue: IngestQueue,
    scheduler: Mutex<Option<BackupScheduler>>,
    startup: StartupReport,
}

impl Tracker {
    pub fn start(
        config: TrackerConfig,
        paths: &AppPaths,
        blobs: Arc<dyn BlobStore>,
        tagger: Arc<dyn Tagger>,
        overrides: &EnvOverrides,
    ) -> Result<Self> {
        let store = Store::open(&paths.db_path)?;
        let layout = ArtifactLayout::new(&config.storage.upload_prefix);
        let rebuilder = Rebuilder::new(store.clone(), blobs.clone(), layout.clone(), overrides);
        let snapshots = Arc::new(SnapshotEngine::new(
            store.clone(),
            blobs.clone(),
            paths.backup_dir.clone(),
            &config.storage.snapshot_prefix,
            config.retention,
        ));

        let startup = run_startup(&store, &snapshots, &rebuilder)?;

        let queue = IngestQueue::start(IngestContext {
            store: store.clone(),
            blobs,
            tagger,
            layout,
            upload_dir: paths.upload_dir.clone(),
        });
        log::info!("Tracker ready at {}", paths.root.display());

        Ok(Self {
            config,
            store,
            rebuilder,
            snapshots,
            authorizer: BackupAuthorizer::from_env(overrides),
            queue,
            scheduler: Mutex::new(None),
            startup,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn accept_upload(
        &self,
        source: &Path,
        original_name: &str,
        label: &str,
    ) -> Result<UploadReceipt> {
        self.queue.accept_upload(source, original_name, label)
    }

    pub fn rebuild(&self, force: bool, since: Option<&str>) -> RebuildReport {
        self.rebuilder.rebuild(force, since)
    }

    pub fn trigger_backup(&self, caller: &Caller) -> Result<BackupOutcome> {
        auth::trigger_backup(&self.authorizer, &self.snapshots, caller)
    }

    pub fn health(&self) -> HealthReport {
        self.store.health()
    }

    /// Starts periodic backups at the configured interval. A second call is
    /// a no-op.
    pub fn spawn_backup_scheduler(&self) {
        let Ok(mut slot) = self.scheduler.lock() else {
            log::warn!("Backup scheduler lock poisoned");
            return;
        };
        if slot.is_some() {
            return;
        }
        let interval = Duration::from_secs(self.config.backup_interval_secs.max(1));
        log::info!("Scheduling backups every {}s", interval.as_secs());
        *slot = Some(BackupScheduler::spawn(self.snapshots.clone(), interval));
    }

    /// Waits for every accepted upload to be processed.
    pub fn drain(&self) -> IngestStats {
        self.queue.drain()
    }

    /// Cancels the worker (queued uploads are dropped) and stops backups.
    pub fn shutdown(&self) {
        log::info!("Shutting down tracker");
        self.queue.cancel();
        let scheduler = self.scheduler.lock().ok().and_then(|mut slot| slot.take());
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
