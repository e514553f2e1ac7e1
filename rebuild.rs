use crate::artifacts::{filename_from_summary, ArtifactLayout};
use crate::blobstore::BlobStore;
use crate::config::EnvOverrides;
use crate::db::Store;
use crate::error::Result;
use crate::models::RebuildReport;
use crate::util::{is_truthy, parse_utc_timestamp, utc_now_iso};
use std::sync::Arc;

/// Decides whether a full rebuild from summaries is due: an explicit
/// `force`, a truthy `FORCE_REBUILD`, or no database file at all.
pub fn should_rebuild(force: bool, env_override: Option<&str>, store_exists: bool) -> bool {
    let env_forced = env_override.map(is_truthy).unwrap_or(false);
    if force || env_forced {
        log::info!("Forcing DB rebuild from summaries");
        return true;
    }
    !store_exists
}

/// Repopulates the store from the per-image summary artifacts.
pub struct Rebuilder {
    store: Store,
    blobs: Arc<dyn BlobStore>,
    layout: ArtifactLayout,
    force_override: Option<String>,
}

impl Rebuilder {
    pub fn new(
        store: Store,
        blobs: Arc<dyn BlobStore>,
        layout: ArtifactLayout,
        overrides: &EnvOverrides,
    ) -> Self {
        Self {
            store,
            blobs,
            layout,
            force_override: overrides.force_rebuild.clone(),
        }
    }

    /// Full rebuild when due, or a delta replay of summaries updated after
    /// `since`. Never fails: errors are logged and whatever was applied
    /// before the failure stays in the store.
    pub fn rebuild(&self, force: bool, since: Option<&str>) -> RebuildReport {
        let since = since.map(str::trim).filter(|s| !s.is_empty());
        let mut report = RebuildReport::default();
        if since.is_none()
            && !should_rebuild(force, self.force_override.as_deref(), self.store.exists())
        {
            return report;
        }

        report.ran = true;
        log::info!("Starting rebuild from {}", self.layout.summary_prefix());
        if let Err(err) = self.replay(since, &mut report) {
            report.failed = true;
            log::warn!("Failed to rebuild DB from summaries: {err}");
        }
        report
    }

    fn replay(&self, since: Option<&str>, report: &mut RebuildReport) -> Result<()> {
        if !self.store.exists() {
            log::info!("DB file does not exist, creating: {}", self.store.path().display());
        }
        self.store.init_schema()?;

        let mut blobs = self.blobs.list(&self.layout.summary_prefix())?;
        report.listed = blobs.len();
        log::info!("Found {} summary files", blobs.len());

        if let Some(since) = since {
            match parse_utc_timestamp(since) {
                Ok(cutoff) => {
                    blobs.retain(|blob| blob.updated > cutoff);
                    log::info!("Filtered to {} summary files after {since}", blobs.len());
                }
                Err(err) => {
                    log::warn!("Ignoring cutoff '{since}': {err}; replaying every summary");
                }
            }
        }

        for blob in blobs {
            let Some(filename) = filename_from_summary(&blob.name) else {
                log::debug!("Skipping non-summary blob {}", blob.name);
                continue;
            };
            log::info!("Processing {filename}");
            let contents = self.blobs.get_text(&blob.name)?;
            let linked = self
                .store
                .apply_summary(&filename, "", &utc_now_iso(), &contents)?;
            report.processed += 1;
            report.tags_linked += linked;
        }

        log::info!(
            "DB rebuilt from summaries: {} images, {} tag lines",
            report.processed,
            report.tags_linked
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::MemoryBlobStore;
    use chrono::{Duration, Utc};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        blobs: Arc<MemoryBlobStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Store::open(&dir.path().join("metadata.db")).unwrap();
            Self {
                _dir: dir,
                store,
                blobs: Arc::new(MemoryBlobStore::new()),
            }
        }

        fn rebuilder(&self, force_env: Option<&str>) -> Rebuilder {
            let overrides = EnvOverrides {
                force_rebuild: force_env.map(str::to_string),
                ..EnvOverrides::default()
            };
            Rebuilder::new(
                self.store.clone(),
                self.blobs.clone(),
                ArtifactLayout::new("upload"),
                &overrides,
            )
        }

        fn summary(&self, filename: &str, text: &str, age: Duration) {
            let layout = ArtifactLayout::new("upload");
            self.blobs
                .put_at(&layout.summary_path(filename), text.as_bytes(), Utc::now() - age)
                .unwrap();
        }
    }

    #[test]
    fn should_rebuild_decision_table() {
        assert!(should_rebuild(true, None, true));
        assert!(should_rebuild(true, Some("off"), true));
        for flag in ["", "0", "false", "no", "off", "FALSE", "Off"] {
            assert!(!should_rebuild(false, Some(flag), true), "{flag:?}");
        }
        for flag in ["1", "true", "yes"] {
            assert!(should_rebuild(false, Some(flag), true), "{flag:?}");
        }
        assert!(should_rebuild(false, None, false));
        assert!(!should_rebuild(false, None, true));
    }

    #[test]
    fn absent_store_triggers_full_rebuild() {
        let fx = Fixture::new();
        fx.summary("x.jpg", "Cable\npower\n\n", Duration::days(2));
        fx.summary("y.jpg", "\"Lamp\",", Duration::days(1));

        let report = fx.rebuilder(None).rebuild(false, None);
        assert!(report.ran && !report.failed);
        assert_eq!(report.processed, 2);
        assert_eq!(report.tags_linked, 3);

        let counts = fx.store.counts().unwrap();
        assert_eq!((counts.images, counts.tags, counts.links), (2, 3, 3));
        let y = fx.store.list_images(Some("lamp")).unwrap();
        assert_eq!(y[0].image.filename, "y.jpg");
        assert_eq!(y[0].image.label.as_deref(), Some(""));
    }

    #[test]
    fn existing_store_without_force_is_left_alone() {
        let fx = Fixture::new();
        fx.store.init_schema().unwrap();
        fx.summary("x.jpg", "cable", Duration::days(1));

        let report = fx.rebuilder(Some("no")).rebuild(false, None);
        assert!(!report.ran);
        assert_eq!(fx.store.counts().unwrap().images, 0);

        let forced = fx.rebuilder(Some("yes")).rebuild(false, None);
        assert!(forced.ran);
        assert_eq!(fx.store.counts().unwrap().images, 1);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let fx = Fixture::new();
        fx.summary("x.jpg", "cable\npower", Duration::days(2));
        fx.summary("y.jpg", "cable\nlamp", Duration::days(1));
        let rebuilder = fx.rebuilder(None);

        rebuilder.rebuild(true, None);
        let first = fx.store.list_images(None).unwrap();
        let first_counts = fx.store.counts().unwrap();

        rebuilder.rebuild(true, None);
        assert_eq!(fx.store.list_images(None).unwrap(), first);
        assert_eq!(fx.store.counts().unwrap(), first_counts);
    }

    #[test]
    fn cutoff_keeps_only_newer_summaries() {
        let fx = Fixture::new();
        fx.store.init_schema().unwrap();
        fx.summary("old_image", "Tag1\nTag2", Duration::days(5));
        fx.summary("new_image", "Tag3\nTag4", Duration::zero());

        let cutoff = crate::util::format_utc(Utc::now() - Duration::days(1));
        let report = fx.rebuilder(None).rebuild(false, Some(&cutoff));
        assert_eq!(report.listed, 2);
        assert_eq!(report.processed, 1);

        let images = fx.store.list_images(None).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].image.filename, "new_image");
        assert_eq!(images[0].tags, vec!["tag3".to_string(), "tag4".to_string()]);
    }

    #[test]
    fn cutoff_newer_than_everything_processes_nothing() {
        let fx = Fixture::new();
        fx.store.init_schema().unwrap();
        fx.summary("x.jpg", "cable", Duration::days(3));
        fx.summary("y.jpg", "lamp", Duration::days(1));

        let cutoff = crate::util::format_utc(Utc::now() + Duration::hours(1));
        let report = fx.rebuilder(None).rebuild(false, Some(&cutoff));
        assert!(report.ran);
        assert_eq!(report.processed, 0);
        assert_eq!(fx.store.counts().unwrap().images, 0);
    }

    #[test]
    fn unparseable_cutoff_replays_everything() {
        let fx = Fixture::new();
        fx.store.init_schema().unwrap();
        fx.summary("x.jpg", "cable", Duration::days(3));
        let report = fx.rebuilder(None).rebuild(false, Some("last tuesday"));
        assert_eq!(report.processed, 1);
    }

    #[test]
    fn remote_failure_is_swallowed() {
        let fx = Fixture::new();
        fx.summary("x.jpg", "cable", Duration::days(1));
        fx.blobs.set_offline(true);

        let report = fx.rebuilder(None).rebuild(true, None);
        assert!(report.ran);
        assert!(report.failed);
        assert_eq!(report.processed, 0);
        // schema was still created before the listing failed
        assert_eq!(fx.store.counts().unwrap().images, 0);
    }

    #[test]
    fn non_summary_blobs_are_skipped() {
        let fx = Fixture::new();
        fx.blobs
            .put_at("upload/summary/readme.md", b"hello", Utc::now())
            .unwrap();
        fx.summary("x.jpg", "cable", Duration::days(1));
        let report = fx.rebuilder(None).rebuild(true, None);
        assert_eq!(report.listed, 2);
        assert_eq!(report.processed, 1);
    }
}
