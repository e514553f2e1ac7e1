use crate::error::{Error, Result};
use crate::models::{HealthReport, ImageRecord, ImageWithTags, TagCount};
use crate::schema;
use crate::util::{clean_tag_name, utc_now_iso};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::backup::Progress;
use rusqlite::{params, Connection, DatabaseName, OpenFlags, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Handle on the image/tag database file.
///
/// The pool is lazy: building a `Store` never touches the file, so
/// `exists()` keeps reporting whether a database is really there until the
/// first operation creates it.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub images: i64,
    pub tags: i64,
    pub links: i64,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = r2d2::Pool::builder()
            .max_size(4)
            .min_idle(Some(0))
            .build_unchecked(manager);
        Ok(Self {
            pool,
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Applies the schema. Safe to run on every startup.
    pub fn init_schema(&self) -> Result<()> {
        log::info!("Database path: {}", self.path.display());
        let conn = self.connection()?;
        run_migrations(&conn)
    }

    pub fn add_image(&self, filename: &str, label: &str, timestamp: &str) -> Result<bool> {
        let conn = self.connection()?;
        add_image(&conn, filename, label, timestamp)
    }

    pub fn add_tag(&self, name: &str) -> Result<bool> {
        let conn = self.connection()?;
        add_tag(&conn, name)
    }

    pub fn link_image_tag(&self, filename: &str, tag_name: &str) -> Result<bool> {
        let conn = self.connection()?;
        link_image_tag(&conn, filename, tag_name)
    }

    /// Inserts the image and every tag line of `summary` in one transaction.
    /// Returns the number of non-empty tag lines applied.
    pub fn apply_summary(
        &self,
        filename: &str,
        label: &str,
        timestamp: &str,
        summary: &str,
    ) -> Result<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        add_image(&tx, filename, label, timestamp)?;
        let mut applied = 0;
        for line in summary.lines() {
            let tag = clean_tag_name(line);
            if tag.is_empty() {
                continue;
            }
            add_tag(&tx, &tag)?;
            link_image_tag(&tx, filename, &tag)?;
            applied += 1;
        }
        tx.commit()?;
        Ok(applied)
    }

    pub fn list_images(&self, tag_filter: Option<&str>) -> Result<Vec<ImageWithTags>> {
        let conn = self.connection()?;
        list_images(&conn, tag_filter)
    }

    pub fn top_tags(&self, limit: usize, blocked: &BTreeSet<String>) -> Result<Vec<TagCount>> {
        let conn = self.connection()?;
        top_tags(&conn, limit, blocked)
    }

    pub fn all_tag_names(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT DISTINCT name FROM tags ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Newest image timestamp as stored, if any image exists.
    pub fn latest_image_timestamp(&self) -> Result<Option<String>> {
        let conn = self.connection()?;
        let latest: Option<String> =
            conn.query_row("SELECT MAX(timestamp) FROM images", [], |row| row.get(0))?;
        Ok(latest)
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.connection()?;
        let count = |table: &str| -> rusqlite::Result<i64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        };
        Ok(StoreCounts {
            images: count("images")?,
            tags: count("tags")?,
            links: count("image_tags")?,
        })
    }

    pub fn health(&self) -> HealthReport {
        let db_file = self.path.display().to_string();
        match self.counts() {
            Ok(counts) => HealthReport {
                status: "ok".into(),
                db_file,
                image_count: Some(counts.images),
                message: None,
                timestamp: utc_now_iso(),
            },
            Err(err) => {
                log::warn!("Health check failed for {}: {}", self.path.display(), err);
                HealthReport {
                    status: "error".into(),
                    db_file,
                    image_count: None,
                    message: Some(err.to_string()),
                    timestamp: utc_now_iso(),
                }
            }
        }
    }

    /// Online page-level copy of the live database into `dest`.
    pub fn snapshot_to(&self, dest: &Path) -> Result<()> {
        let conn = self.connection()?;
        conn.backup(DatabaseName::Main, dest, None)?;
        Ok(())
    }

    /// Replaces the live database content with the database file at `src`.
    pub fn restore_from(&self, src: &Path) -> Result<()> {
        let mut conn = self.connection()?;
        conn.restore(DatabaseName::Main, src, None::<fn(Progress)>)?;
        Ok(())
    }
}

/// Opens a downloaded snapshot read-only and runs `PRAGMA quick_check` on
/// it, so a damaged file never reaches the live store.
pub fn check_snapshot_file(path: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let status: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if status != "ok" {
        return Err(Error::Backup(format!(
            "{} failed integrity check: {status}",
            path.display()
        )));
    }
    Ok(())
}

/// Applies all pending database migrations.
fn run_migrations(connection: &Connection) -> Result<()> {
    log::info!("Running database migrations...");

    // Migration 0001: Initial Schema
    connection.execute_batch(schema::MIGRATION_0001)?;

    log::info!("Migrations applied successfully.");
    Ok(())
}

/// Insert-or-ignore by filename. Returns whether a row was created.
pub fn add_image(conn: &Connection, filename: &str, label: &str, timestamp: &str) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO images (filename, label, timestamp) VALUES (?1, ?2, ?3)",
        params![filename, label, timestamp],
    )?;
    Ok(inserted > 0)
}

/// Insert-or-ignore by normalized name. Names that normalize to nothing
/// are dropped.
pub fn add_tag(conn: &Connection, name: &str) -> Result<bool> {
    let name = clean_tag_name(name);
    if name.is_empty() {
        return Ok(false);
    }
    let inserted = conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![name])?;
    Ok(inserted > 0)
}

/// Links an existing image to an existing tag. A missing image or tag is
/// not an error: replay may deliver the link before either row.
pub fn link_image_tag(conn: &Connection, filename: &str, tag_name: &str) -> Result<bool> {
    let tag_name = clean_tag_name(tag_name);
    let image_id: Option<i64> = conn
        .query_row(
            "SELECT id FROM images WHERE filename = ?1",
            params![filename],
            |row| row.get(0),
        )
        .optional()?;
    let tag_id: Option<i64> = conn
        .query_row("SELECT id FROM tags WHERE name = ?1", params![tag_name], |row| {
            row.get(0)
        })
        .optional()?;
    let (Some(image_id), Some(tag_id)) = (image_id, tag_id) else {
        log::debug!("Skipping link {filename} -> {tag_name}: row not present yet");
        return Ok(false);
    };
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO image_tags (image_id, tag_id) VALUES (?1, ?2)",
        params![image_id, tag_id],
    )?;
    Ok(inserted > 0)
}

/// Images newest first with their tags. `tag_filter` keeps images having a
/// tag that contains the (lowercased) query.
pub fn list_images(conn: &Connection, tag_filter: Option<&str>) -> Result<Vec<ImageWithTags>> {
    let mut stmt = conn.prepare(
        "SELECT images.id, images.filename, images.label, images.timestamp, tags.name
         FROM images
         LEFT JOIN image_tags ON images.id = image_tags.image_id
         LEFT JOIN tags ON image_tags.tag_id = tags.id
         ORDER BY images.timestamp DESC, images.id DESC, tags.name ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            ImageRecord {
                id: row.get(0)?,
                filename: row.get(1)?,
                label: row.get(2)?,
                timestamp: row.get(3)?,
            },
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut images: Vec<ImageWithTags> = Vec::new();
    for row in rows {
        let (image, tag) = row?;
        let same_image = images
            .last()
            .map(|last| last.image.id == image.id)
            .unwrap_or(false);
        if !same_image {
            images.push(ImageWithTags {
                image,
                tags: Vec::new(),
            });
        }
        if let (Some(tag), Some(last)) = (tag, images.last_mut()) {
            last.tags.push(tag);
        }
    }

    let query = tag_filter
        .map(|q| q.trim().to_lowercase())
        .filter(|q| !q.is_empty());
    if let Some(query) = query {
        images.retain(|entry| {
            entry
                .tags
                .iter()
                .any(|tag| tag.to_lowercase().contains(&query))
        });
    }
    Ok(images)
}

/// Tags by usage, most used first, skipping anything in `blocked`.
pub fn top_tags(conn: &Connection, limit: usize, blocked: &BTreeSet<String>) -> Result<Vec<TagCount>> {
    let mut stmt = conn.prepare(
        "SELECT tags.name, COUNT(image_tags.tag_id) AS usage_count
         FROM tags
         JOIN image_tags ON tags.id = image_tags.tag_id
         GROUP BY tags.id
         ORDER BY usage_count DESC, tags.name ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(TagCount {
            name: row.get(0)?,
            usage: row.get(1)?,
        })
    })?;

    let mut top = Vec::new();
    for row in rows {
        if top.len() >= limit {
            break;
        }
        let entry = row?;
        let normalized = clean_tag_name(&entry.name);
        if normalized.is_empty() || blocked.contains(&normalized) {
            continue;
        }
        top.push(entry);
    }
    Ok(top)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("metadata.db")).unwrap();
        store.init_schema().unwrap();
        (dir, store)
    }

    #[test]
    fn open_does_not_create_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("metadata.db")).unwrap();
        assert!(!store.exists());
        store.init_schema().unwrap();
        assert!(store.exists());
    }

    #[test]
    fn duplicate_inserts_are_ignored() {
        let (_dir, store) = temp_store();
        assert!(store.add_image("a.jpg", "Cute", "2025-05-01T00:00:00+00:00").unwrap());
        assert!(!store.add_image("a.jpg", "Other", "2025-05-02T00:00:00+00:00").unwrap());
        assert!(store.add_tag("cable").unwrap());
        assert!(!store.add_tag("cable").unwrap());

        let images = store.list_images(None).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].image.label.as_deref(), Some("Cute"));
    }

    #[test]
    fn add_tag_normalizes_defensively() {
        let (_dir, store) = temp_store();
        assert!(store.add_tag("  \"Cable\",").unwrap());
        assert!(!store.add_tag("cable").unwrap());
        assert!(!store.add_tag("!!!").unwrap());
        assert_eq!(store.all_tag_names().unwrap(), vec!["cable".to_string()]);
    }

    #[test]
    fn linking_twice_keeps_one_association() {
        let (_dir, store) = temp_store();
        store.add_image("a.jpg", "", "2025-05-01T00:00:00+00:00").unwrap();
        store.add_tag("cable").unwrap();
        assert!(store.link_image_tag("a.jpg", "cable").unwrap());
        assert!(!store.link_image_tag("a.jpg", "cable").unwrap());
        assert!(!store.link_image_tag("a.jpg", "Cable").unwrap());
        assert_eq!(store.counts().unwrap().links, 1);
    }

    #[test]
    fn linking_missing_rows_is_a_silent_noop() {
        let (_dir, store) = temp_store();
        assert!(!store.link_image_tag("ghost.jpg", "cable").unwrap());
        store.add_image("a.jpg", "", "2025-05-01T00:00:00+00:00").unwrap();
        assert!(!store.link_image_tag("a.jpg", "never-added").unwrap());
        assert_eq!(store.counts().unwrap().links, 0);
    }

    #[test]
    fn list_images_orders_newest_first_and_filters() {
        let (_dir, store) = temp_store();
        store
            .apply_summary("old.jpg", "", "2025-05-01T00:00:00+00:00", "Power Cable\nusb")
            .unwrap();
        store
            .apply_summary("new.jpg", "desk", "2025-05-03T00:00:00+00:00", "lamp\n\"Desk\",")
            .unwrap();
        store.add_image("bare.jpg", "", "2025-05-02T00:00:00+00:00").unwrap();

        let all = store.list_images(None).unwrap();
        let names: Vec<_> = all.iter().map(|e| e.image.filename.as_str()).collect();
        assert_eq!(names, vec!["new.jpg", "bare.jpg", "old.jpg"]);
        assert_eq!(all[0].tags, vec!["desk".to_string(), "lamp".to_string()]);
        assert!(all[1].tags.is_empty());

        let cables = store.list_images(Some(" CABLE ")).unwrap();
        assert_eq!(cables.len(), 1);
        assert_eq!(cables[0].image.filename, "old.jpg");

        assert_eq!(store.list_images(Some("  ")).unwrap().len(), 3);
    }

    #[test]
    fn top_tags_ranks_and_blocks() {
        let (_dir, store) = temp_store();
        store
            .apply_summary("a.jpg", "", "2025-05-01T00:00:00+00:00", "cable\njson\npower")
            .unwrap();
        store
            .apply_summary("b.jpg", "", "2025-05-02T00:00:00+00:00", "cable\njson")
            .unwrap();
        store
            .apply_summary("c.jpg", "", "2025-05-03T00:00:00+00:00", "cable\nlamp")
            .unwrap();

        let blocked: BTreeSet<String> = ["json".to_string()].into_iter().collect();
        let top = store.top_tags(2, &blocked).unwrap();
        assert_eq!(
            top,
            vec![
                TagCount { name: "cable".into(), usage: 3 },
                TagCount { name: "lamp".into(), usage: 1 },
            ]
        );
    }

    #[test]
    fn latest_timestamp_tracks_max() {
        let (_dir, store) = temp_store();
        assert_eq!(store.latest_image_timestamp().unwrap(), None);
        store.add_image("a.jpg", "", "2025-05-01T00:00:00+00:00").unwrap();
        store.add_image("b.jpg", "", "2025-05-06T12:00:00+00:00").unwrap();
        assert_eq!(
            store.latest_image_timestamp().unwrap().as_deref(),
            Some("2025-05-06T12:00:00+00:00")
        );
    }

    #[test]
    fn snapshot_and_restore_round_trip() {
        let (dir, store) = temp_store();
        store
            .apply_summary("a.jpg", "", "2025-05-01T00:00:00+00:00", "cable")
            .unwrap();
        let snapshot = dir.path().join("snap.sqlite3");
        store.snapshot_to(&snapshot).unwrap();

        store
            .apply_summary("b.jpg", "", "2025-05-02T00:00:00+00:00", "lamp")
            .unwrap();
        assert_eq!(store.counts().unwrap().images, 2);

        store.restore_from(&snapshot).unwrap();
        let counts = store.counts().unwrap();
        assert_eq!(counts, StoreCounts { images: 1, tags: 1, links: 1 });
    }

    #[test]
    fn health_reports_counts() {
        let (_dir, store) = temp_store();
        store.add_image("a.jpg", "", "2025-05-01T00:00:00+00:00").unwrap();
        let report = store.health();
        assert_eq!(report.status, "ok");
        assert_eq!(report.image_count, Some(1));
    }
}
