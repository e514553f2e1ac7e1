/// MIGRATION 0001: Initial database schema.
pub const MIGRATION_0001: &str = r#"
-- Images Table: one row per uploaded (or rebuilt) photo.
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    label TEXT,
    timestamp TEXT NOT NULL -- ISO-8601 UTC, second precision
);

-- Tags Table: normalized tag names.
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Image/Tag links.
CREATE TABLE IF NOT EXISTS image_tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL,
    tag_id INTEGER NOT NULL,
    FOREIGN KEY (image_id) REFERENCES images (id) ON DELETE CASCADE,
    FOREIGN KEY (tag_id) REFERENCES tags (id) ON DELETE CASCADE,
    UNIQUE (image_id, tag_id)
);

CREATE INDEX IF NOT EXISTS idx_images_timestamp ON images (timestamp);
CREATE INDEX IF NOT EXISTS idx_image_tags_image_id ON image_tags (image_id);
CREATE INDEX IF NOT EXISTS idx_image_tags_tag_id ON image_tags (tag_id);
"#;
