use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

pub const THUMB_SUFFIX: &str = ".thumb.jpg";
pub const SUMMARY_SUFFIX: &str = ".summary.txt";
pub const SNAPSHOT_EXT: &str = "sqlite3";

lazy_static! {
    static ref SNAPSHOT_DATE: Regex = Regex::new(r"(\d{4}-\d{2}-\d{2})").unwrap();
}

/// Where an image and its derived artifacts live in the bucket.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    prefix: String,
}

impl ArtifactLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn original_path(&self, filename: &str) -> String {
        format!("{}/{}", self.prefix, filename)
    }

    pub fn thumb_path(&self, filename: &str) -> String {
        format!("{}/thumb/{}{}", self.prefix, filename, THUMB_SUFFIX)
    }

    pub fn summary_path(&self, filename: &str) -> String {
        format!("{}/summary/{}{}", self.prefix, filename, SUMMARY_SUFFIX)
    }

    /// Listing prefix covering every summary artifact.
    pub fn summary_prefix(&self) -> String {
        format!("{}/summary", self.prefix)
    }
}

/// Image filename a summary blob belongs to, or `None` for blobs that are
/// not summaries.
pub fn filename_from_summary(blob_name: &str) -> Option<String> {
    let base = blob_name.rsplit('/').next().unwrap_or(blob_name);
    base.strip_suffix(SUMMARY_SUFFIX)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

pub fn local_summary_name(filename: &str) -> String {
    format!("{filename}{SUMMARY_SUFFIX}")
}

pub fn local_thumb_name(filename: &str) -> String {
    format!("{filename}{THUMB_SUFFIX}")
}

/// `backup-YYYY-MM-DD.sqlite3`
pub fn snapshot_file_name(date: NaiveDate) -> String {
    format!("backup-{}.{}", date.format("%Y-%m-%d"), SNAPSHOT_EXT)
}

pub fn snapshot_blob_path(snapshot_prefix: &str, file_name: &str) -> String {
    format!("{}/{}", snapshot_prefix.trim_end_matches('/'), file_name)
}

pub fn is_snapshot_name(name: &str) -> bool {
    name.ends_with(&format!(".{SNAPSHOT_EXT}"))
}

/// Date embedded in a snapshot name; names without one sort as oldest.
pub fn snapshot_date(name: &str) -> NaiveDate {
    SNAPSHOT_DATE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok())
        .unwrap_or(NaiveDate::MIN)
}
