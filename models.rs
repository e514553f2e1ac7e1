use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: Option<i64>,
    pub filename: String,
    pub label: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ImageWithTags {
    pub image: ImageRecord,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagCount {
    pub name: String,
    pub usage: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub db_file: String,
    pub image_count: Option<i64>,
    pub message: Option<String>,
    pub timestamp: String,
}

/// Object-store listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub name: String,
    pub updated: DateTime<Utc>,
    pub size: u64,
}

/// Raw output of the vision service for one image.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TagSummary {
    pub summary: String,
}

/// A queued upload waiting for tagging.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: String,
    pub local_path: PathBuf,
    pub filename: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub job_id: String,
    pub filename: String,
    pub label: String,
    pub timestamp: String,
    pub original_path: String,
    pub thumb_path: String,
    pub summary_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BackupOutcome {
    Uploaded { snapshot: String, remote_path: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub ran: bool,
    pub listed: usize,
    pub processed: usize,
    pub tags_linked: usize,
    pub failed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub snapshot: String,
    /// Newest image timestamp found in the snapshot, normalized to UTC.
    pub latest_timestamp: Option<String>,
    pub delta: RebuildReport,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub enqueued: usize,
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PromptSearch {
    pub query: String,
    pub matched_tags: Vec<String>,
    pub images: Vec<ImageWithTags>,
}
