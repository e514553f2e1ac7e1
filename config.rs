use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_BLOCKED_TAGS: &[&str] = &[
    "objects",
    "elements",
    "quantity",
    "1",
    "true",
    "false",
    "yes",
    "no",
    "null",
    "none",
    "json",
    "quantity 1",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory standing in for the bucket when using the filesystem store.
    #[serde(default = "default_bucket_root")]
    pub bucket_root: PathBuf,
    #[serde(default = "default_upload_prefix")]
    pub upload_prefix: String,
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket_root: default_bucket_root(),
            upload_prefix: default_upload_prefix(),
            snapshot_prefix: default_snapshot_prefix(),
        }
    }
}

fn default_bucket_root() -> PathBuf {
    PathBuf::from("bucket")
}

fn default_upload_prefix() -> String {
    "upload".into()
}

fn default_snapshot_prefix() -> String {
    "db-backups".into()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub min_backups: usize,
    pub max_age_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            min_backups: 15,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default = "default_backup_interval_secs")]
    pub backup_interval_secs: u64,
    /// Program (plus leading args) that prints tag lines for an image path.
    #[serde(default)]
    pub tagger_command: Option<Vec<String>>,
    #[serde(default = "default_blocked_tags")]
    pub blocked_tags: BTreeSet<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            retention: RetentionPolicy::default(),
            backup_interval_secs: default_backup_interval_secs(),
            tagger_command: None,
            blocked_tags: default_blocked_tags(),
        }
    }
}

fn default_backup_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_blocked_tags() -> BTreeSet<String> {
    DEFAULT_BLOCKED_TAGS.iter().map(|t| t.to_string()).collect()
}

impl TrackerConfig {
    /// Reads a JSON config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppPaths {
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub upload_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(root: &Path) -> Result<Self> {
        let paths = Self::under(root);
        std::fs::create_dir_all(&paths.backup_dir)?;
        std::fs::create_dir_all(&paths.upload_dir)?;
        Ok(paths)
    }

    /// Path layout under `root` without touching the filesystem.
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            db_path: root.join("metadata.db"),
            backup_dir: root.join("backups"),
            upload_dir: root.join("uploads"),
        }
    }
}

/// Environment switches, read once at startup and handed to the engines.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub force_rebuild: Option<String>,
    pub allowed_user_emails: Option<String>,
    pub allowed_service_accounts: Option<String>,
    pub disable_backup_auth: Option<String>,
    pub tagger_command: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            force_rebuild: env::var("FORCE_REBUILD").ok(),
            allowed_user_emails: env::var("ALLOWED_USER_EMAILS").ok(),
            allowed_service_accounts: env::var("ALLOWED_SERVICE_ACCOUNT_IDS").ok(),
            disable_backup_auth: env::var("DISABLE_BACKUP_AUTH").ok(),
            tagger_command: env::var("TRACKER_TAGGER_CMD").ok(),
        }
    }

    /// `TRACKER_TAGGER_CMD` wins over the config file; split on whitespace.
    pub fn tagger_argv(&self, config: &TrackerConfig) -> Option<Vec<String>> {
        match self.tagger_command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => {
                Some(cmd.split_whitespace().map(str::to_string).collect())
            }
            _ => config
                .tagger_command
                .clone()
                .filter(|argv| !argv.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.retention, RetentionPolicy::default());
        assert_eq!(config.storage.upload_prefix, "upload");
        assert!(config.blocked_tags.contains("json"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(
            &path,
            r#"{"storage": {"bucket_root": "/mnt/bucket"}, "retention": {"min_backups": 3, "max_age_days": 7}}"#,
        )
        .unwrap();
        let config = TrackerConfig::load(&path).unwrap();
        assert_eq!(config.storage.bucket_root, PathBuf::from("/mnt/bucket"));
        assert_eq!(config.storage.snapshot_prefix, "db-backups");
        assert_eq!(config.retention.min_backups, 3);
        assert_eq!(config.backup_interval_secs, 86_400);
    }

    #[test]
    fn storage_section_without_bucket_root_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(&path, r#"{"storage": {"upload_prefix": "photos"}}"#).unwrap();
        let config = TrackerConfig::load(&path).unwrap();
        assert_eq!(config.storage.bucket_root, PathBuf::from("bucket"));
        assert_eq!(config.storage.upload_prefix, "photos");
        assert_eq!(config.storage.snapshot_prefix, "db-backups");
    }

    #[test]
    fn env_tagger_command_overrides_config() {
        let mut config = TrackerConfig::default();
        config.tagger_command = Some(vec!["from-config".into()]);
        let overrides = EnvOverrides {
            tagger_command: Some("vision-cli --json".into()),
            ..EnvOverrides::default()
        };
        assert_eq!(
            overrides.tagger_argv(&config),
            Some(vec!["vision-cli".to_string(), "--json".to_string()])
        );
        assert_eq!(
            EnvOverrides::default().tagger_argv(&config),
            Some(vec!["from-config".to_string()])
        );
    }

    #[test]
    fn discover_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::discover(dir.path()).unwrap();
        assert!(paths.backup_dir.is_dir());
        assert!(paths.upload_dir.is_dir());
        assert!(!paths.db_path.exists());
    }
}
