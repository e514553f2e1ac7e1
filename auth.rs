use crate::config::EnvOverrides;
use crate::error::{Error, Result};
use crate::models::BackupOutcome;
use crate::snapshot::SnapshotEngine;
use std::collections::HashSet;

/// Who is asking for a manual backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    User { email: String },
    ServiceAccount { subject: String },
    Anonymous,
}

/// Allow-lists gating the manual backup trigger.
#[derive(Debug, Clone, Default)]
pub struct BackupAuthorizer {
    allowed_users: HashSet<String>,
    allowed_service_accounts: HashSet<String>,
    disabled: bool,
}

impl BackupAuthorizer {
    pub fn from_env(overrides: &EnvOverrides) -> Self {
        Self {
            allowed_users: split_list(overrides.allowed_user_emails.as_deref()),
            allowed_service_accounts: split_list(overrides.allowed_service_accounts.as_deref()),
            disabled: overrides
                .disable_backup_auth
                .as_deref()
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn authorize(&self, caller: &Caller) -> Result<()> {
        if self.disabled {
            log::warn!("Backup auth disabled; allowing {caller:?}");
            return Ok(());
        }
        match caller {
            Caller::User { email } if self.allowed_users.contains(email) => Ok(()),
            Caller::User { email } => Err(Error::Unauthorized(format!(
                "user {email} may not trigger backups"
            ))),
            Caller::ServiceAccount { subject } if self.allowed_service_accounts.contains(subject) => {
                Ok(())
            }
            Caller::ServiceAccount { subject } => Err(Error::Unauthorized(format!(
                "service account {subject} may not trigger backups"
            ))),
            Caller::Anonymous => Err(Error::Unauthorized("missing authorization".into())),
        }
    }
}

/// Manual backup: rejected callers never reach the snapshot engine.
pub fn trigger_backup(
    authorizer: &BackupAuthorizer,
    engine: &SnapshotEngine,
    caller: &Caller,
) -> Result<BackupOutcome> {
    authorizer.authorize(caller)?;
    log::info!("Manual backup requested by {caller:?}");
    engine.perform_backup()
}

fn split_list(raw: Option<&str>) -> HashSet<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
