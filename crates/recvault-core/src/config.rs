//! Engine configuration.
//!
//! Defaults suit a single host; every value can be overridden from the
//! environment with [`VaultConfig::from_env`] or set directly with the
//! `with_*` builders.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::checksum::DirDigestMode;
use crate::error::{VaultError, VaultResult};
use crate::health::HealthThresholds;
use crate::snapshot::SnapshotSettings;

pub const DEFAULT_BACKUP_DIR: &str = ".recvault/backups";
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_QUICK_BUDGET: Duration = Duration::from_secs(120);
pub const DEFAULT_FULL_BUDGET: Duration = Duration::from_secs(3600);
pub const DEFAULT_TIMEOUT_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_STUCK_THRESHOLD_MINUTES: u64 = 30;

#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Artifacts live in `<backup_root>/<artifact_id>/`.
    pub backup_root: PathBuf,
    /// Live media tree; required for media and full backups.
    pub media_root: Option<PathBuf>,
    pub batch_size: usize,
    pub quick_budget: Duration,
    pub full_budget: Duration,
    /// Extra time the hard outer timeout allows past the cooperative budget.
    pub timeout_grace: Duration,
    pub stuck_threshold_minutes: u64,
    pub dir_digest_mode: DirDigestMode,
    pub health: HealthThresholds,
    pub alert_webhook: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from(DEFAULT_BACKUP_DIR),
            media_root: None,
            batch_size: DEFAULT_BATCH_SIZE,
            quick_budget: DEFAULT_QUICK_BUDGET,
            full_budget: DEFAULT_FULL_BUDGET,
            timeout_grace: DEFAULT_TIMEOUT_GRACE,
            stuck_threshold_minutes: DEFAULT_STUCK_THRESHOLD_MINUTES,
            dir_digest_mode: DirDigestMode::default(),
            health: HealthThresholds::default(),
            alert_webhook: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> VaultResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| VaultError::Config(format!("{name}={raw}: {e}"))),
        _ => Ok(None),
    }
}

impl VaultConfig {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            ..Self::default()
        }
    }

    /// Create from environment variables
    ///
    /// Reads (all optional):
    /// - RECVAULT_BACKUP_DIR (default: `.recvault/backups`)
    /// - RECVAULT_MEDIA_DIR
    /// - RECVAULT_BATCH_SIZE (default: 1000)
    /// - RECVAULT_QUICK_TIMEOUT_SECS / RECVAULT_FULL_TIMEOUT_SECS (120 / 3600)
    /// - RECVAULT_TIMEOUT_GRACE_SECS (default: 30)
    /// - RECVAULT_STUCK_THRESHOLD_MINUTES (default: 30)
    /// - RECVAULT_DIR_DIGEST (`paths` | `contents`, default: paths)
    /// - RECVAULT_STALE_WARNING_HOURS / RECVAULT_STALE_CRITICAL_HOURS (30 / 48)
    /// - RECVAULT_MIN_HEALTH_SCORE (default: 0.8)
    /// - RECVAULT_ALERT_WEBHOOK
    pub fn from_env() -> VaultResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = env_parse::<PathBuf>("RECVAULT_BACKUP_DIR")? {
            config.backup_root = dir;
        }
        config.media_root = env_parse::<PathBuf>("RECVAULT_MEDIA_DIR")?;
        if let Some(n) = env_parse::<usize>("RECVAULT_BATCH_SIZE")? {
            config = config.with_batch_size(n);
        }
        if let Some(secs) = env_parse::<u64>("RECVAULT_QUICK_TIMEOUT_SECS")? {
            config.quick_budget = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("RECVAULT_FULL_TIMEOUT_SECS")? {
            config.full_budget = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("RECVAULT_TIMEOUT_GRACE_SECS")? {
            config.timeout_grace = Duration::from_secs(secs);
        }
        if let Some(m) = env_parse::<u64>("RECVAULT_STUCK_THRESHOLD_MINUTES")? {
            config.stuck_threshold_minutes = m;
        }
        if let Some(mode) = env_parse::<DirDigestMode>("RECVAULT_DIR_DIGEST")? {
            config.dir_digest_mode = mode;
        }
        if let Some(h) = env_parse::<i64>("RECVAULT_STALE_WARNING_HOURS")? {
            config.health.stale_warning_hours = h;
        }
        if let Some(h) = env_parse::<i64>("RECVAULT_STALE_CRITICAL_HOURS")? {
            config.health.stale_critical_hours = h;
        }
        if let Some(score) = env_parse::<f64>("RECVAULT_MIN_HEALTH_SCORE")? {
            config.health.min_score = score;
        }
        config.alert_webhook = env_parse::<String>("RECVAULT_ALERT_WEBHOOK")?;

        Ok(config)
    }

    pub fn with_backup_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_root = dir.into();
        self
    }

    pub fn with_media_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.media_root = Some(dir.into());
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn with_budgets(mut self, quick: Duration, full: Duration) -> Self {
        self.quick_budget = quick;
        self.full_budget = full;
        self
    }

    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }

    pub fn with_stuck_threshold_minutes(mut self, minutes: u64) -> Self {
        self.stuck_threshold_minutes = minutes;
        self
    }

    pub fn with_dir_digest_mode(mut self, mode: DirDigestMode) -> Self {
        self.dir_digest_mode = mode;
        self
    }

    pub fn with_health(mut self, thresholds: HealthThresholds) -> Self {
        self.health = thresholds;
        self
    }

    pub fn with_alert_webhook(mut self, url: impl Into<String>) -> Self {
        self.alert_webhook = Some(url.into());
        self
    }

    /// Cooperative budget for a backup run.
    pub fn budget_for(&self, quick: bool) -> Duration {
        if quick {
            self.quick_budget
        } else {
            self.full_budget
        }
    }

    pub fn artifact_dir(&self, artifact_id: &str) -> PathBuf {
        self.backup_root.join(artifact_id)
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn snapshot_settings(&self) -> SnapshotSettings {
        SnapshotSettings {
            batch_size: self.batch_size,
            media_root: self.media_root.clone(),
            digest_mode: self.dir_digest_mode,
        }
    }
}
