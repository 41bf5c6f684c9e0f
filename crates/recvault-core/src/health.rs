//! Backup health: score, staleness and alerting.
//!
//! The monitor is advisory. It reads job rows and artifact directories and
//! never changes either.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recvault_state::{ArtifactRegistry, BackupJob, JobFilter, JobStatus, JobStore, StorageError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::artifact::records_path;
use crate::error::VaultResult;
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Latest database-bearing success older than this raises a warning.
    pub stale_warning_hours: i64,
    /// ...and older than this, a critical alert.
    pub stale_critical_hours: i64,
    pub min_score: f64,
    /// Failures started within this many hours raise an alert.
    pub failure_lookback_hours: i64,
    pub verification_max_age_days: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_warning_hours: 30,
            stale_critical_hours: 48,
            min_score: 0.8,
            failure_lookback_hours: 24,
            verification_max_age_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StaleBackup,
    NoBackup,
    RecentFailure,
    LowHealthScore,
    VerificationOverdue,
    ArtifactMissing,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::StaleBackup => "stale_backup",
            AlertKind::NoBackup => "no_backup",
            AlertKind::RecentFailure => "recent_failure",
            AlertKind::LowHealthScore => "low_health_score",
            AlertKind::VerificationOverdue => "verification_overdue",
            AlertKind::ArtifactMissing => "artifact_missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    fn new(kind: AlertKind, severity: AlertSeverity, message: String, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            severity,
            message,
            raised_at: at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub computed_at: DateTime<Utc>,
    pub window_hours: i64,
    pub successes: u64,
    pub failures: u64,
    pub in_progress: u64,
    /// successes / (successes + failures) in the window; 1.0 with no
    /// terminal jobs.
    pub score: f64,
    pub last_successful_database_backup: Option<DateTime<Utc>>,
    pub last_verification: Option<DateTime<Utc>>,
    pub open_alerts: Vec<Alert>,
}

impl HealthSnapshot {
    pub fn healthy(&self) -> bool {
        self.open_alerts.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.open_alerts
            .iter()
            .any(|a| a.severity == AlertSeverity::Critical)
    }
}

fn window_delta(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Compute health from job rows. `jobs` may hold the full history; the score
/// only counts jobs started inside `window`.
pub fn evaluate(
    jobs: &[BackupJob],
    window: Duration,
    now: DateTime<Utc>,
    thresholds: &HealthThresholds,
) -> HealthSnapshot {
    let window = window_delta(window);
    let window_start = now - window;

    let mut successes = 0u64;
    let mut failures = 0u64;
    let mut in_progress = 0u64;
    // Ingested uploads say nothing about whether backups are running.
    let runs: Vec<&BackupJob> = jobs.iter().filter(|j| !j.metadata.was_uploaded()).collect();

    for job in runs.iter().filter(|j| j.started_at >= window_start) {
        match job.status {
            JobStatus::Success => successes += 1,
            JobStatus::Failed => failures += 1,
            JobStatus::InProgress => in_progress += 1,
        }
    }
    let terminal = successes + failures;
    let score = if terminal == 0 {
        1.0
    } else {
        successes as f64 / terminal as f64
    };

    let last_successful_database_backup = runs
        .iter()
        .filter(|j| j.status == JobStatus::Success && j.backup_kind.includes_records())
        .filter_map(|j| j.completed_at)
        .max();
    let last_verification = jobs
        .iter()
        .filter_map(|j| j.metadata.latest_verification())
        .filter(|v| v.passed)
        .map(|v| v.verified_at)
        .max();

    let mut alerts = Vec::new();
    match last_successful_database_backup {
        None => alerts.push(Alert::new(
            AlertKind::NoBackup,
            AlertSeverity::Critical,
            "no successful database backup on record".to_string(),
            now,
        )),
        Some(at) => {
            let age_hours = (now - at).num_hours();
            let severity = if age_hours >= thresholds.stale_critical_hours {
                Some(AlertSeverity::Critical)
            } else if age_hours >= thresholds.stale_warning_hours {
                Some(AlertSeverity::Warning)
            } else {
                None
            };
            if let Some(severity) = severity {
                alerts.push(Alert::new(
                    AlertKind::StaleBackup,
                    severity,
                    format!("latest successful database backup is {age_hours}h old"),
                    now,
                ));
            }
        }
    }

    let failure_cutoff = now - chrono::Duration::hours(thresholds.failure_lookback_hours);
    let recent_failures = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Failed && j.started_at >= failure_cutoff)
        .count();
    if recent_failures > 0 {
        alerts.push(Alert::new(
            AlertKind::RecentFailure,
            AlertSeverity::Warning,
            format!(
                "{recent_failures} backup job(s) failed in the last {}h",
                thresholds.failure_lookback_hours
            ),
            now,
        ));
    }

    if score < thresholds.min_score {
        alerts.push(Alert::new(
            AlertKind::LowHealthScore,
            AlertSeverity::Warning,
            format!("health score {score:.2} below {:.2}", thresholds.min_score),
            now,
        ));
    }

    let verification_cutoff = now - chrono::Duration::days(thresholds.verification_max_age_days);
    if last_verification.map_or(true, |at| at < verification_cutoff) {
        alerts.push(Alert::new(
            AlertKind::VerificationOverdue,
            AlertSeverity::Warning,
            format!(
                "no passing verification in the last {} days",
                thresholds.verification_max_age_days
            ),
            now,
        ));
    }

    HealthSnapshot {
        computed_at: now,
        window_hours: window.num_hours(),
        successes,
        failures,
        in_progress,
        score,
        last_successful_database_backup,
        last_verification,
        open_alerts: alerts,
    }
}

// ---------------------------------------------------------------------------
// Alert delivery
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned {0}")]
    Status(u16),
}

/// Somewhere alerts go.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the tracing pipeline. Always enabled.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        obs::emit_alert(alert.kind.as_str(), alert.severity.as_str(), &alert.message);
        Ok(())
    }
}

/// POSTs each alert as JSON.
pub struct WebhookAlertSink {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self, AlertError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("recvault/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self.http_client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub snapshot: HealthSnapshot,
    /// Successful artifacts checked on disk (when `check_external`).
    pub artifacts_checked: u64,
    pub alerts_delivered: u64,
    /// `sink: error` for each failed delivery.
    pub delivery_errors: Vec<String>,
}

pub struct HealthMonitor {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactRegistry>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactRegistry>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            jobs,
            artifacts,
            thresholds,
        }
    }

    pub async fn compute(&self, window: Duration) -> VaultResult<HealthSnapshot> {
        let jobs = self.jobs.list(&JobFilter::all()).await?;
        Ok(evaluate(&jobs, window, Utc::now(), &self.thresholds))
    }

    /// Compute health, optionally confirm recent artifacts still exist on
    /// disk, and optionally push open alerts through `sinks`.
    pub async fn monitor(
        &self,
        window: Duration,
        send_alerts: bool,
        check_external: bool,
        sinks: &[Box<dyn AlertSink>],
    ) -> VaultResult<MonitorReport> {
        let now = Utc::now();
        let jobs = self.jobs.list(&JobFilter::all()).await?;
        let mut snapshot = evaluate(&jobs, window, now, &self.thresholds);

        let mut artifacts_checked = 0;
        if check_external {
            let window_start = now - window_delta(window);
            for job in jobs
                .iter()
                .filter(|j| j.status == JobStatus::Success && j.started_at >= window_start)
            {
                let Some(artifact_id) = &job.artifact_id else {
                    continue;
                };
                artifacts_checked += 1;
                let missing = match self.artifacts.get(artifact_id).await {
                    Ok(artifact) => !records_path(&artifact.location).is_file(),
                    Err(StorageError::ArtifactNotFound { .. }) => true,
                    Err(e) => return Err(e.into()),
                };
                if missing {
                    snapshot.open_alerts.push(Alert::new(
                        AlertKind::ArtifactMissing,
                        AlertSeverity::Critical,
                        format!("artifact {artifact_id} of job {} is missing on disk", job.job_id),
                        now,
                    ));
                }
            }
        }

        let mut alerts_delivered = 0;
        let mut delivery_errors = Vec::new();
        if send_alerts {
            METRICS.add_alerts_raised(snapshot.open_alerts.len() as u64);
            for alert in &snapshot.open_alerts {
                for sink in sinks {
                    match sink.deliver(alert).await {
                        Ok(()) => alerts_delivered += 1,
                        Err(e) => {
                            warn!(sink = sink.name(), error = %e, "alert delivery failed");
                            delivery_errors.push(format!("{}: {e}", sink.name()));
                        }
                    }
                }
            }
        }
        debug!(
            alerts = snapshot.open_alerts.len(),
            score = snapshot.score,
            "health evaluated"
        );

        Ok(MonitorReport {
            snapshot,
            artifacts_checked,
            alerts_delivered,
            delivery_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recvault_state::{
        ArtifactId, BackupKind, JobCompletion, JobFailure, MetadataEntry, VerificationInfo,
    };

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn success(kind: BackupKind, hours_ago: i64, now: DateTime<Utc>) -> BackupJob {
        let mut job = BackupJob::start(kind, false);
        job.started_at = now - chrono::Duration::hours(hours_ago);
        job.apply_completion(
            JobCompletion {
                artifact_id: ArtifactId::new(),
                byte_size: 10,
                checksum: "c".into(),
                metadata: vec![],
            },
            job.started_at,
        );
        job
    }

    fn failure(hours_ago: i64, now: DateTime<Utc>) -> BackupJob {
        let mut job = BackupJob::start(BackupKind::Database, false);
        job.started_at = now - chrono::Duration::hours(hours_ago);
        job.apply_failure(JobFailure::new("boom"), job.started_at);
        job
    }

    fn verified(mut job: BackupJob, at: DateTime<Utc>) -> BackupJob {
        job.metadata.push(MetadataEntry::Verification(VerificationInfo {
            verified_at: at,
            passed: true,
            expected: "c".into(),
            actual: "c".into(),
        }));
        job
    }

    #[test]
    fn no_jobs_scores_one_and_is_critical() {
        let now = Utc::now();
        let snap = evaluate(&[], DAY, now, &HealthThresholds::default());
        assert_eq!(snap.score, 1.0);
        assert!(snap.has_critical());
        assert!(snap.open_alerts.iter().any(|a| a.kind == AlertKind::NoBackup));
    }

    #[test]
    fn fresh_verified_backup_is_healthy() {
        let now = Utc::now();
        let jobs = vec![verified(success(BackupKind::Database, 2, now), now)];
        let snap = evaluate(&jobs, DAY, now, &HealthThresholds::default());
        assert!(snap.healthy(), "{:?}", snap.open_alerts);
        assert_eq!(snap.successes, 1);
    }

    #[test]
    fn uploads_do_not_stand_in_for_backups() {
        let now = Utc::now();
        let mut ingested = success(BackupKind::Database, 0, now);
        ingested.metadata.push(MetadataEntry::Upload {
            description: Some("old export".into()),
            declared_kind: BackupKind::Database,
        });
        let jobs = vec![verified(ingested, now), failure(2, now)];

        let snap = evaluate(&jobs, DAY, now, &HealthThresholds::default());
        assert!(snap.last_successful_database_backup.is_none());
        assert!(snap.open_alerts.iter().any(|a| a.kind == AlertKind::NoBackup));
        assert_eq!(snap.successes, 0);
        assert_eq!(snap.score, 0.0);
    }

    #[test]
    fn staleness_thresholds() {
        let now = Utc::now();
        let t = HealthThresholds::default();

        let warn = evaluate(&[verified(success(BackupKind::Full, 31, now), now)], DAY, now, &t);
        let stale: Vec<_> = warn
            .open_alerts
            .iter()
            .filter(|a| a.kind == AlertKind::StaleBackup)
            .collect();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].severity, AlertSeverity::Warning);

        let crit = evaluate(&[verified(success(BackupKind::Full, 50, now), now)], DAY, now, &t);
        assert!(crit
            .open_alerts
            .iter()
            .any(|a| a.kind == AlertKind::StaleBackup && a.severity == AlertSeverity::Critical));
    }

    #[test]
    fn media_backups_do_not_count_as_database_backups() {
        let now = Utc::now();
        let snap = evaluate(
            &[success(BackupKind::Media, 1, now)],
            DAY,
            now,
            &HealthThresholds::default(),
        );
        assert!(snap.last_successful_database_backup.is_none());
        assert!(snap.open_alerts.iter().any(|a| a.kind == AlertKind::NoBackup));
    }

    #[test]
    fn score_counts_terminal_jobs_in_window() {
        let now = Utc::now();
        let jobs = vec![
            verified(success(BackupKind::Database, 1, now), now),
            success(BackupKind::Database, 3, now),
            failure(5, now),
            failure(100, now),
        ];
        let snap = evaluate(&jobs, DAY, now, &HealthThresholds::default());
        assert_eq!(snap.successes, 2);
        assert_eq!(snap.failures, 1);
        assert!((snap.score - 2.0 / 3.0).abs() < 1e-9);
        assert!(snap.open_alerts.iter().any(|a| a.kind == AlertKind::LowHealthScore));
        assert!(snap.open_alerts.iter().any(|a| a.kind == AlertKind::RecentFailure));
    }

    #[test]
    fn old_verification_is_overdue() {
        let now = Utc::now();
        let jobs = vec![verified(
            success(BackupKind::Database, 1, now),
            now - chrono::Duration::days(8),
        )];
        let snap = evaluate(&jobs, DAY, now, &HealthThresholds::default());
        assert!(snap
            .open_alerts
            .iter()
            .any(|a| a.kind == AlertKind::VerificationOverdue));
    }
}
