//! Restore planner and executor.
//!
//! A restore always starts by re-verifying the artifact checksum. Records are
//! then decoded (migrating older schema versions), grouped by type, and
//! their references resolved in a second pass against the artifact's own
//! keys or the live store. Preview stops there. Execute writes each type in
//! dependency order as its own atomic batch: a failed type blocks its
//! transitive dependents, independent types carry on, and nothing already
//! committed is rolled back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recvault_state::{ArtifactId, ArtifactRegistry, JobStore, MetadataEntry};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::artifact::{self, media_path, scan_dir};
use crate::catalog::Catalog;
use crate::codec::{Codec, ConstructionArgs, EntityRef, CURRENT_SCHEMA_VERSION};
use crate::error::{IntegrityError, ValidationError, VaultError, VaultResult};
use crate::host::RecordStore;
use crate::media::{self, MirrorStats, OverwritePolicy};
use crate::metrics::METRICS;
use crate::obs;
use crate::snapshot::SnapshotError;
use crate::VaultConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStrategy {
    /// Per type: delete every live row, insert the artifact's rows.
    Replace,
    /// Per type: upsert by natural key, never delete.
    Merge,
}

impl RestoreStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStrategy::Replace => "replace",
            RestoreStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for RestoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(RestoreStrategy::Replace),
            "merge" => Ok(RestoreStrategy::Merge),
            other => Err(format!("unknown restore strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    #[default]
    Preview,
    Execute,
}

impl RestoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMode::Preview => "preview",
            RestoreMode::Execute => "execute",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Abort before any write when a reference cannot be resolved.
    pub strict: bool,
    /// Checked between types; set it to stop after the current type.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RestoreOptions {
    pub fn strict() -> Self {
        Self {
            strict: true,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }
}

/// A record whose reference points at nothing; the record is not written.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{type_name}:{key} field {field} references missing {target}")]
pub struct RestoreConflict {
    pub type_name: String,
    pub key: String,
    pub field: String,
    pub target: EntityRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TypeOutcome {
    /// Preview, or execute aborted before writing.
    Planned,
    Committed {
        inserted: u64,
        updated: u64,
        deleted: u64,
    },
    Failed {
        error: String,
    },
    SkippedDependencyFailed {
        dependency: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeReport {
    pub type_name: String,
    /// Records of this type in the artifact.
    pub records: u64,
    /// Records that would be (or were) written after conflicts.
    pub planned: u64,
    pub conflicts: u64,
    pub outcome: TypeOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Previewed,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl RestoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStatus::Previewed => "previewed",
            RestoreStatus::Completed => "completed",
            RestoreStatus::Partial => "partial",
            RestoreStatus::Failed => "failed",
            RestoreStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaRestoreSummary {
    /// Files copied, or that would be copied on preview.
    pub files: u64,
    pub bytes: u64,
    pub skipped_existing: u64,
}

impl From<MirrorStats> for MediaRestoreSummary {
    fn from(s: MirrorStats) -> Self {
        Self {
            files: s.files,
            bytes: s.bytes,
            skipped_existing: s.skipped_existing,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub attempt_id: String,
    pub artifact_id: String,
    pub strategy: RestoreStrategy,
    pub mode: RestoreMode,
    pub strict: bool,
    pub status: RestoreStatus,
    /// Records per known type found in the artifact; empty types omitted.
    pub per_type_counts: BTreeMap<String, u64>,
    /// One entry per captured type, in dependency order.
    pub types: Vec<TypeReport>,
    pub conflicts: Vec<RestoreConflict>,
    /// Records of types the catalog does not know; never written.
    pub unknown_types: BTreeMap<String, u64>,
    pub migrated_records: u64,
    pub media: Option<MediaRestoreSummary>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RestoreReport {
    pub fn type_report(&self, type_name: &str) -> Option<&TypeReport> {
        self.types.iter().find(|t| t.type_name == type_name)
    }
}

/// Decoded contents of an artifact's records file.
struct LoadedPlan {
    groups: BTreeMap<String, Vec<ConstructionArgs>>,
    /// Types the artifact captured (including empty ones) that the catalog knows.
    captured: HashSet<String>,
    unknown_types: BTreeMap<String, u64>,
    migrated_records: u64,
    oldest_version: Option<u32>,
}

fn load_plan(dir: &Path, catalog: &Catalog, codec: &Codec) -> VaultResult<LoadedPlan> {
    let mut groups: BTreeMap<String, Vec<ConstructionArgs>> = BTreeMap::new();
    let mut unknown_types: BTreeMap<String, u64> = BTreeMap::new();
    let mut migrated_records = 0u64;
    let mut oldest_version: Option<u32> = None;

    let summary = scan_dir(dir, |line, record| {
        let Some(descriptor) = catalog.get(&record.type_name) else {
            *unknown_types.entry(record.type_name).or_insert(0) += 1;
            return Ok(());
        };
        let args = codec
            .decode(record, descriptor)
            .map_err(|e| ValidationError::InvalidRecord {
                line,
                reason: e.to_string(),
            })?;
        if let Some(from) = args.migrated_from {
            migrated_records += 1;
            oldest_version = Some(oldest_version.map_or(from, |v| v.min(from)));
        }
        groups
            .entry(descriptor.type_name.clone())
            .or_default()
            .push(args);
        Ok(())
    })?;

    let captured = summary
        .trailer
        .type_counts
        .keys()
        .chain(groups.keys())
        .filter(|t| catalog.contains(t))
        .cloned()
        .collect();

    Ok(LoadedPlan {
        groups,
        captured,
        unknown_types,
        migrated_records,
        oldest_version,
    })
}

pub struct RestoreEngine {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactRegistry>,
    store: Arc<dyn RecordStore>,
    catalog: Arc<Catalog>,
    codec: Arc<Codec>,
    config: VaultConfig,
}

impl RestoreEngine {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactRegistry>,
        store: Arc<dyn RecordStore>,
        catalog: Arc<Catalog>,
        codec: Arc<Codec>,
        config: VaultConfig,
    ) -> Self {
        Self {
            jobs,
            artifacts,
            store,
            catalog,
            codec,
            config,
        }
    }

    /// Preview or execute a restore of `artifact_id`.
    pub async fn restore(
        &self,
        artifact_id: &ArtifactId,
        strategy: RestoreStrategy,
        mode: RestoreMode,
        options: RestoreOptions,
    ) -> VaultResult<RestoreReport> {
        let started_at = Utc::now();
        let artifact = self.artifacts.get(artifact_id).await?;

        let to_check = artifact.clone();
        let check = tokio::task::spawn_blocking(move || artifact::check(&to_check)).await?;
        if !check.passed {
            obs::emit_verification(&artifact_id.0, false);
            return Err(IntegrityError {
                artifact_id: artifact_id.0.clone(),
                expected: check.expected,
                actual: check.actual,
            }
            .into());
        }

        let dir = artifact.location.clone();
        let catalog = Arc::clone(&self.catalog);
        let codec = Arc::clone(&self.codec);
        let plan =
            tokio::task::spawn_blocking(move || load_plan(&dir, &catalog, &codec)).await??;

        let (conflicts, excluded) = self.resolve_references(&plan, strategy).await?;

        let mut per_type_counts = BTreeMap::new();
        let mut types = Vec::new();
        for descriptor in self.catalog.ordered() {
            let name = &descriptor.type_name;
            if !plan.captured.contains(name) {
                continue;
            }
            let records = plan.groups.get(name).map(|g| g.len() as u64).unwrap_or(0);
            let type_conflicts = conflicts.iter().filter(|c| &c.type_name == name).count() as u64;
            let planned = plan
                .groups
                .get(name)
                .map(|g| {
                    g.iter()
                        .filter(|a| !excluded.contains(&a.entity.entity_ref()))
                        .count() as u64
                })
                .unwrap_or(0);
            if records > 0 {
                per_type_counts.insert(name.clone(), records);
            }
            types.push(TypeReport {
                type_name: name.clone(),
                records,
                planned,
                conflicts: type_conflicts,
                outcome: TypeOutcome::Planned,
            });
        }

        let mut report = RestoreReport {
            attempt_id: Uuid::new_v4().to_string(),
            artifact_id: artifact_id.0.clone(),
            strategy,
            mode,
            strict: options.strict,
            status: RestoreStatus::Previewed,
            per_type_counts,
            types,
            conflicts,
            unknown_types: plan.unknown_types.clone(),
            migrated_records: plan.migrated_records,
            media: None,
            error: None,
            started_at,
            finished_at: started_at,
        };
        let media_src = media_path(&artifact.location);
        let has_media = artifact.backup_kind.includes_media() && media_src.is_dir();

        if options.strict && !report.conflicts.is_empty() {
            report.status = RestoreStatus::Failed;
            report.error = Some(format!(
                "{} unresolved references; strict mode aborted before any write",
                report.conflicts.len()
            ));
            return Ok(self.finish(report));
        }

        if mode == RestoreMode::Preview {
            if has_media {
                report.media = Some(MediaRestoreSummary {
                    files: media::count_files(&media_src)?,
                    ..Default::default()
                });
            }
            return Ok(self.finish(report));
        }

        let mut plan = plan;
        let mut blocked: HashMap<String, String> = HashMap::new();
        let mut cancelled = false;
        for entry in report.types.iter_mut() {
            if cancelled || options.cancelled() {
                cancelled = true;
                entry.outcome = TypeOutcome::Cancelled;
                continue;
            }
            if let Some(dependency) = blocked.get(&entry.type_name) {
                entry.outcome = TypeOutcome::SkippedDependencyFailed {
                    dependency: dependency.clone(),
                };
                continue;
            }

            let entities: Vec<_> = plan
                .groups
                .remove(&entry.type_name)
                .unwrap_or_default()
                .into_iter()
                .map(|a| a.entity)
                .filter(|e| !excluded.contains(&e.entity_ref()))
                .collect();
            let written = match strategy {
                RestoreStrategy::Replace => self.store.replace_all(&entry.type_name, entities).await,
                RestoreStrategy::Merge => self.store.upsert(&entry.type_name, entities).await,
            };
            match written {
                Ok(summary) => {
                    debug!(type_name = %entry.type_name, ?summary, "type restored");
                    entry.outcome = TypeOutcome::Committed {
                        inserted: summary.inserted,
                        updated: summary.updated,
                        deleted: summary.deleted,
                    };
                }
                Err(e) => {
                    warn!(type_name = %entry.type_name, error = %e, "type restore failed");
                    entry.outcome = TypeOutcome::Failed {
                        error: e.to_string(),
                    };
                    for dependent in self.catalog.transitive_dependents(&entry.type_name) {
                        blocked
                            .entry(dependent)
                            .or_insert_with(|| entry.type_name.clone());
                    }
                }
            }
        }

        if has_media && !cancelled {
            match self.restore_media(&media_src, strategy).await {
                Ok(summary) => report.media = Some(summary),
                Err(e) => report.error = Some(e.to_string()),
            }
        }

        report.status = if cancelled {
            RestoreStatus::Cancelled
        } else {
            let committed = report
                .types
                .iter()
                .filter(|t| matches!(t.outcome, TypeOutcome::Committed { .. }))
                .count();
            let clean = committed == report.types.len() && report.error.is_none();
            if clean {
                RestoreStatus::Completed
            } else if committed > 0 || report.media.is_some() {
                RestoreStatus::Partial
            } else {
                RestoreStatus::Failed
            }
        };

        METRICS.inc_restores_executed();
        self.annotate_job(artifact_id, &report, plan.oldest_version)
            .await;
        Ok(self.finish(report))
    }

    fn finish(&self, mut report: RestoreReport) -> RestoreReport {
        report.finished_at = Utc::now();
        obs::emit_restore_finished(
            &report.attempt_id,
            &report.artifact_id,
            report.mode.as_str(),
            report.status.as_str(),
        );
        report
    }

    async fn restore_media(
        &self,
        src: &Path,
        strategy: RestoreStrategy,
    ) -> VaultResult<MediaRestoreSummary> {
        let dst = self
            .config
            .media_root
            .clone()
            .ok_or_else(|| VaultError::Config("media root is not configured".to_string()))?;
        let src = src.to_path_buf();
        let policy = match strategy {
            RestoreStrategy::Replace => OverwritePolicy::Overwrite,
            RestoreStrategy::Merge => OverwritePolicy::SkipExisting,
        };
        let stats = tokio::task::spawn_blocking(move || media::mirror_tree(&src, &dst, policy, None))
            .await?
            .map_err(SnapshotError::from)?;
        METRICS.add_media_files_copied(stats.files);
        Ok(stats.into())
    }

    /// Second pass: every deferred reference must point at a record the
    /// restore will write or, where the live rows survive, one that exists.
    /// Excluding a record can orphan records that point at it, so this runs
    /// until nothing changes.
    async fn resolve_references(
        &self,
        plan: &LoadedPlan,
        strategy: RestoreStrategy,
    ) -> VaultResult<(Vec<RestoreConflict>, HashSet<EntityRef>)> {
        let artifact_keys: HashMap<&str, HashSet<&str>> = plan
            .groups
            .iter()
            .map(|(t, records)| {
                (
                    t.as_str(),
                    records.iter().map(|a| a.entity.key.as_str()).collect(),
                )
            })
            .collect();
        let mut live: HashMap<EntityRef, bool> = HashMap::new();
        let mut excluded: HashSet<EntityRef> = HashSet::new();
        let mut conflicts = Vec::new();

        loop {
            let mut changed = false;
            for (type_name, records) in &plan.groups {
                for args in records {
                    let me = args.entity.entity_ref();
                    if excluded.contains(&me) || args.deferred.is_empty() {
                        continue;
                    }
                    let mut missing = Vec::new();
                    for deferred in &args.deferred {
                        let target = &deferred.target;
                        let in_artifact = plan.captured.contains(&target.type_name);
                        if in_artifact
                            && !excluded.contains(target)
                            && artifact_keys
                                .get(target.type_name.as_str())
                                .is_some_and(|keys| keys.contains(target.key.as_str()))
                        {
                            continue;
                        }
                        if in_artifact && strategy == RestoreStrategy::Replace {
                            missing.push(deferred);
                            continue;
                        }
                        let exists = match live.get(target) {
                            Some(hit) => *hit,
                            None => {
                                let hit = self.store.exists(&target.type_name, &target.key).await?;
                                live.insert(target.clone(), hit);
                                hit
                            }
                        };
                        if !exists {
                            missing.push(deferred);
                        }
                    }
                    if !missing.is_empty() {
                        for deferred in missing {
                            conflicts.push(RestoreConflict {
                                type_name: type_name.clone(),
                                key: args.entity.key.clone(),
                                field: deferred.field.clone(),
                                target: deferred.target.clone(),
                            });
                        }
                        excluded.insert(me);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        Ok((conflicts, excluded))
    }

    async fn annotate_job(
        &self,
        artifact_id: &ArtifactId,
        report: &RestoreReport,
        oldest_version: Option<u32>,
    ) {
        let job = match self.jobs.find_by_artifact(artifact_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(artifact_id = %artifact_id, error = %e, "could not look up job for restore annotation");
                return;
            }
        };
        let mut entries = vec![MetadataEntry::Restore {
            attempt_id: report.attempt_id.clone(),
            strategy: report.strategy.as_str().to_string(),
            status: report.status.as_str().to_string(),
            at: report.started_at,
        }];
        if let Some(from_version) = oldest_version {
            entries.push(MetadataEntry::Migration {
                from_version,
                to_version: CURRENT_SCHEMA_VERSION,
                records: report.migrated_records,
            });
        }
        for entry in entries {
            if let Err(e) = self.jobs.annotate(&job.job_id, entry).await {
                warn!(job_id = %job.job_id, error = %e, "failed to annotate job with restore");
            }
        }
    }
}
