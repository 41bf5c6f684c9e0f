//! recvault Core Library
//!
//! Snapshot, verification, upload, restore and health monitoring for a
//! records application's relational state and media tree. Persisted job and
//! artifact rows live behind the `recvault-state` traits; live records are
//! reached through [`RecordStore`].

pub mod artifact;
pub mod catalog;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod host;
pub mod media;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod restore;
pub mod snapshot;
pub mod telemetry;
pub mod upload;

use std::sync::Arc;

pub use artifact::{ArtifactHeader, ArtifactLine, ArtifactTrailer, ChecksumCheck, Manifest};
pub use catalog::{Catalog, CatalogError, EntityTypeDescriptor};
pub use checksum::DirDigestMode;
pub use codec::{
    Codec, CodecError, ConstructionArgs, Entity, EntityRef, FieldValue, MigrationRegistry,
    SerializedRecord, CURRENT_SCHEMA_VERSION,
};
pub use config::VaultConfig;
pub use error::{IntegrityError, ValidationError, VaultError, VaultResult};
pub use health::{
    Alert, AlertKind, AlertSeverity, AlertSink, HealthMonitor, HealthSnapshot, HealthThresholds,
    LogAlertSink, MonitorReport, WebhookAlertSink,
};
pub use host::{FsRecordStore, MemoryRecordStore, RecordStore, StoreError, WriteSummary};
pub use metrics::METRICS;
pub use obs::{
    emit_backup_failed, emit_backup_finished, emit_backup_started, emit_restore_finished,
    JobSpan,
};
pub use orchestrator::{
    BackupOrchestrator, BackupOutcome, CleanupReport, StuckJob, VerificationReport,
};
pub use restore::{
    RestoreConflict, RestoreEngine, RestoreMode, RestoreOptions, RestoreReport, RestoreStatus,
    RestoreStrategy, TypeOutcome, TypeReport,
};
pub use snapshot::{Deadline, PartialSourceError, SnapshotError, SnapshotSettings, SnapshotWriter};
pub use telemetry::init_tracing;
pub use upload::UploadGateway;

pub use recvault_state::{
    ArtifactId, ArtifactRegistry, ArtifactSource, BackupArtifact, BackupJob, BackupKind, JobId,
    JobStatus, JobStore, StorageError,
};

/// Crate version, as reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// All engine components wired over one set of stores.
pub struct Vault {
    pub orchestrator: BackupOrchestrator,
    pub uploads: UploadGateway,
    pub restores: RestoreEngine,
    pub health: HealthMonitor,
}

impl Vault {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactRegistry>,
        store: Arc<dyn RecordStore>,
        catalog: Catalog,
        config: VaultConfig,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let writer = SnapshotWriter::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            config.snapshot_settings(),
        );
        Self {
            orchestrator: BackupOrchestrator::new(
                Arc::clone(&jobs),
                Arc::clone(&artifacts),
                writer,
                config.clone(),
            ),
            uploads: UploadGateway::new(Arc::clone(&jobs), Arc::clone(&artifacts), config.clone()),
            restores: RestoreEngine::new(
                Arc::clone(&jobs),
                Arc::clone(&artifacts),
                store,
                catalog,
                Arc::new(Codec::default()),
                config.clone(),
            ),
            health: HealthMonitor::new(jobs, artifacts, config.health),
        }
    }

    /// Alert sinks for the configured environment: the log sink, plus a
    /// webhook when one is set.
    pub fn alert_sinks(config: &VaultConfig) -> VaultResult<Vec<Box<dyn AlertSink>>> {
        let mut sinks: Vec<Box<dyn AlertSink>> = vec![Box::new(LogAlertSink)];
        if let Some(url) = &config.alert_webhook {
            let sink = WebhookAlertSink::new(url.clone())
                .map_err(|e| VaultError::Config(format!("alert webhook: {e}")))?;
            sinks.push(Box::new(sink));
        }
        Ok(sinks)
    }
}
