//! Shared fixtures: a clinic catalog, seeded in-memory stores and a vault
//! rooted in temp directories.

#![allow(dead_code)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recvault_core::host::StoreResult;
use recvault_core::{
    Catalog, Entity, EntityRef, EntityTypeDescriptor, FieldValue, MemoryRecordStore, RecordStore,
    Vault, VaultConfig, WriteSummary,
};
use recvault_state::fakes::{MemoryArtifactRegistry, MemoryJobStore};
use tempfile::TempDir;

/// clinic <- patient <- visit, plus a skippable audit_log.
pub fn clinic_catalog() -> Catalog {
    Catalog::build(vec![
        EntityTypeDescriptor::new("clinic").with_rank(0),
        EntityTypeDescriptor::new("patient")
            .with_rank(1)
            .depends_on("clinic"),
        EntityTypeDescriptor::new("visit")
            .with_rank(2)
            .depends_on("patient"),
        EntityTypeDescriptor::new("audit_log").with_rank(3).skippable(),
    ])
    .expect("catalog")
}

pub fn clinic(key: &str) -> Entity {
    Entity::new("clinic", key).with_field("name", FieldValue::Text(format!("Clinic {key}")))
}

pub fn patient(key: &str, clinic_key: &str, name: &str) -> Entity {
    Entity::new("patient", key)
        .with_field("name", FieldValue::Text(name.to_string()))
        .with_field(
            "clinic",
            FieldValue::Reference(EntityRef::new("clinic", clinic_key)),
        )
}

pub fn visit(key: &str, patient_key: &str) -> Entity {
    Entity::new("visit", key)
        .with_field("notes", FieldValue::Text(format!("visit {key}")))
        .with_field(
            "patient",
            FieldValue::Reference(EntityRef::new("patient", patient_key)),
        )
}

/// `clinics` clinics, `patients` patients spread across them, `visits`
/// visits spread across the patients.
pub fn seed(store: &MemoryRecordStore, clinics: usize, patients: usize, visits: usize) {
    for c in 0..clinics {
        store.insert(clinic(&format!("c-{c:03}"))).expect("seed clinic");
    }
    for p in 0..patients {
        let c = p % clinics.max(1);
        store
            .insert(patient(
                &format!("p-{p:03}"),
                &format!("c-{c:03}"),
                &format!("Patient {p}"),
            ))
            .expect("seed patient");
    }
    for v in 0..visits {
        let p = v % patients.max(1);
        store
            .insert(visit(&format!("v-{v:03}"), &format!("p-{p:03}")))
            .expect("seed visit");
    }
}

pub struct Harness {
    pub jobs: Arc<MemoryJobStore>,
    pub artifacts: Arc<MemoryArtifactRegistry>,
    pub store: Arc<MemoryRecordStore>,
    pub config: VaultConfig,
    pub vault: Vault,
    pub backup_dir: TempDir,
    pub media_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|c| c)
    }

    pub fn with_config(tweak: impl FnOnce(VaultConfig) -> VaultConfig) -> Self {
        let store = Arc::new(MemoryRecordStore::new());
        Self::with_store(store.clone(), store, tweak)
    }

    /// `store` backs the engine; `memory` is the same store seen concretely
    /// for seeding and assertions.
    pub fn with_store(
        store: Arc<dyn RecordStore>,
        memory: Arc<MemoryRecordStore>,
        tweak: impl FnOnce(VaultConfig) -> VaultConfig,
    ) -> Self {
        let backup_dir = tempfile::tempdir().expect("backup dir");
        let media_dir = tempfile::tempdir().expect("media dir");
        let config = tweak(
            VaultConfig::new(backup_dir.path())
                .with_media_root(media_dir.path())
                .with_batch_size(7),
        );
        let jobs = Arc::new(MemoryJobStore::new());
        let artifacts = Arc::new(MemoryArtifactRegistry::new());
        let vault = Vault::new(
            jobs.clone(),
            artifacts.clone(),
            store,
            clinic_catalog(),
            config.clone(),
        );
        Self {
            jobs,
            artifacts,
            store: memory,
            config,
            vault,
            backup_dir,
            media_dir,
        }
    }

    pub fn write_media(&self, rel: &str, body: &[u8]) {
        let path = self.media_dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("media parent");
        }
        fs::write(path, body).expect("media file");
    }
}

/// Delegates to a [`MemoryRecordStore`] but sleeps before every read.
pub struct SlowStore {
    pub inner: Arc<MemoryRecordStore>,
    pub delay: Duration,
}

#[async_trait]
impl RecordStore for SlowStore {
    async fn count(&self, type_name: &str) -> StoreResult<u64> {
        self.inner.count(type_name).await
    }

    async fn read_batch(
        &self,
        type_name: &str,
        after_key: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Entity>> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_batch(type_name, after_key, limit).await
    }

    async fn exists(&self, type_name: &str, key: &str) -> StoreResult<bool> {
        self.inner.exists(type_name, key).await
    }

    async fn replace_all(
        &self,
        type_name: &str,
        entities: Vec<Entity>,
    ) -> StoreResult<WriteSummary> {
        self.inner.replace_all(type_name, entities).await
    }

    async fn upsert(&self, type_name: &str, entities: Vec<Entity>) -> StoreResult<WriteSummary> {
        self.inner.upsert(type_name, entities).await
    }
}
