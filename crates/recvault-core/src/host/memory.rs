//! In-memory [`RecordStore`] with fault injection.
//!
//! All types live behind one mutex, so each write call is trivially atomic.
//! Tests can mark a type as failing on read or write to exercise partial
//! snapshots and partial restores.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{RecordStore, StoreError, StoreResult, WriteSummary};
use crate::codec::Entity;

type Tables = BTreeMap<String, BTreeMap<String, Entity>>;

#[derive(Default)]
struct Inner {
    tables: Tables,
    failing_reads: HashSet<String>,
    failing_writes: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }

    /// Insert or overwrite one entity directly, bypassing fault injection.
    pub fn insert(&self, entity: Entity) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner
            .tables
            .entry(entity.type_name.clone())
            .or_default()
            .insert(entity.key.clone(), entity);
        Ok(())
    }

    pub fn get(&self, type_name: &str, key: &str) -> StoreResult<Option<Entity>> {
        let inner = self.lock()?;
        Ok(inner
            .tables
            .get(type_name)
            .and_then(|t| t.get(key))
            .cloned())
    }

    /// All entities of `type_name`, ordered by key.
    pub fn all(&self, type_name: &str) -> StoreResult<Vec<Entity>> {
        let inner = self.lock()?;
        Ok(inner
            .tables
            .get(type_name)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Copy of every table, for before/after comparisons.
    pub fn dump(&self) -> StoreResult<Tables> {
        Ok(self.lock()?.tables.clone())
    }

    pub fn fail_reads_for(&self, type_name: &str) -> StoreResult<()> {
        self.lock()?.failing_reads.insert(type_name.to_string());
        Ok(())
    }

    pub fn fail_writes_for(&self, type_name: &str) -> StoreResult<()> {
        self.lock()?.failing_writes.insert(type_name.to_string());
        Ok(())
    }

    pub fn clear_faults(&self) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.failing_reads.clear();
        inner.failing_writes.clear();
        Ok(())
    }
}

fn check_write(inner: &Inner, type_name: &str, entities: &[Entity]) -> StoreResult<()> {
    if inner.failing_writes.contains(type_name) {
        return Err(StoreError::WriteRejected {
            type_name: type_name.to_string(),
            reason: "injected write failure".to_string(),
        });
    }
    if let Some(stray) = entities.iter().find(|e| e.type_name != type_name) {
        return Err(StoreError::WriteRejected {
            type_name: type_name.to_string(),
            reason: format!("entity {} has type {}", stray.key, stray.type_name),
        });
    }
    Ok(())
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn count(&self, type_name: &str) -> StoreResult<u64> {
        let inner = self.lock()?;
        Ok(inner.tables.get(type_name).map(|t| t.len() as u64).unwrap_or(0))
    }

    async fn read_batch(
        &self,
        type_name: &str,
        after_key: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Entity>> {
        let inner = self.lock()?;
        if inner.failing_reads.contains(type_name) {
            return Err(StoreError::Unavailable(format!(
                "injected read failure for {type_name}"
            )));
        }
        let Some(table) = inner.tables.get(type_name) else {
            return Ok(Vec::new());
        };
        let batch = match after_key {
            Some(after) => table
                .range::<str, _>((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(_, e)| e.clone())
                .collect(),
            None => table.values().take(limit).cloned().collect(),
        };
        Ok(batch)
    }

    async fn exists(&self, type_name: &str, key: &str) -> StoreResult<bool> {
        let inner = self.lock()?;
        Ok(inner
            .tables
            .get(type_name)
            .is_some_and(|t| t.contains_key(key)))
    }

    async fn replace_all(
        &self,
        type_name: &str,
        entities: Vec<Entity>,
    ) -> StoreResult<WriteSummary> {
        let mut inner = self.lock()?;
        check_write(&inner, type_name, &entities)?;

        let table: BTreeMap<String, Entity> =
            entities.into_iter().map(|e| (e.key.clone(), e)).collect();
        let summary = WriteSummary {
            inserted: table.len() as u64,
            updated: 0,
            deleted: inner.tables.get(type_name).map(|t| t.len() as u64).unwrap_or(0),
        };
        if table.is_empty() {
            inner.tables.remove(type_name);
        } else {
            inner.tables.insert(type_name.to_string(), table);
        }
        Ok(summary)
    }

    async fn upsert(&self, type_name: &str, entities: Vec<Entity>) -> StoreResult<WriteSummary> {
        let mut inner = self.lock()?;
        check_write(&inner, type_name, &entities)?;

        let table = inner.tables.entry(type_name.to_string()).or_default();
        let mut summary = WriteSummary::default();
        for entity in entities {
            match table.insert(entity.key.clone(), entity) {
                Some(_) => summary.updated += 1,
                None => summary.inserted += 1,
            }
        }
        Ok(summary)
    }
}
