//! JSON-lines record store on local disk, used by the CLI.
//!
//! Tables are parsed once and cached; a cached table is reused while the
//! file's size and modification time are unchanged, so paging through a
//! snapshot reads each file once.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use tempfile::NamedTempFile;

use super::{RecordStore, StoreError, StoreResult, WriteSummary};
use crate::codec::Entity;

/// Filesystem-backed record store: one JSON-lines file per entity type.
///
/// Layout: `<root>/<type_name>.jsonl`, one entity per line, sorted by key.
/// Every write rewrites the whole file through a temp file in the same
/// directory and renames it into place.
pub struct FsRecordStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    cache: Mutex<HashMap<String, CachedTable>>,
}

type Table = BTreeMap<String, Entity>;

struct CachedTable {
    stamp: FileStamp,
    table: Arc<Table>,
}

/// Identity of a table file's contents as seen through its metadata.
#[derive(Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

impl FsRecordStore {
    /// Create a store rooted at `root`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, type_name: &str) -> StoreResult<PathBuf> {
        let valid = !type_name.is_empty()
            && type_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::UnknownType {
                type_name: type_name.to_string(),
            });
        }
        Ok(self.root.join(format!("{type_name}.jsonl")))
    }

    fn load(&self, type_name: &str) -> StoreResult<Arc<Table>> {
        let path = self.table_path(type_name)?;
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.cache_guard()?.remove(type_name);
                return Ok(Arc::new(Table::new()));
            }
            Err(e) => return Err(e.into()),
        };
        let stamp = FileStamp::of(&file.metadata()?);
        if let Some(cached) = self.cache_guard()?.get(type_name) {
            if cached.stamp == stamp {
                return Ok(Arc::clone(&cached.table));
            }
        }

        let mut table = Table::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entity: Entity = serde_json::from_str(&line)?;
            table.insert(entity.key.clone(), entity);
        }
        let table = Arc::new(table);
        self.cache_guard()?.insert(
            type_name.to_string(),
            CachedTable {
                stamp,
                table: Arc::clone(&table),
            },
        );
        Ok(table)
    }

    fn cache_guard(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, CachedTable>>> {
        self.cache
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("cache lock poisoned: {e}")))
    }

    fn store(&self, type_name: &str, table: Table) -> StoreResult<()> {
        let path = self.table_path(type_name)?;
        let tmp = NamedTempFile::new_in(&self.root)?;
        let mut out = BufWriter::new(tmp);
        for entity in table.values() {
            serde_json::to_writer(&mut out, entity)?;
            out.write_all(b"\n")?;
        }
        let tmp = out.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        let file = tmp.persist(&path).map_err(|e| e.error)?;
        let stamp = FileStamp::of(&file.metadata()?);
        self.cache_guard()?.insert(
            type_name.to_string(),
            CachedTable {
                stamp,
                table: Arc::new(table),
            },
        );
        Ok(())
    }

    fn write_guard(&self) -> StoreResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }
}

fn check_types(type_name: &str, entities: &[Entity]) -> StoreResult<()> {
    match entities.iter().find(|e| e.type_name != type_name) {
        Some(stray) => Err(StoreError::WriteRejected {
            type_name: type_name.to_string(),
            reason: format!("entity {} has type {}", stray.key, stray.type_name),
        }),
        None => Ok(()),
    }
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn count(&self, type_name: &str) -> StoreResult<u64> {
        Ok(self.load(type_name)?.len() as u64)
    }

    async fn read_batch(
        &self,
        type_name: &str,
        after_key: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Entity>> {
        let table = self.load(type_name)?;
        let start = match after_key {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        Ok(table
            .range::<str, _>((start, Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn exists(&self, type_name: &str, key: &str) -> StoreResult<bool> {
        Ok(self.load(type_name)?.contains_key(key))
    }

    async fn replace_all(
        &self,
        type_name: &str,
        entities: Vec<Entity>,
    ) -> StoreResult<WriteSummary> {
        check_types(type_name, &entities)?;
        let _guard = self.write_guard()?;
        let deleted = self.load(type_name)?.len() as u64;
        let table: Table = entities.into_iter().map(|e| (e.key.clone(), e)).collect();
        let inserted = table.len() as u64;
        self.store(type_name, table)?;
        Ok(WriteSummary {
            inserted,
            updated: 0,
            deleted,
        })
    }

    async fn upsert(&self, type_name: &str, entities: Vec<Entity>) -> StoreResult<WriteSummary> {
        check_types(type_name, &entities)?;
        let _guard = self.write_guard()?;
        let mut table = Table::clone(&*self.load(type_name)?);
        let mut summary = WriteSummary::default();
        for entity in entities {
            match table.insert(entity.key.clone(), entity) {
                Some(_) => summary.updated += 1,
                None => summary.inserted += 1,
            }
        }
        self.store(type_name, table)?;
        Ok(summary)
    }
}
