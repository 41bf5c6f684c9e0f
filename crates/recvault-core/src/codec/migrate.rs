//! Forward-only migration of serialized records between schema versions.
//!
//! A migration is registered for each `from` version and lifts a record to
//! `from + 1`. Migrating applies the chain in order until the record reaches
//! [`CURRENT_SCHEMA_VERSION`].

use std::collections::BTreeMap;

use super::{
    canonical_timestamp, parse_timestamp, CodecError, RecordValue, SerializedRecord,
    CURRENT_SCHEMA_VERSION, MEDIA_TOKEN_PREFIX, MIN_SCHEMA_VERSION,
};

/// One step: takes a record at version `n`, returns it at `n + 1`.
pub type MigrationFn = fn(SerializedRecord) -> Result<SerializedRecord, CodecError>;

#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    steps: BTreeMap<u32, MigrationFn>,
}

impl MigrationRegistry {
    /// Registry with no steps; only current-version records decode.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in step.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(1, v1_to_v2);
        registry
    }

    pub fn register(&mut self, from: u32, step: MigrationFn) {
        self.steps.insert(from, step);
    }

    /// Apply registered steps until the record is at the current version.
    pub fn migrate(&self, mut record: SerializedRecord) -> Result<SerializedRecord, CodecError> {
        if record.schema_version > CURRENT_SCHEMA_VERSION || record.schema_version < MIN_SCHEMA_VERSION
        {
            return Err(CodecError::UnsupportedSchemaVersion {
                found: record.schema_version,
                current: CURRENT_SCHEMA_VERSION,
            });
        }
        while record.schema_version < CURRENT_SCHEMA_VERSION {
            let from = record.schema_version;
            let step = self
                .steps
                .get(&from)
                .ok_or(CodecError::MissingMigration { from })?;
            record = step(record)?;
            record.schema_version = from + 1;
        }
        Ok(record)
    }
}

/// Version 1 stored timestamps and media paths as prefixed text
/// (`ts:<rfc3339>` and `file:<path>`).
fn v1_to_v2(mut record: SerializedRecord) -> Result<SerializedRecord, CodecError> {
    for (name, value) in record.fields.iter_mut() {
        let RecordValue::Text(text) = value else {
            continue;
        };
        if let Some(raw) = text.strip_prefix("ts:") {
            let ts = parse_timestamp(name, raw)?;
            *value = RecordValue::Timestamp(canonical_timestamp(&ts));
        } else if let Some(path) = text.strip_prefix("file:") {
            *value = RecordValue::Binary(format!("{MEDIA_TOKEN_PREFIX}{path}"));
        }
    }
    Ok(record)
}
