//! Portable record encoding.
//!
//! [`encode`] turns a live [`Entity`] into a [`SerializedRecord`]: primitive
//! values pass through, timestamps are normalised to UTC RFC 3339 with
//! microsecond precision, binary fields become `media:<path>` tokens and
//! references keep only the target's natural key. [`Codec::decode`] runs the
//! reverse, migrating older records first and returning references as
//! deferred lookups instead of resolving them.

pub mod migrate;

use std::collections::BTreeMap;
use std::path::{Component, Path};

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::EntityTypeDescriptor;
pub use migrate::{MigrationFn, MigrationRegistry};

/// Version written into every record and artifact header.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Oldest version a registered migration chain can lift to current.
pub const MIN_SCHEMA_VERSION: u32 = 1;

/// Prefix of binary-field tokens.
pub const MEDIA_TOKEN_PREFIX: &str = "media:";

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("entity of type {type_name} has an empty natural key")]
    EmptyKey { type_name: String },

    #[error("field {field} holds a non-finite float")]
    NonFiniteFloat { field: String },

    #[error("field {field} has an invalid media path: {path}")]
    InvalidMediaPath { field: String, path: String },

    #[error("field {field} has an invalid binary token: {token}")]
    InvalidBinaryToken { field: String, token: String },

    #[error("field {field} has an invalid timestamp {value}: {reason}")]
    InvalidTimestamp {
        field: String,
        value: String,
        reason: String,
    },

    #[error("record type {found} does not match descriptor {expected}")]
    TypeMismatch { expected: String, found: String },

    #[error("schema version {found} is not supported (current {current})")]
    UnsupportedSchemaVersion { found: u32, current: u32 },

    #[error("no migration registered from schema version {from}")]
    MissingMigration { from: u32 },
}

/// Pointer to another entity by type and natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub type_name: String,
    pub key: String,
}

impl EntityRef {
    pub fn new(type_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.type_name, self.key)
    }
}

/// Value of one field on a live entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<FixedOffset>),
    /// Path of a media file relative to the media root.
    Binary(String),
    Reference(EntityRef),
}

/// A live record as seen by the host store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub type_name: String,
    pub key: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    pub fn new(type_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.type_name.clone(), self.key.clone())
    }

    /// Outgoing references as `(field, target)` pairs.
    pub fn references(&self) -> impl Iterator<Item = (&str, &EntityRef)> {
        self.fields.iter().filter_map(|(name, value)| match value {
            FieldValue::Reference(target) => Some((name.as_str(), target)),
            _ => None,
        })
    }
}

/// Portable form of one field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum RecordValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// UTC, RFC 3339, microseconds, `Z` suffix.
    Timestamp(String),
    /// `media:<relative path>`
    Binary(String),
    Ref(EntityRef),
}

/// Portable form of one entity, one line of an artifact's records file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedRecord {
    pub type_name: String,
    pub key: String,
    pub schema_version: u32,
    pub fields: BTreeMap<String, RecordValue>,
}

/// A reference left unresolved by decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredRef {
    pub field: String,
    pub target: EntityRef,
}

/// Decoded record: the entity to write plus the references to check first.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstructionArgs {
    pub entity: Entity,
    pub deferred: Vec<DeferredRef>,
    /// Original schema version when a migration ran.
    pub migrated_from: Option<u32>,
}

/// Canonical text form of a timestamp.
pub fn canonical_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse any RFC 3339 timestamp and return it normalised to UTC.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<FixedOffset>, CodecError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc).fixed_offset())
        .map_err(|e| CodecError::InvalidTimestamp {
            field: field.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

fn check_media_path(field: &str, path: &str) -> Result<(), CodecError> {
    let p = Path::new(path);
    let bad = path.is_empty()
        || p.is_absolute()
        || p
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if bad {
        return Err(CodecError::InvalidMediaPath {
            field: field.to_string(),
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Encode a live entity at the current schema version.
pub fn encode(entity: &Entity) -> Result<SerializedRecord, CodecError> {
    if entity.key.is_empty() {
        return Err(CodecError::EmptyKey {
            type_name: entity.type_name.clone(),
        });
    }
    let mut fields = BTreeMap::new();
    for (name, value) in &entity.fields {
        let encoded = match value {
            FieldValue::Null => RecordValue::Null,
            FieldValue::Bool(b) => RecordValue::Bool(*b),
            FieldValue::Int(i) => RecordValue::Int(*i),
            FieldValue::Float(f) => {
                if !f.is_finite() {
                    return Err(CodecError::NonFiniteFloat { field: name.clone() });
                }
                RecordValue::Float(*f)
            }
            FieldValue::Text(s) => RecordValue::Text(s.clone()),
            FieldValue::Timestamp(ts) => RecordValue::Timestamp(canonical_timestamp(ts)),
            FieldValue::Binary(path) => {
                let normalized = path.replace('\\', "/");
                check_media_path(name, &normalized)?;
                RecordValue::Binary(format!("{MEDIA_TOKEN_PREFIX}{normalized}"))
            }
            FieldValue::Reference(target) => RecordValue::Ref(target.clone()),
        };
        fields.insert(name.clone(), encoded);
    }
    Ok(SerializedRecord {
        type_name: entity.type_name.clone(),
        key: entity.key.clone(),
        schema_version: CURRENT_SCHEMA_VERSION,
        fields,
    })
}

/// Encoder/decoder bound to a set of schema migrations.
#[derive(Debug, Clone)]
pub struct Codec {
    migrations: MigrationRegistry,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(MigrationRegistry::with_defaults())
    }
}

impl Codec {
    pub fn new(migrations: MigrationRegistry) -> Self {
        Self { migrations }
    }

    pub fn encode(&self, entity: &Entity) -> Result<SerializedRecord, CodecError> {
        encode(entity)
    }

    pub fn migrations(&self) -> &MigrationRegistry {
        &self.migrations
    }

    /// Migrate `record` to the current version and decode it against
    /// `descriptor`. References are returned in `deferred`, not looked up.
    pub fn decode(
        &self,
        record: SerializedRecord,
        descriptor: &EntityTypeDescriptor,
    ) -> Result<ConstructionArgs, CodecError> {
        if record.type_name != descriptor.type_name {
            return Err(CodecError::TypeMismatch {
                expected: descriptor.type_name.clone(),
                found: record.type_name,
            });
        }
        if record.key.is_empty() {
            return Err(CodecError::EmptyKey {
                type_name: record.type_name,
            });
        }
        let original = record.schema_version;
        let record = self.migrations.migrate(record)?;
        let migrated_from = (original != record.schema_version).then_some(original);

        let mut entity = Entity::new(record.type_name, record.key);
        let mut deferred = Vec::new();
        for (name, value) in record.fields {
            let decoded = match value {
                RecordValue::Null => FieldValue::Null,
                RecordValue::Bool(b) => FieldValue::Bool(b),
                RecordValue::Int(i) => FieldValue::Int(i),
                RecordValue::Float(f) => FieldValue::Float(f),
                RecordValue::Text(s) => FieldValue::Text(s),
                RecordValue::Timestamp(raw) => FieldValue::Timestamp(parse_timestamp(&name, &raw)?),
                RecordValue::Binary(token) => {
                    let path = token
                        .strip_prefix(MEDIA_TOKEN_PREFIX)
                        .ok_or_else(|| CodecError::InvalidBinaryToken {
                            field: name.clone(),
                            token: token.clone(),
                        })?;
                    check_media_path(&name, path)?;
                    FieldValue::Binary(path.to_string())
                }
                RecordValue::Ref(target) => {
                    deferred.push(DeferredRef {
                        field: name.clone(),
                        target: target.clone(),
                    });
                    FieldValue::Reference(target)
                }
            };
            entity.fields.insert(name, decoded);
        }

        Ok(ConstructionArgs {
            entity,
            deferred,
            migrated_from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit() -> Entity {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T09:30:00.123456+02:00").unwrap();
        Entity::new("visit", "v-1")
            .with_field("seen_at", FieldValue::Timestamp(ts))
            .with_field("scan", FieldValue::Binary("scans/v-1.png".into()))
            .with_field("patient", FieldValue::Reference(EntityRef::new("patient", "p-7")))
            .with_field("weight", FieldValue::Float(71.5))
            .with_field("notes", FieldValue::Null)
    }

    #[test]
    fn encode_normalises_timestamps_to_utc() {
        let record = encode(&visit()).unwrap();
        assert_eq!(
            record.fields["seen_at"],
            RecordValue::Timestamp("2024-03-01T07:30:00.123456Z".into())
        );
        assert_eq!(record.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn encode_tokenises_binary_and_keeps_reference_key() {
        let record = encode(&visit()).unwrap();
        assert_eq!(
            record.fields["scan"],
            RecordValue::Binary("media:scans/v-1.png".into())
        );
        assert_eq!(
            record.fields["patient"],
            RecordValue::Ref(EntityRef::new("patient", "p-7"))
        );
    }

    #[test]
    fn decode_defers_references() {
        let codec = Codec::default();
        let record = encode(&visit()).unwrap();
        let args = codec
            .decode(record, &EntityTypeDescriptor::new("visit"))
            .unwrap();

        assert_eq!(args.deferred.len(), 1);
        assert_eq!(args.deferred[0].field, "patient");
        assert_eq!(args.deferred[0].target, EntityRef::new("patient", "p-7"));
        assert_eq!(args.migrated_from, None);
        assert_eq!(
            args.entity.field("scan"),
            Some(&FieldValue::Binary("scans/v-1.png".into()))
        );
    }

    #[test]
    fn decoded_timestamp_is_same_instant() {
        let codec = Codec::default();
        let original = visit();
        let args = codec
            .decode(encode(&original).unwrap(), &EntityTypeDescriptor::new("visit"))
            .unwrap();
        match (original.field("seen_at"), args.entity.field("seen_at")) {
            (Some(FieldValue::Timestamp(a)), Some(FieldValue::Timestamp(b))) => assert_eq!(a, b),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn encode_rejects_escaping_media_path() {
        let e = Entity::new("visit", "v-2").with_field("scan", FieldValue::Binary("../etc/passwd".into()));
        assert!(matches!(encode(&e), Err(CodecError::InvalidMediaPath { .. })));

        let e = Entity::new("visit", "v-3").with_field("scan", FieldValue::Binary("/abs.png".into()));
        assert!(matches!(encode(&e), Err(CodecError::InvalidMediaPath { .. })));
    }

    #[test]
    fn encode_rejects_empty_key_and_nan() {
        assert!(matches!(
            encode(&Entity::new("visit", "")),
            Err(CodecError::EmptyKey { .. })
        ));
        let e = Entity::new("visit", "v").with_field("w", FieldValue::Float(f64::NAN));
        assert!(matches!(encode(&e), Err(CodecError::NonFiniteFloat { .. })));
    }

    #[test]
    fn decode_rejects_type_mismatch() {
        let codec = Codec::default();
        let err = codec
            .decode(encode(&visit()).unwrap(), &EntityTypeDescriptor::new("patient"))
            .unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[test]
    fn decode_rejects_newer_schema() {
        let codec = Codec::default();
        let mut record = encode(&visit()).unwrap();
        record.schema_version = CURRENT_SCHEMA_VERSION + 1;
        let err = codec
            .decode(record, &EntityTypeDescriptor::new("visit"))
            .unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedSchemaVersion { .. }));
    }

    #[test]
    fn record_line_json_shape() {
        let record = encode(&Entity::new("patient", "p-1").with_field("active", FieldValue::Bool(true))).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["fields"]["active"]["t"], "bool");
        assert_eq!(json["fields"]["active"]["v"], true);
    }
}
