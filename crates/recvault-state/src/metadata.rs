//! Typed job metadata.
//!
//! Job rows carry a schemaless metadata column so new kinds of annotation can
//! be added without a schema migration. In Rust the column is modelled as a
//! list of tagged [`MetadataEntry`] values with typed accessors on
//! [`JobMetadata`]. Rows written by older releases may hold a flat object or
//! entries with an unknown tag; those are mapped to the closest known entry
//! or to [`MetadataEntry::Unknown`] instead of failing the whole row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::storage_traits::BackupKind;

/// A single entity type that could not be read during a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub type_name: String,
    pub error: String,
}

/// Outcome of one integrity verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationInfo {
    pub verified_at: DateTime<Utc>,
    pub passed: bool,
    pub expected: String,
    pub actual: String,
}

/// One annotation attached to a backup job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataEntry {
    /// Quick run: these types were deliberately omitted.
    QuickBackup { skipped_types: Vec<String> },
    /// Types that failed to read and were skipped.
    SourceErrors { failures: Vec<SourceFailure> },
    Verification(VerificationInfo),
    /// Records upgraded from an older schema version while decoding.
    Migration {
        from_version: u32,
        to_version: u32,
        records: u64,
    },
    /// The artifact was ingested through the upload gateway.
    Upload {
        description: Option<String>,
        declared_kind: BackupKind,
    },
    Timeout {
        elapsed_seconds: f64,
        budget_seconds: u64,
    },
    /// Forced to failed by the stuck-job sweep.
    StuckCleanup {
        elapsed_seconds: f64,
        threshold_minutes: u64,
    },
    /// A restore was executed from this job's artifact.
    Restore {
        attempt_id: String,
        strategy: String,
        status: String,
        at: DateTime<Utc>,
    },
    #[serde(other)]
    Unknown,
}

/// Ordered metadata list for a job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetadata {
    entries: Vec<MetadataEntry>,
}

impl JobMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<MetadataEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: MetadataEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = MetadataEntry>) {
        self.entries.extend(entries);
    }

    /// Types omitted by a quick run.
    pub fn skipped_types(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                MetadataEntry::QuickBackup { skipped_types } => Some(skipped_types),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Types that failed to read during the snapshot.
    pub fn source_failures(&self) -> Vec<&SourceFailure> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                MetadataEntry::SourceErrors { failures } => Some(failures),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Most recent verification, by `verified_at`.
    pub fn latest_verification(&self) -> Option<&VerificationInfo> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                MetadataEntry::Verification(info) => Some(info),
                _ => None,
            })
            .max_by_key(|info| info.verified_at)
    }

    /// Whether this row records an upload ingestion rather than a backup run.
    pub fn was_uploaded(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, MetadataEntry::Upload { .. }))
    }

    /// Whether the sweep forced this job to failed.
    pub fn was_swept(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, MetadataEntry::StuckCleanup { .. }))
    }

    pub fn timed_out(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, MetadataEntry::Timeout { .. }))
    }

    /// Decode the stored column, tolerating legacy shapes.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::default(),
            serde_json::Value::Array(items) => Self {
                entries: items.into_iter().map(parse_entry).collect(),
            },
            serde_json::Value::Object(map) => Self {
                entries: parse_legacy_object(map),
            },
            _ => Self {
                entries: vec![MetadataEntry::Unknown],
            },
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.entries).unwrap_or(serde_json::Value::Array(Vec::new()))
    }
}

fn parse_entry(value: serde_json::Value) -> MetadataEntry {
    serde_json::from_value(value).unwrap_or(MetadataEntry::Unknown)
}

/// Older rows stored a single flat object such as
/// `{"quick_backup": true, "skipped_models": [...]}`.
fn parse_legacy_object(map: serde_json::Map<String, serde_json::Value>) -> Vec<MetadataEntry> {
    if map.contains_key("kind") {
        return vec![parse_entry(serde_json::Value::Object(map))];
    }

    let mut entries = Vec::new();
    let skipped = map
        .get("skipped_types")
        .or_else(|| map.get("skipped_models"))
        .and_then(|v| v.as_array());
    if let Some(skipped) = skipped {
        entries.push(MetadataEntry::QuickBackup {
            skipped_types: skipped
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        });
    }

    let verified_at = map
        .get("verified_at")
        .or_else(|| map.get("last_verified"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
    if let Some(verified_at) = verified_at {
        let passed = map
            .get("verification_passed")
            .or_else(|| map.get("passed"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let text = |key: &str| {
            map.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        entries.push(MetadataEntry::Verification(VerificationInfo {
            verified_at: verified_at.with_timezone(&Utc),
            passed,
            expected: text("expected_checksum"),
            actual: text("actual_checksum"),
        }));
    }

    if entries.is_empty() && !map.is_empty() {
        entries.push(MetadataEntry::Unknown);
    }
    entries
}

impl Serialize for JobMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JobMetadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(Self::from_value(raw.unwrap_or(serde_json::Value::Null)))
    }
}
