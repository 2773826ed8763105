use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// One object in the legacy source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub id: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Either a bare source id or a full descriptor. Job parameters and
/// operator input arrive in both shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobRef {
    Raw(String),
    Descriptor(BlobDescriptor),
}

impl BlobRef {
    pub fn id(&self) -> &str {
        match self {
            BlobRef::Raw(id) => id,
            BlobRef::Descriptor(d) => &d.id,
        }
    }

    /// Decode a loosely-typed job parameter.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(id) => Ok(BlobRef::Raw(id.clone())),
            serde_json::Value::Object(_) => serde_json::from_value(value.clone())
                .map(BlobRef::Descriptor)
                .map_err(|e| MigrateError::TypeMismatch(format!("not a blob descriptor: {e}"))),
            other => Err(MigrateError::TypeMismatch(format!(
                "expected a blob id or descriptor, got {other}"
            ))),
        }
    }
}

impl From<BlobDescriptor> for BlobRef {
    fn from(d: BlobDescriptor) -> Self {
        BlobRef::Descriptor(d)
    }
}

impl From<&str> for BlobRef {
    fn from(id: &str) -> Self {
        BlobRef::Raw(id.to_string())
    }
}

impl From<String> for BlobRef {
    fn from(id: String) -> Self {
        BlobRef::Raw(id)
    }
}

/// Durable proof that `old_id` has been migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub old_id: String,
    pub destination_path: String,
    pub new_id: String,
}

/// Resume point of a chunked read over one blob.
///
/// Serialized as `{"source_id": .., "current_offset": .., "end_offset": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCursor {
    pub source_id: String,
    pub current_offset: u64,
    pub end_offset: u64,
}

impl ShardCursor {
    /// A cursor covering the whole blob.
    pub fn for_blob(descriptor: &BlobDescriptor) -> Self {
        Self {
            source_id: descriptor.id.clone(),
            current_offset: 0,
            end_offset: descriptor.size,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_offset > self.end_offset
    }

    pub fn to_json(&self) -> String {
        // A struct of plain fields always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| MigrateError::Validation(format!("bad cursor: {e}")))
    }
}

/// What `migrate_one` did with a blob. Only ever counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    SkippedAlreadyMigrated,
    SkippedSimulatedArtifact,
    MigratedInline,
    MigratedViaDeferredJob,
}

/// Named counters reported by a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCounters {
    pub considered: u64,
    pub skipped_already_migrated: u64,
    pub skipped_simulated_artifact: u64,
    pub skipped_not_found: u64,
    pub migrated_inline: u64,
    pub migrated_deferred: u64,
    pub migrated: u64,
    pub failed: u64,
}

impl MigrationCounters {
    pub fn record(&mut self, outcome: MigrationOutcome) {
        self.considered += 1;
        match outcome {
            MigrationOutcome::SkippedAlreadyMigrated => self.skipped_already_migrated += 1,
            MigrationOutcome::SkippedSimulatedArtifact => self.skipped_simulated_artifact += 1,
            MigrationOutcome::MigratedInline => {
                self.migrated_inline += 1;
                self.migrated += 1;
            }
            MigrationOutcome::MigratedViaDeferredJob => {
                self.migrated_deferred += 1;
                self.migrated += 1;
            }
        }
    }

    pub fn record_not_found(&mut self) {
        self.considered += 1;
        self.skipped_not_found += 1;
    }

    pub fn record_failure(&mut self) {
        self.considered += 1;
        self.failed += 1;
    }

    pub fn merge(&mut self, other: &MigrationCounters) {
        self.considered += other.considered;
        self.skipped_already_migrated += other.skipped_already_migrated;
        self.skipped_simulated_artifact += other.skipped_simulated_artifact;
        self.skipped_not_found += other.skipped_not_found;
        self.migrated_inline += other.migrated_inline;
        self.migrated_deferred += other.migrated_deferred;
        self.migrated += other.migrated;
        self.failed += other.failed;
    }
}
