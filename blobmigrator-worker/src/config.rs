use std::path::{Path, PathBuf};

use blobmigrator_common::MigrateError;
use serde::Deserialize;

pub const DEFAULT_ROOT_FOLDER: &str = "_blobmigrator_root";
pub const DEFAULT_MAPPING_STORE_NAME: &str = "_blobmigrator_BlobKeyMapping";
const DEFAULT_STATE_DIR: &str = "/var/lib/blobmigrator";

fn default_shard_count() -> u32 { 16 }
fn default_root_folder() -> String { DEFAULT_ROOT_FOLDER.to_string() }
fn default_inline_max() -> u64 { 5 * 1024 * 1024 }
fn default_mapping_store_name() -> String { DEFAULT_MAPPING_STORE_NAME.to_string() }
fn default_buffer_size() -> usize { 1024 * 1024 }
fn default_state_dir() -> PathBuf { PathBuf::from(DEFAULT_STATE_DIR) }
fn default_page_size() -> usize { 200 }
fn default_max_attempts() -> u32 { 3 }

#[derive(Debug, Clone, Deserialize)]
pub struct MigratorConfig {
    /// Partitions used by migration and scrubbing jobs.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Folder prepended to every destination path. May be empty.
    #[serde(default = "default_root_folder")]
    pub destination_root_folder: String,
    /// Blobs at or below this size are copied inline; larger ones are deferred.
    #[serde(default = "default_inline_max")]
    pub inline_transfer_max_bytes: u64,
    /// SQLite table holding mapping entries.
    #[serde(default = "default_mapping_store_name")]
    pub mapping_store_name: String,
    /// Chunk size of the transfer reader; bounds memory per copy.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Running against a simulated destination that re-exposes its objects
    /// as source blobs.
    #[serde(default)]
    pub simulation: bool,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Attempts per shard or deferred job before it is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum SourceConfig {
    Directory { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DestinationConfig {
    Directory {
        path: PathBuf,
    },
    S3 {
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        storage_class: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
    },
}

fn default_region() -> String { "us-east-1".to_string() }

impl MigratorConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: MigratorConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// A config with every tunable at its default.
    pub fn new(source: SourceConfig, destination: DestinationConfig) -> Self {
        Self {
            shard_count: default_shard_count(),
            destination_root_folder: default_root_folder(),
            inline_transfer_max_bytes: default_inline_max(),
            mapping_store_name: default_mapping_store_name(),
            buffer_size: default_buffer_size(),
            simulation: false,
            state_dir: default_state_dir(),
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            source,
            destination,
        }
    }

    pub fn validate(&self) -> Result<(), MigrateError> {
        if self.shard_count == 0 {
            return Err(MigrateError::Configuration("shard_count must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(MigrateError::Configuration("buffer_size must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(MigrateError::Configuration("page_size must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(MigrateError::Configuration("max_attempts must be at least 1".into()));
        }
        if !is_identifier(&self.mapping_store_name) {
            return Err(MigrateError::Configuration(format!(
                "mapping_store_name must be a plain identifier: {:?}",
                self.mapping_store_name
            )));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("migrator.db")
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
[source]
backend = "directory"
path = "/srv/blobs"

[destination]
backend = "directory"
path = "/srv/objects"
"#;
        let config: MigratorConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.destination_root_folder, "_blobmigrator_root");
        assert_eq!(config.inline_transfer_max_bytes, 5 * 1024 * 1024);
        assert_eq!(config.mapping_store_name, "_blobmigrator_BlobKeyMapping");
        assert!(!config.simulation);
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/blobmigrator/migrator.db"));
    }

    #[test]
    fn test_parse_s3_destination() {
        let toml_str = r#"
shard_count = 4
destination_root_folder = ""
inline_transfer_max_bytes = 1000

[source]
backend = "directory"
path = "/srv/blobs"

[destination]
backend = "s3"
endpoint = "http://localhost:9000"
"#;
        let config: MigratorConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.destination_root_folder, "");
        match config.destination {
            DestinationConfig::S3 { region, endpoint, .. } => {
                assert_eq!(region, "us-east-1");
                assert_eq!(endpoint.as_deref(), Some("http://localhost:9000"));
            }
            other => panic!("unexpected destination {:?}", other),
        }
    }

    #[test]
    fn test_zero_shards_rejected() {
        let mut config = MigratorConfig::new(
            SourceConfig::Directory { path: "/a".into() },
            DestinationConfig::Directory { path: "/b".into() },
        );
        config.shard_count = 0;
        assert!(matches!(config.validate(), Err(MigrateError::Configuration(_))));
    }

    #[test]
    fn test_mapping_store_name_must_be_identifier() {
        let mut config = MigratorConfig::new(
            SourceConfig::Directory { path: "/a".into() },
            DestinationConfig::Directory { path: "/b".into() },
        );
        config.mapping_store_name = "mappings; DROP TABLE jobs".into();
        assert!(config.validate().is_err());
        config.mapping_store_name = "blob_mappings_2".into();
        assert!(config.validate().is_ok());
        assert!(!is_identifier(""));
        assert!(!is_identifier("1abc"));
    }
}
