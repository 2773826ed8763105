pub mod directory;
pub mod s3;

use std::sync::Arc;

use anyhow::bail;
use blobmigrator_common::store::DestinationStore;

use self::directory::DirectoryDestination;
use self::s3::{S3Config, S3Destination};
use crate::config::DestinationConfig;

/// Construct the destination store described by the `[destination]` table.
///
/// S3 credentials fall back to `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
/// when the config leaves them out.
pub fn from_config(config: &DestinationConfig) -> anyhow::Result<Arc<dyn DestinationStore>> {
    match config {
        DestinationConfig::Directory { path } => Ok(Arc::new(DirectoryDestination::new(path))),
        DestinationConfig::S3 {
            region,
            endpoint,
            storage_class,
            access_key_id,
            secret_access_key,
        } => {
            let access_key_id = access_key_id
                .clone()
                .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
                .unwrap_or_default();
            let secret_access_key = secret_access_key
                .clone()
                .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
                .unwrap_or_default();

            if access_key_id.is_empty() || secret_access_key.is_empty() {
                bail!("S3 credentials not found for destination");
            }

            Ok(Arc::new(S3Destination::new(S3Config {
                region: region.clone(),
                endpoint: endpoint.clone(),
                access_key_id,
                secret_access_key,
                storage_class: storage_class.clone(),
            })?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_with_inline_credentials() {
        let config = DestinationConfig::S3 {
            region: "eu-west-1".into(),
            endpoint: Some("http://localhost:9000".into()),
            storage_class: None,
            access_key_id: Some("key".into()),
            secret_access_key: Some("secret".into()),
        };
        assert!(from_config(&config).is_ok());
    }

    #[test]
    fn test_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = DestinationConfig::Directory { path: dir.path().to_path_buf() };
        let store = from_config(&config).unwrap();
        assert!(store.validate_container_name("my-bucket").is_ok());
    }
}
