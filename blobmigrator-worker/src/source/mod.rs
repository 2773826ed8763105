pub mod directory;

use std::sync::Arc;

use blobmigrator_common::store::SourceStore;

use self::directory::DirectorySource;
use crate::config::SourceConfig;

/// Construct the source store described by the `[source]` table.
pub fn from_config(config: &SourceConfig) -> anyhow::Result<Arc<dyn SourceStore>> {
    match config {
        SourceConfig::Directory { path } => {
            if !path.is_dir() {
                anyhow::bail!("source directory {} does not exist", path.display());
            }
            Ok(Arc::new(DirectorySource::new(path)))
        }
    }
}
