pub mod blob;
pub mod error;
pub mod naming;
pub mod partition;
pub mod store;

pub use blob::{BlobDescriptor, BlobRef, MappingEntry, MigrationCounters, MigrationOutcome, ShardCursor};
pub use error::{MigrateError, Result};
pub use partition::Partition;
