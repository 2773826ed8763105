/// Errors raised by the migration and scrubbing engines.
///
/// Adapters speak `anyhow`; the engine folds their failures into the
/// categories below so callers can decide what is skippable and what is not.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A required argument was missing or malformed. Never retried.
    #[error("validation error: {0}")]
    Validation(String),
    /// The configuration cannot satisfy the request.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The source blob vanished between enumeration and processing.
    #[error("blob not found: {0}")]
    NotFound(String),
    /// The destination (or source read) failed for this blob.
    #[error("transfer failed for {blob_id}: {source}")]
    Transfer {
        blob_id: String,
        #[source]
        source: anyhow::Error,
    },
    /// The caller passed an identifier of an unsupported shape.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    pub fn transfer(blob_id: impl Into<String>, source: anyhow::Error) -> Self {
        MigrateError::Transfer {
            blob_id: blob_id.into(),
            source,
        }
    }

    /// True for errors the shard loop counts and moves past.
    pub fn is_skippable(&self) -> bool {
        matches!(self, MigrateError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_not_found_is_skippable() {
        assert!(MigrateError::NotFound("abc".into()).is_skippable());
        assert!(!MigrateError::Validation("x".into()).is_skippable());
        assert!(!MigrateError::transfer("abc", anyhow::anyhow!("quota")).is_skippable());
        assert!(!MigrateError::TypeMismatch("123".into()).is_skippable());
    }

    #[test]
    fn test_transfer_message_names_blob() {
        let err = MigrateError::transfer("blob-1", anyhow::anyhow!("HTTP 403"));
        let msg = err.to_string();
        assert!(msg.contains("blob-1"));
        assert!(msg.contains("HTTP 403"));
    }
}
