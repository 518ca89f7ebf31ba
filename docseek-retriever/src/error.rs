//! Storage error taxonomy.

/// Result type for [`StorageAdapter`](crate::storage::StorageAdapter) operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The adapter was used before `initialize()` or after `close()`
    #[error("storage is not initialized")]
    NotInitialized,

    /// A write was attempted while the adapter is read-only
    #[error("storage is read-only")]
    ReadOnly,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// A vector does not match the width of the stored vectors
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The backend could not be opened or its data is unreadable
    #[error("failed to initialize storage at {path}: {message}")]
    Initialization { path: String, message: String },

    #[error("database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn initialization(path: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        Self::Initialization {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}
