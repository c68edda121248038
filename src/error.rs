//! Error types for the table cache
//!
//! `StorageError` describes failures reported by the storage collaborator.
//! `CacheError` is what the cache surfaces to its callers; it wraps the
//! storage cause for construction and release failures.

use thiserror::Error;

/// Failure reported by the storage backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Network, cluster or filesystem failure
    #[error("I/O error: {0}")]
    Io(String),

    /// The resource exists but can no longer be used (e.g. torn down externally)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The requested instance or table does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Main error type for cache operations
///
/// Cloneable so a single in-flight construction failure can be handed to
/// every caller waiting on the same key.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Opening an instance, table or reader failed. Never cached.
    #[error("Failed to open {resource}: {source}")]
    Construction {
        resource: String,
        #[source]
        source: StorageError,
    },

    /// The owning cache has been stopped and refuses to load new resources
    #[error("Cache for instance {instance} is closed")]
    Closed { instance: String },

    /// Releasing a handle failed
    #[error("Failed to release {resource}: {source}")]
    Release {
        resource: String,
        #[source]
        source: StorageError,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub(crate) fn construction(resource: impl Into<String>, source: StorageError) -> Self {
        CacheError::Construction {
            resource: resource.into(),
            source,
        }
    }

    pub(crate) fn closed(instance: impl Into<String>) -> Self {
        CacheError::Closed {
            instance: instance.into(),
        }
    }

    /// True if the cache is shutting down rather than the backend failing
    pub fn is_closed(&self) -> bool {
        matches!(self, CacheError::Closed { .. })
    }

    /// True if a resource could not be opened
    pub fn is_construction(&self) -> bool {
        matches!(self, CacheError::Construction { .. })
    }

    /// HTTP status code equivalent for the REST boundary
    pub fn status_code(&self) -> u16 {
        match self {
            CacheError::Construction { .. } => 503,
            CacheError::Closed { .. } => 410,
            CacheError::Release { .. } | CacheError::Config(_) => 500,
        }
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Result type alias for storage backend operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;
