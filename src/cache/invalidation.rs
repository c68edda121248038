//! Removal causes and the release hook
//!
//! Every path that takes an entry out of a cache ends in [`release_quietly`]:
//! the handle is released, and a failure is logged rather than returned so
//! that one stuck resource never blocks the teardown of the others.

use crate::cache::types::CacheKey;
use crate::storage::Resource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Reason an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovalCause {
    /// Not accessed within the idle window
    Expired,

    /// Invalidated by key
    Explicit,

    /// Removed while the owning cache was being stopped
    Teardown,
}

impl std::fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalCause::Expired => write!(f, "idle timeout"),
            RemovalCause::Explicit => write!(f, "explicit invalidation"),
            RemovalCause::Teardown => write!(f, "teardown"),
        }
    }
}

/// Record of a batch removal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalEvent {
    /// Why the entries were removed
    pub cause: RemovalCause,

    /// Keys removed, in key order
    pub keys: Vec<CacheKey>,

    /// Number of handles whose release failed
    pub release_failures: usize,

    /// When the removal happened
    pub timestamp: DateTime<Utc>,
}

impl RemovalEvent {
    pub fn new(cause: RemovalCause, keys: Vec<CacheKey>) -> Self {
        Self {
            cause,
            keys,
            release_failures: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Release a handle, logging instead of propagating failure.
///
/// Returns `true` if the handle was released cleanly.
pub async fn release_quietly<H: Resource>(
    handle: &H,
    key: &str,
    cause: RemovalCause,
) -> bool {
    match handle.release().await {
        Ok(()) => {
            debug!("Released {} (key: {}, cause: {})", handle, key, cause);
            true
        }
        Err(e) => {
            warn!(
                "Unable to release {} (key: {}, cause: {}): {}",
                handle, key, cause, e
            );
            false
        }
    }
}
