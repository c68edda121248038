//! Cache entry management with idle-time tracking

use crate::cache::types::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A resident handle plus the bookkeeping needed to expire it
///
/// Idle time is measured on the tokio clock so paused-time tests can move it
/// forward; wall-clock timestamps are kept only for diagnostics.
#[derive(Debug)]
pub struct CacheEntry<H> {
    /// The cache key
    pub key: CacheKey,

    /// The open handle owned by this entry
    pub handle: Arc<H>,

    /// Entry metadata
    pub metadata: CacheMetadata,

    last_access: Instant,
}

impl<H> CacheEntry<H> {
    pub fn new(key: CacheKey, handle: Arc<H>, now: Instant) -> Self {
        Self {
            key,
            handle,
            metadata: CacheMetadata {
                created_at: Utc::now(),
                accessed_at: Utc::now(),
                access_count: 0,
            },
            last_access: now,
        }
    }

    /// True once the entry has gone unused for longer than `idle_timeout`
    pub fn is_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        self.idle_for(now) >= idle_timeout
    }

    /// Time since the entry was last returned to a caller
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }

    /// Mark the entry as accessed (resets the idle window)
    pub fn mark_accessed(&mut self, now: Instant) {
        self.last_access = now;
        self.metadata.accessed_at = Utc::now();
        self.metadata.access_count += 1;
    }
}

/// Metadata associated with a cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the handle was opened
    pub created_at: DateTime<Utc>,

    /// Last time the handle was handed out
    pub accessed_at: DateTime<Utc>,

    /// Number of hits served by this entry
    pub access_count: u64,
}
