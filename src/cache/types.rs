//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cache key type: the table name
pub type CacheKey = String;

/// Counters for one expiring cache
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a resident entry
    pub hits: u64,

    /// Lookups that started a new load
    pub misses: u64,

    /// Lookups that joined a load already in flight
    pub coalesced: u64,

    /// Loads that produced a handle
    pub loads: u64,

    /// Loads that failed
    pub load_failures: u64,

    /// Entries removed after their idle window elapsed
    pub evictions_ttl: u64,

    /// Entries removed by explicit or bulk invalidation
    pub invalidations: u64,

    /// Release calls that failed
    pub release_failures: u64,

    /// Entries currently resident
    pub entries: usize,
}

impl CacheStats {
    /// Cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Total entries removed for any reason
    pub fn total_removals(&self) -> u64 {
        self.evictions_ttl + self.invalidations
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, loads: {}, load_failures: {}, removals: {}, release_failures: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.entries,
            self.loads,
            self.load_failures,
            self.total_removals(),
            self.release_failures
        )
    }
}
