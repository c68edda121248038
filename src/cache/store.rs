//! Expiring keyed cache with single-flight loading and release on removal

use crate::cache::{
    entry::CacheEntry,
    invalidation::{release_quietly, RemovalCause, RemovalEvent},
    types::{CacheKey, CacheStats},
};
use crate::error::{CacheError, Result, StorageError};
use crate::storage::Resource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Opens the resource for a key on a cache miss
#[async_trait]
pub trait Loader<H>: Send + Sync + 'static {
    async fn load(&self, key: &str) -> Result<H>;
}

/// Adapter turning an async closure into a [`Loader`]
pub struct FnLoader<F> {
    f: F,
}

#[async_trait]
impl<H, F, Fut> Loader<H> for FnLoader<F>
where
    H: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<H>> + Send + 'static,
{
    async fn load(&self, key: &str) -> Result<H> {
        (self.f)(key.to_string()).await
    }
}

/// Wrap an async closure as a shareable loader
pub fn loader_fn<H, F, Fut>(f: F) -> Arc<dyn Loader<H>>
where
    H: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<H>> + Send + 'static,
{
    Arc::new(FnLoader { f })
}

/// `None` until the load finishes
type LoadOutcome<H> = Option<Result<Arc<H>>>;

/// A load in flight for one key
struct Pending<H> {
    rx: watch::Receiver<LoadOutcome<H>>,
    /// Set when the key is invalidated before the load finishes
    superseded: Arc<AtomicBool>,
}

enum Slot<H> {
    Ready(CacheEntry<H>),
    Loading(Pending<H>),
}

/// Internal cache storage
struct CacheStore<H> {
    slots: HashMap<CacheKey, Slot<H>>,
    stats: CacheStats,
}

impl<H> CacheStore<H> {
    fn resident(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Remove the entry for `key` if it is resident; in-flight loads are left alone
    fn take_ready(&mut self, key: &str) -> Option<CacheEntry<H>> {
        if !matches!(self.slots.get(key), Some(Slot::Ready(_))) {
            return None;
        }
        match self.slots.remove(key) {
            Some(Slot::Ready(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Detach the load in flight for `key`; its handle is released on arrival
    fn supersede(&mut self, key: &str) -> bool {
        if !matches!(self.slots.get(key), Some(Slot::Loading(_))) {
            return false;
        }
        match self.slots.remove(key) {
            Some(Slot::Loading(pending)) => {
                pending.superseded.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    fn supersede_all(&mut self) -> usize {
        let keys: Vec<CacheKey> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Loading(_)))
            .map(|(key, _)| key.clone())
            .collect();

        keys.iter().filter(|key| self.supersede(key)).count()
    }

    fn take_ready_where<P>(&mut self, mut predicate: P) -> Vec<CacheEntry<H>>
    where
        P: FnMut(&CacheEntry<H>) -> bool,
    {
        let mut keys: Vec<CacheKey> = self
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(entry) if predicate(entry) => Some(key.clone()),
                _ => None,
            })
            .collect();
        keys.sort();

        keys.iter().filter_map(|key| self.take_ready(key)).collect()
    }
}

enum Next<H> {
    Wait(watch::Receiver<LoadOutcome<H>>),
    Closed,
}

/// Key → lazily opened handle, released when idle or invalidated
///
/// This implementation provides:
/// - At most one load in flight per key; concurrent callers share its result
/// - Idle expiration, checked on access and by [`ExpiringCache::cleanup_expired`]
/// - A release call for every handle that leaves the cache, failures logged
/// - A loading gate that makes `get` fail fast once the owner shuts down
///
/// Loads run on a spawned task, so a caller that gives up waiting never
/// strands the others. Internal locks are never held across storage calls.
pub struct ExpiringCache<H: Resource> {
    name: String,
    owner: String,
    idle_timeout: Duration,
    open: Arc<AtomicBool>,
    loader: Arc<dyn Loader<H>>,
    store: Arc<RwLock<CacheStore<H>>>,
}

impl<H: Resource> ExpiringCache<H> {
    /// Create a cache named `name` whose entries expire after `idle_timeout`
    pub fn new(
        name: impl Into<String>,
        idle_timeout: Duration,
        loader: Arc<dyn Loader<H>>,
    ) -> Self {
        let name = name.into();
        debug!(
            "Initializing expiring cache {} (idle timeout: {:?})",
            name, idle_timeout
        );

        Self {
            owner: name.clone(),
            name,
            idle_timeout,
            open: Arc::new(AtomicBool::new(true)),
            loader,
            store: Arc::new(RwLock::new(CacheStore {
                slots: HashMap::new(),
                stats: CacheStats::default(),
            })),
        }
    }

    /// Name reported in [`CacheError::Closed`]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Share a loading gate with other caches
    pub fn with_open_flag(mut self, open: Arc<AtomicBool>) -> Self {
        self.open = open;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Whether new loads are still allowed
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Refuse all further loads. Resident entries are untouched.
    pub fn disable_loading(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Return the handle for `key`, opening it if absent or expired
    pub async fn get(&self, key: &str) -> Result<Arc<H>> {
        if !self.is_open() {
            return Err(CacheError::closed(&self.owner));
        }

        let (next, expired) = {
            let mut guard = self.store.write().await;
            let store = &mut *guard;
            let now = Instant::now();

            if let Some(Slot::Ready(entry)) = store.slots.get_mut(key) {
                if !entry.is_expired(self.idle_timeout, now) {
                    entry.mark_accessed(now);
                    store.stats.hits += 1;
                    debug!("Cache hit in {}: {}", self.name, key);
                    return Ok(Arc::clone(&entry.handle));
                }
            }

            let expired = store.take_ready(key);
            if expired.is_some() {
                store.stats.evictions_ttl += 1;
                debug!("Cache entry expired in {}: {}", self.name, key);
            }

            let in_flight = match store.slots.get(key) {
                Some(Slot::Loading(pending)) => Some(pending.rx.clone()),
                _ => None,
            };

            let next = if let Some(rx) = in_flight {
                store.stats.coalesced += 1;
                debug!("Joining in-flight load in {}: {}", self.name, key);
                Next::Wait(rx)
            } else if !self.is_open() {
                // Checked again under the lock: a teardown that has already
                // drained the map must not see a new load slip in behind it.
                Next::Closed
            } else {
                debug!("Cache miss in {}: {}", self.name, key);
                let (tx, rx) = watch::channel(None);
                let superseded = Arc::new(AtomicBool::new(false));
                store.slots.insert(
                    key.to_string(),
                    Slot::Loading(Pending {
                        rx: rx.clone(),
                        superseded: Arc::clone(&superseded),
                    }),
                );
                store.stats.misses += 1;
                self.spawn_load(key.to_string(), tx, superseded);
                Next::Wait(rx)
            };

            (next, expired)
        };

        if let Some(entry) = expired {
            self.release_entries(vec![entry], RemovalCause::Expired).await;
        }

        let mut rx = match next {
            Next::Wait(rx) => rx,
            Next::Closed => return Err(CacheError::closed(&self.owner)),
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };

        match outcome {
            Some(result) => result,
            None => {
                self.clear_abandoned(key).await;
                Err(CacheError::construction(
                    format!("{} in {}", key, self.name),
                    StorageError::Io("load task ended without a result".to_string()),
                ))
            }
        }
    }

    fn spawn_load(
        &self,
        key: CacheKey,
        tx: watch::Sender<LoadOutcome<H>>,
        superseded: Arc<AtomicBool>,
    ) {
        let loader = Arc::clone(&self.loader);
        let store = Arc::clone(&self.store);
        let open = Arc::clone(&self.open);
        let name = self.name.clone();
        let owner = self.owner.clone();

        tokio::spawn(async move {
            let loaded = loader.load(&key).await;

            let mut stale = None;
            let outcome = {
                let mut guard = store.write().await;
                let current = matches!(
                    guard.slots.get(&key),
                    Some(Slot::Loading(pending)) if Arc::ptr_eq(&pending.superseded, &superseded)
                );
                if current {
                    guard.slots.remove(&key);
                }

                match loaded {
                    Ok(handle) => {
                        let handle = Arc::new(handle);
                        if !open.load(Ordering::SeqCst) {
                            stale = Some((handle, RemovalCause::Teardown));
                            Err(CacheError::closed(&owner))
                        } else if superseded.load(Ordering::SeqCst) {
                            stale = Some((handle, RemovalCause::Explicit));
                            Err(CacheError::construction(
                                format!("{} in {}", key, name),
                                StorageError::IllegalState(
                                    "invalidated while loading".to_string(),
                                ),
                            ))
                        } else {
                            let entry =
                                CacheEntry::new(key.clone(), Arc::clone(&handle), Instant::now());
                            guard.slots.insert(key.clone(), Slot::Ready(entry));
                            guard.stats.loads += 1;
                            debug!("Loaded {} into {}", key, name);
                            Ok(handle)
                        }
                    }
                    Err(e) => {
                        guard.stats.load_failures += 1;
                        warn!("Failed to load {} into {}: {}", key, name, e);
                        Err(e)
                    }
                }
            };

            if let Some((handle, cause)) = stale {
                debug!("{} dropped {} while it was loading, releasing it", name, key);
                if !release_quietly(handle.as_ref(), &key, cause).await {
                    store.write().await.stats.release_failures += 1;
                }
            }

            // Nobody waiting is fine
            let _ = tx.send(Some(outcome));
        });
    }

    async fn clear_abandoned(&self, key: &str) {
        let mut store = self.store.write().await;
        let abandoned = match store.slots.get(key) {
            Some(Slot::Loading(pending)) => pending.rx.has_changed().is_err(),
            _ => false,
        };
        if abandoned {
            warn!("Discarding abandoned load of {} in {}", key, self.name);
            store.slots.remove(key);
        }
    }

    /// Remove and release the entry for `key`.
    ///
    /// A load still in flight for `key` is detached: its callers get an error
    /// and the handle it opens is released instead of cached. Returns `true`
    /// if there was anything to remove.
    pub async fn invalidate(&self, key: &str) -> bool {
        let (removed, superseded) = {
            let mut store = self.store.write().await;
            let removed = store.take_ready(key);
            let superseded = store.supersede(key);
            if removed.is_some() || superseded {
                store.stats.invalidations += 1;
            }
            (removed, superseded)
        };

        if superseded {
            debug!("Detached in-flight load of {} in {}", key, self.name);
        }

        match removed {
            Some(entry) => {
                debug!("Invalidated {} in {}", key, self.name);
                self.release_entries(vec![entry], RemovalCause::Explicit).await;
                true
            }
            None => superseded,
        }
    }

    /// Remove and release every resident entry
    pub async fn invalidate_all(&self) -> RemovalEvent {
        let entries = {
            let mut store = self.store.write().await;
            let entries = store.take_ready_where(|_| true);
            let detached = store.supersede_all();
            if detached > 0 {
                debug!("Detached {} in-flight loads in {}", detached, self.name);
            }
            store.stats.invalidations += entries.len() as u64;
            entries
        };

        let keys = entries.iter().map(|e| e.key.clone()).collect();
        let mut event = RemovalEvent::new(RemovalCause::Teardown, keys);
        event.release_failures = self.release_entries(entries, RemovalCause::Teardown).await;

        if !event.is_empty() {
            info!("Released {} entries from {}", event.len(), self.name);
        }
        event
    }

    /// Remove and release every entry past its idle window
    pub async fn cleanup_expired(&self) -> Option<RemovalEvent> {
        let entries = {
            let mut store = self.store.write().await;
            let now = Instant::now();
            let idle_timeout = self.idle_timeout;
            let entries = store.take_ready_where(|entry| entry.is_expired(idle_timeout, now));
            store.stats.evictions_ttl += entries.len() as u64;
            entries
        };

        if entries.is_empty() {
            return None;
        }

        let keys = entries.iter().map(|e| e.key.clone()).collect();
        let mut event = RemovalEvent::new(RemovalCause::Expired, keys);
        event.release_failures = self.release_entries(entries, RemovalCause::Expired).await;

        debug!("Cleaned up {} expired entries from {}", event.len(), self.name);
        Some(event)
    }

    /// Release handles one by one; a failure never stops the rest
    async fn release_entries(&self, entries: Vec<CacheEntry<H>>, cause: RemovalCause) -> usize {
        let mut failures = 0;
        for entry in entries {
            if !release_quietly(entry.handle.as_ref(), &entry.key, cause).await {
                failures += 1;
            }
        }

        if failures > 0 {
            self.store.write().await.stats.release_failures += failures as u64;
        }
        failures
    }

    /// Check if a key is resident (without updating access time)
    pub async fn contains_key(&self, key: &str) -> bool {
        let store = self.store.read().await;
        matches!(store.slots.get(key), Some(Slot::Ready(_)))
    }

    /// Number of resident entries
    pub async fn len(&self) -> usize {
        self.store.read().await.resident()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resident keys, sorted
    pub async fn keys(&self) -> Vec<CacheKey> {
        let store = self.store.read().await;
        let mut keys: Vec<CacheKey> = store
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Snapshot of resident handles in key order.
    ///
    /// Does not touch access times and never loads anything.
    pub async fn handles(&self) -> Vec<(CacheKey, Arc<H>)> {
        let store = self.store.read().await;
        let mut handles: Vec<(CacheKey, Arc<H>)> = store
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(entry) => Some((key.clone(), Arc::clone(&entry.handle))),
                Slot::Loading(_) => None,
            })
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let store = self.store.read().await;
        let mut stats = store.stats.clone();
        stats.entries = store.resident();
        stats
    }
}
