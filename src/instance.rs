//! Per-instance resource tree: instance handle, tables and readers
//!
//! An [`InstanceCache`] opens its storage instance eagerly and everything
//! beneath it lazily. Tables are opened through the instance handle and
//! readers through the cached table, each kept in its own
//! [`ExpiringCache`]. The cache owns every handle it hands out: callers
//! borrow them and must never release them.
//!
//! ```no_run
//! use ouroboros_tablecache::{CacheConfig, InstanceCache, InstanceUri, MemoryConnector};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let connector = MemoryConnector::new().with_instance("prod", &["users"]);
//! let uri = InstanceUri::parse("memory://local/prod")?;
//! let cache = InstanceCache::open(&connector, uri, &CacheConfig::default()).await?;
//!
//! let reader = cache.reader("users").await?;
//! println!("reading through {}", reader);
//!
//! let issues = cache.check_health().await;
//! assert!(issues.is_empty());
//!
//! cache.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::cache::{
    config::CacheConfig,
    invalidation::RemovalEvent,
    store::{ExpiringCache, Loader},
    types::{CacheKey, CacheStats},
};
use crate::error::{CacheError, Result, StorageError};
use crate::health::{HealthIssue, HealthReport};
use crate::storage::{
    InstanceUri, ReaderOf, Resource, ResourceKind, StorageConnector, StorageInstance,
    StorageTable, TableOf,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

type ReaderCache<T> = ExpiringCache<<T as StorageTable>::Reader>;

/// Opens tables through the instance handle
struct TableLoader<I: StorageInstance> {
    instance: Arc<I>,
    instance_name: String,
    readers: Arc<OnceLock<Weak<ReaderCache<I::Table>>>>,
}

#[async_trait]
impl<I: StorageInstance> Loader<I::Table> for TableLoader<I> {
    async fn load(&self, table: &str) -> Result<I::Table> {
        // A resident reader at this point was opened from a table that has
        // since left the cache
        if let Some(readers) = self.readers.get().and_then(Weak::upgrade) {
            if readers.invalidate(table).await {
                debug!("Dropped reader left over from a previous {} table", table);
            }
        }

        self.instance.open_table(table).await.map_err(|e| {
            CacheError::construction(
                format!("table {} in instance {}", table, self.instance_name),
                e,
            )
        })
    }
}

/// Opens readers through the cached table
struct ReaderLoader<T: StorageTable> {
    tables: Arc<ExpiringCache<T>>,
}

#[async_trait]
impl<T: StorageTable> Loader<T::Reader> for ReaderLoader<T> {
    async fn load(&self, table: &str) -> Result<T::Reader> {
        // Table failures pass through untouched so callers see the real cause
        let handle = self.tables.get(table).await?;

        handle
            .open_reader()
            .await
            .map_err(|e| CacheError::construction(format!("reader on table {}", handle), e))
    }
}

/// Cache of every open resource for one storage instance
pub struct InstanceCache<C: StorageConnector> {
    uri: InstanceUri,
    instance: Arc<C::Instance>,
    tables: Arc<ExpiringCache<TableOf<C>>>,
    readers: Arc<ExpiringCache<ReaderOf<C>>>,
    open: Arc<AtomicBool>,
    /// Set if the instance handle could not be released on stop
    release_error: OnceLock<CacheError>,
}

impl<C: StorageConnector> InstanceCache<C> {
    /// Open the instance at `uri` and create empty table and reader caches.
    ///
    /// Fails with [`CacheError::Construction`] if the instance cannot be
    /// opened; nothing is retained in that case.
    pub async fn open(connector: &C, uri: InstanceUri, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        info!("Opening storage instance {}", uri);

        let instance = connector.open_instance(&uri).await.map_err(|e| {
            error!("Unable to open storage instance {}: {}", uri, e);
            CacheError::construction(format!("instance {}", uri), e)
        })?;
        let instance = Arc::new(instance);

        let name = uri.instance().to_string();
        let open = Arc::new(AtomicBool::new(true));
        let dependents = Arc::new(OnceLock::new());

        let table_loader: Arc<dyn Loader<TableOf<C>>> = Arc::new(TableLoader {
            instance: Arc::clone(&instance),
            instance_name: name.clone(),
            readers: Arc::clone(&dependents),
        });
        let tables = Arc::new(
            ExpiringCache::new(
                format!("{}/tables", name),
                config.table_idle_timeout,
                table_loader,
            )
            .with_owner(name.clone())
            .with_open_flag(Arc::clone(&open)),
        );

        let reader_loader: Arc<dyn Loader<ReaderOf<C>>> = Arc::new(ReaderLoader {
            tables: Arc::clone(&tables),
        });
        let readers = Arc::new(
            ExpiringCache::new(
                format!("{}/readers", name),
                config.reader_idle_timeout,
                reader_loader,
            )
            .with_owner(name)
            .with_open_flag(Arc::clone(&open)),
        );
        // `dependents` is fresh, so this always initializes it
        dependents.get_or_init(|| Arc::downgrade(&readers));

        info!("Storage instance {} is open", uri);
        Ok(Self {
            uri,
            instance,
            tables,
            readers,
            open,
            release_error: OnceLock::new(),
        })
    }

    pub fn uri(&self) -> &InstanceUri {
        &self.uri
    }

    /// Instance name
    pub fn name(&self) -> &str {
        self.uri.instance()
    }

    /// The instance handle held by this cache. Must not be released by callers.
    pub fn instance(&self) -> &Arc<C::Instance> {
        &self.instance
    }

    /// False once [`InstanceCache::stop`] has begun
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Table handle for `name`, opened on first use. Must not be released by callers.
    pub async fn table(&self, name: &str) -> Result<Arc<TableOf<C>>> {
        self.tables.get(name).await
    }

    /// Reader for table `name`, opened on first use. Must not be released by callers.
    ///
    /// The table is resolved first, which also keeps it from idling out
    /// underneath a reader that is still in use.
    pub async fn reader(&self, name: &str) -> Result<Arc<ReaderOf<C>>> {
        self.tables.get(name).await?;
        self.readers.get(name).await
    }

    /// Release the cached table for `name` and the reader opened from it
    pub async fn invalidate_table(&self, name: &str) {
        let table = self.tables.invalidate(name).await;
        let reader = self.readers.invalidate(name).await;
        debug!(
            "Invalidated {} in {} (table: {}, reader: {})",
            name,
            self.uri.instance(),
            table,
            reader
        );
    }

    /// Stop loading, release every reader and table, then the instance.
    ///
    /// Release failures never fail the stop: they are logged, and a failed
    /// instance release is kept for [`InstanceCache::release_error`]. A
    /// second call does nothing.
    pub async fn stop(&self) {
        // Loads that start after this point fail with `Closed`
        if !self.open.swap(false, Ordering::SeqCst) {
            debug!("Instance cache for {} is already stopped", self.uri);
            return;
        }
        info!("Stopping instance cache for {}", self.uri);

        // Readers depend on tables, so they go first
        let readers = self.readers.invalidate_all().await;
        let tables = self.tables.invalidate_all().await;
        info!(
            "Released {} readers and {} tables of {}",
            readers.len(),
            tables.len(),
            self.uri
        );

        match self.instance.release().await {
            Ok(()) => info!("Stopped instance cache for {}", self.uri),
            Err(e) => {
                error!("Unable to release storage instance {}: {}", self.uri, e);
                // Only the first stop gets this far
                self.release_error.get_or_init(|| CacheError::Release {
                    resource: format!("instance {}", self.instance),
                    source: e,
                });
            }
        }
    }

    /// Failure recorded when [`InstanceCache::stop`] could not release the
    /// instance handle
    pub fn release_error(&self) -> Option<&CacheError> {
        self.release_error.get()
    }

    /// Probe the instance and every resident table and reader.
    ///
    /// Returns one message per failed probe; an empty list means healthy.
    /// Never loads anything.
    pub async fn check_health(&self) -> Vec<String> {
        self.probe_all()
            .await
            .into_iter()
            .map(|issue| issue.message)
            .collect()
    }

    /// Same probes as [`InstanceCache::check_health`], with classification and timing
    pub async fn health_report(&self) -> HealthReport {
        let start = Instant::now();
        let issues = self.probe_all().await;
        let elapsed = start.elapsed();

        HealthReport::from_issues(
            self.uri.instance(),
            issues,
            self.tables.len().await,
            self.readers.len().await,
            elapsed.as_millis() as u64,
        )
    }

    async fn probe_all(&self) -> Vec<HealthIssue> {
        let mut issues = Vec::new();

        if !self.is_open() {
            issues.push(HealthIssue {
                kind: ResourceKind::Instance,
                resource: self.uri.to_string(),
                message: format!(
                    "Instance cache for instance {} is not open.",
                    self.uri.instance()
                ),
            });
            return issues;
        }

        if let Err(e) = self.instance.probe().await {
            issues.push(describe(
                ResourceKind::Instance,
                self.instance.as_ref(),
                "cannot read its metadata",
                &e,
            ));
        }

        for (_, table) in self.tables.handles().await {
            if let Err(e) = table.probe().await {
                issues.push(describe(
                    ResourceKind::Table,
                    table.as_ref(),
                    "cannot resolve its capabilities",
                    &e,
                ));
            }
        }

        for (_, reader) in self.readers.handles().await {
            if let Err(e) = reader.probe().await {
                issues.push(describe(ResourceKind::Reader, reader.as_ref(), "cannot get data", &e));
            }
        }

        for issue in &issues {
            warn!("Health issue in {}: {}", self.uri.instance(), issue);
        }
        issues
    }

    /// Release every table and reader past its idle window.
    ///
    /// Readers are swept first; a table that expires takes its reader with it.
    pub async fn cleanup_expired(&self) -> Vec<RemovalEvent> {
        let mut events = Vec::new();

        if let Some(event) = self.readers.cleanup_expired().await {
            events.push(event);
        }

        if let Some(event) = self.tables.cleanup_expired().await {
            for key in &event.keys {
                self.readers.invalidate(key).await;
            }
            events.push(event);
        }

        events
    }

    /// Names of the tables currently open
    pub async fn table_names(&self) -> Vec<CacheKey> {
        self.tables.keys().await
    }

    pub async fn table_stats(&self) -> CacheStats {
        self.tables.stats().await
    }

    pub async fn reader_stats(&self) -> CacheStats {
        self.readers.stats().await
    }
}

fn describe(
    kind: ResourceKind,
    resource: &dyn Resource,
    failure: &str,
    error: &StorageError,
) -> HealthIssue {
    let label = match kind {
        ResourceKind::Instance => "Instance",
        ResourceKind::Table => "Table",
        ResourceKind::Reader => "Reader",
    };

    let message = match error {
        StorageError::IllegalState(_) => format!("{} {} is in illegal state.", label, resource),
        _ => format!("{} {} {}: {}", label, resource, failure, error),
    };

    HealthIssue {
        kind,
        resource: resource.to_string(),
        message,
    }
}

impl<C: StorageConnector> InstanceCache<C> {
    /// Background task that sweeps idle entries every `interval`.
    ///
    /// The task holds only a weak reference and exits once the cache is
    /// stopped or dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        info!(
            "Starting automatic cache cleanup for {} (interval: {:?})",
            self.name(),
            interval
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(cache) = weak.upgrade() else {
                    break;
                };
                if !cache.is_open() {
                    break;
                }

                let events = cache.cleanup_expired().await;
                let removed: usize = events.iter().map(RemovalEvent::len).sum();
                if removed > 0 {
                    debug!("Auto cleanup released {} entries in {}", removed, cache.name());
                }
            }

            debug!("Automatic cache cleanup finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryConnector;

    async fn open_prod(connector: &MemoryConnector) -> InstanceCache<MemoryConnector> {
        InstanceCache::open(
            connector,
            InstanceUri::new("memory://local", "prod"),
            &CacheConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_reader_resolves_table_first() {
        let connector = MemoryConnector::new().with_instance("prod", &["users"]);
        let cache = open_prod(&connector).await;

        let reader = cache.reader("users").await.unwrap();
        assert_eq!(reader.table(), "users");
        assert_eq!(connector.opened(ResourceKind::Table), 1);
        assert_eq!(cache.table_names().await, vec!["users".to_string()]);

        // Table already resident: no second open
        cache.table("users").await.unwrap();
        assert_eq!(connector.opened(ResourceKind::Table), 1);
    }

    #[tokio::test]
    async fn test_table_reload_drops_stale_reader() {
        let connector = MemoryConnector::new().with_instance("prod", &["users"]);
        let cache = open_prod(&connector).await;

        let old_reader = cache.reader("users").await.unwrap();
        // Evict only the table, as an idle sweep on a short table window would
        cache.tables.invalidate("users").await;

        let table = cache.table("users").await.unwrap();
        assert!(old_reader.is_released());
        assert!(!table.is_released());

        let new_reader = cache.reader("users").await.unwrap();
        assert_ne!(old_reader.id(), new_reader.id());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let connector = MemoryConnector::new().with_instance("prod", &["users"]);
        let cache = open_prod(&connector).await;
        cache.reader("users").await.unwrap();

        cache.stop().await;
        cache.stop().await;

        assert_eq!(connector.release_calls(ResourceKind::Reader), 1);
        assert_eq!(connector.release_calls(ResourceKind::Table), 1);
        assert_eq!(connector.release_calls(ResourceKind::Instance), 1);
    }

    #[tokio::test]
    async fn test_describe_messages() {
        let connector = MemoryConnector::new().with_instance("prod", &["users"]);
        let cache = open_prod(&connector).await;
        let table = cache.table("users").await.unwrap();

        let issue = describe(
            ResourceKind::Table,
            table.as_ref(),
            "cannot resolve its capabilities",
            &StorageError::IllegalState("gone".to_string()),
        );
        assert_eq!(issue.message, "Table prod.users is in illegal state.");

        let issue = describe(
            ResourceKind::Table,
            table.as_ref(),
            "cannot resolve its capabilities",
            &StorageError::Io("timeout".to_string()),
        );
        assert_eq!(
            issue.message,
            "Table prod.users cannot resolve its capabilities: I/O error: timeout"
        );
    }
}
