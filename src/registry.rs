//! One [`InstanceCache`] per storage instance
//!
//! The registry is the entry point for request handlers: it opens an
//! instance the first time it is named and serves every later request for
//! that instance from the same cache.

use crate::cache::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::instance::InstanceCache;
use crate::storage::{InstanceUri, ReaderOf, StorageConnector, TableOf};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Served<C: StorageConnector> {
    cache: Arc<InstanceCache<C>>,
    cleanup: Option<JoinHandle<()>>,
}

impl<C: StorageConnector> Served<C> {
    fn abort_cleanup(&self) {
        if let Some(task) = &self.cleanup {
            task.abort();
        }
    }
}

/// Instance caches keyed by instance name
pub struct InstanceRegistry<C: StorageConnector> {
    connector: C,
    cluster: InstanceUri,
    config: CacheConfig,
    open: AtomicBool,
    served: RwLock<HashMap<String, Served<C>>>,
    /// Held while an instance is being opened, one lock per name. An entry
    /// lives only as long as some caller is opening that name.
    opening: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<C: StorageConnector> InstanceRegistry<C> {
    /// Create an empty registry. Instances are opened on first use, under
    /// `cluster` (whose instance part is ignored).
    pub fn new(connector: C, cluster: InstanceUri, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        info!("Instance registry ready for cluster {}", cluster.cluster());

        Ok(Self {
            connector,
            cluster,
            config,
            open: AtomicBool::new(true),
            served: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Cache for instance `name`, opening the instance if needed.
    ///
    /// Concurrent callers for the same name share one open. A failed open is
    /// not remembered; the next call tries again.
    pub async fn instance(&self, name: &str) -> Result<Arc<InstanceCache<C>>> {
        if !self.is_open() {
            return Err(CacheError::closed(name));
        }

        if let Some(served) = self.served.read().await.get(name) {
            return Ok(Arc::clone(&served.cache));
        }

        let gate = {
            let mut opening = self.opening.lock().await;
            Arc::clone(opening.entry(name.to_string()).or_default())
        };
        let result = {
            let _guard = gate.lock().await;
            self.open_gated(name).await
        };

        let mut opening = self.opening.lock().await;
        // The map holds one reference and we hold the other
        let ours = opening.get(name).is_some_and(|g| Arc::ptr_eq(g, &gate));
        if ours && Arc::strong_count(&gate) == 2 {
            opening.remove(name);
        }

        result
    }

    async fn open_gated(&self, name: &str) -> Result<Arc<InstanceCache<C>>> {
        // Another caller may have finished the open while we waited
        if let Some(served) = self.served.read().await.get(name) {
            return Ok(Arc::clone(&served.cache));
        }
        if !self.is_open() {
            return Err(CacheError::closed(name));
        }

        let uri = InstanceUri::for_instance(&self.cluster, name);
        let cache = Arc::new(InstanceCache::open(&self.connector, uri, &self.config).await?);

        let mut served = self.served.write().await;
        if !self.is_open() {
            // The registry was stopped while the instance was opening
            drop(served);
            cache.stop().await;
            return Err(CacheError::closed(name));
        }

        let cleanup = self
            .config
            .enable_auto_cleanup
            .then(|| cache.spawn_cleanup(self.config.cleanup_interval));
        served.insert(
            name.to_string(),
            Served {
                cache: Arc::clone(&cache),
                cleanup,
            },
        );
        debug!("Instance {} is now served", name);

        Ok(cache)
    }

    /// Names of the instances currently served, sorted
    pub async fn instances(&self) -> Vec<String> {
        let mut names: Vec<String> = self.served.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn table(&self, instance: &str, table: &str) -> Result<Arc<TableOf<C>>> {
        self.instance(instance).await?.table(table).await
    }

    pub async fn reader(&self, instance: &str, table: &str) -> Result<Arc<ReaderOf<C>>> {
        self.instance(instance).await?.reader(table).await
    }

    /// Release the cached table and reader for `table`. Does not open the
    /// instance if it is not served.
    pub async fn invalidate_table(&self, instance: &str, table: &str) {
        let cache = self
            .served
            .read()
            .await
            .get(instance)
            .map(|served| Arc::clone(&served.cache));

        if let Some(cache) = cache {
            cache.invalidate_table(table).await;
        }
    }

    /// Stop serving `instance` and release everything it held.
    ///
    /// Release failures are logged and recorded on the stopped cache. Returns
    /// `false` if the instance was not served.
    pub async fn invalidate_instance(&self, instance: &str) -> bool {
        let Some(served) = self.served.write().await.remove(instance) else {
            return false;
        };

        info!("Invalidating instance {}", instance);
        served.abort_cleanup();
        served.cache.stop().await;
        if let Some(e) = served.cache.release_error() {
            error!("Instance {} was not released cleanly: {}", instance, e);
        }
        true
    }

    /// Health issues of every served instance, keyed by instance name
    pub async fn check_health(&self) -> BTreeMap<String, Vec<String>> {
        let caches: Vec<(String, Arc<InstanceCache<C>>)> = self
            .served
            .read()
            .await
            .iter()
            .map(|(name, served)| (name.clone(), Arc::clone(&served.cache)))
            .collect();

        let mut report = BTreeMap::new();
        for (name, cache) in caches {
            report.insert(name, cache.check_health().await);
        }
        report
    }

    /// Stop every served instance and refuse further opens.
    ///
    /// Every instance is stopped even if some fail to release; failures are
    /// logged and the count of unclean stops is returned.
    pub async fn stop(&self) -> usize {
        if !self.open.swap(false, Ordering::SeqCst) {
            return 0;
        }
        info!("Stopping instance registry for {}", self.cluster.cluster());

        let drained: Vec<(String, Served<C>)> = self.served.write().await.drain().collect();

        let mut failures = 0;
        for (name, served) in drained {
            served.abort_cleanup();
            served.cache.stop().await;
            if let Some(e) = served.cache.release_error() {
                error!("Instance {} was not released cleanly: {}", name, e);
                failures += 1;
            }
        }

        if failures > 0 {
            warn!("Stopped instance registry with {} unclean instances", failures);
        }
        failures
    }
}
