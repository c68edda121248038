//! In-memory storage backend
//!
//! A self-contained implementation of the storage traits used by the test
//! suite and the demo. It keeps a catalog of instances, tables and rows, counts
//! every open and release per resource kind, and lets callers inject failures
//! into opens, releases and probes.

use super::{
    InstanceUri, Resource, ResourceKind, StorageConnector, StorageInstance, StorageReader,
    StorageTable,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type Rows = BTreeMap<Vec<u8>, Vec<u8>>;
type FaultKey = (ResourceKind, String);

#[derive(Debug, Default, Clone, Copy)]
struct KindCounters {
    opened: usize,
    release_calls: usize,
    released: usize,
    probes: usize,
}

#[derive(Debug, Default)]
struct Faults {
    open: HashMap<FaultKey, StorageError>,
    release: HashMap<FaultKey, StorageError>,
    probe: HashMap<FaultKey, StorageError>,
}

#[derive(Debug, Default)]
struct MemoryState {
    catalog: Mutex<HashMap<String, HashMap<String, Rows>>>,
    faults: Mutex<Faults>,
    counters: Mutex<HashMap<ResourceKind, KindCounters>>,
    release_log: Mutex<HashMap<u64, usize>>,
    open_delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
}

impl MemoryState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn simulate_latency(&self) {
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn fault(
        &self,
        kind: ResourceKind,
        name: &str,
        pick: fn(&Faults) -> &HashMap<FaultKey, StorageError>,
    ) -> Option<StorageError> {
        let faults = self.faults.lock();
        pick(&faults).get(&(kind, name.to_string())).cloned()
    }

    fn record_open(&self, kind: ResourceKind) {
        self.counters.lock().entry(kind).or_default().opened += 1;
    }

    fn record_probe(&self, kind: ResourceKind) {
        self.counters.lock().entry(kind).or_default().probes += 1;
    }

    fn release(
        &self,
        kind: ResourceKind,
        name: &str,
        id: u64,
        released: &AtomicBool,
    ) -> StorageResult<()> {
        *self.release_log.lock().entry(id).or_insert(0) += 1;
        self.counters.lock().entry(kind).or_default().release_calls += 1;

        if let Some(err) = self.fault(kind, name, |f| &f.release) {
            return Err(err);
        }

        if !released.swap(true, Ordering::SeqCst) {
            self.counters.lock().entry(kind).or_default().released += 1;
        }
        Ok(())
    }

    fn check_usable(&self, what: &dyn fmt::Display, released: &AtomicBool) -> StorageResult<()> {
        if released.load(Ordering::SeqCst) {
            return Err(StorageError::IllegalState(format!("{} has been released", what)));
        }
        Ok(())
    }
}

/// Connector for the in-memory backend. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<MemoryState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper registering an instance with the given tables
    pub fn with_instance(self, instance: &str, tables: &[&str]) -> Self {
        self.add_instance(instance);
        for table in tables {
            self.add_table(instance, table);
        }
        self
    }

    pub fn add_instance(&self, instance: &str) {
        self.state
            .catalog
            .lock()
            .entry(instance.to_string())
            .or_default();
    }

    pub fn add_table(&self, instance: &str, table: &str) {
        self.state
            .catalog
            .lock()
            .entry(instance.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default();
    }

    /// Remove a table from the catalog, as if it were deleted by another client
    pub fn drop_table(&self, instance: &str, table: &str) {
        if let Some(tables) = self.state.catalog.lock().get_mut(instance) {
            tables.remove(table);
        }
    }

    pub fn put_row(&self, instance: &str, table: &str, key: &[u8], value: &[u8]) {
        self.state
            .catalog
            .lock()
            .entry(instance.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
    }

    /// Make every open of `kind` named `name` fail.
    ///
    /// Instances are named by instance name; tables and readers by table name.
    pub fn fail_open(&self, kind: ResourceKind, name: &str, error: StorageError) {
        self.state
            .faults
            .lock()
            .open
            .insert((kind, name.to_string()), error);
    }

    pub fn fail_release(&self, kind: ResourceKind, name: &str, error: StorageError) {
        self.state
            .faults
            .lock()
            .release
            .insert((kind, name.to_string()), error);
    }

    pub fn fail_probe(&self, kind: ResourceKind, name: &str, error: StorageError) {
        self.state
            .faults
            .lock()
            .probe
            .insert((kind, name.to_string()), error);
    }

    pub fn clear_faults(&self) {
        *self.state.faults.lock() = Faults::default();
    }

    /// Delay every open call, to widen race windows in tests
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.state.open_delay.lock() = delay;
    }

    /// Number of successful opens of `kind`
    pub fn opened(&self, kind: ResourceKind) -> usize {
        self.counter(kind).opened
    }

    /// Number of release calls on handles of `kind`, failed ones included
    pub fn release_calls(&self, kind: ResourceKind) -> usize {
        self.counter(kind).release_calls
    }

    /// Number of handles of `kind` that were released cleanly
    pub fn released(&self, kind: ResourceKind) -> usize {
        self.counter(kind).released
    }

    /// Handles of `kind` that were opened and not yet released cleanly
    pub fn live(&self, kind: ResourceKind) -> usize {
        let counters = self.counter(kind);
        counters.opened.saturating_sub(counters.released)
    }

    pub fn probes(&self, kind: ResourceKind) -> usize {
        self.counter(kind).probes
    }

    /// Number of release calls made on the handle with the given id
    pub fn release_count(&self, id: u64) -> usize {
        self.state.release_log.lock().get(&id).copied().unwrap_or(0)
    }

    fn counter(&self, kind: ResourceKind) -> KindCounters {
        self.state
            .counters
            .lock()
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageConnector for MemoryConnector {
    type Instance = MemoryInstance;

    async fn open_instance(&self, uri: &InstanceUri) -> StorageResult<MemoryInstance> {
        self.state.simulate_latency().await;

        let name = uri.instance();
        if let Some(err) = self.state.fault(ResourceKind::Instance, name, |f| &f.open) {
            return Err(err);
        }
        if !self.state.catalog.lock().contains_key(name) {
            return Err(StorageError::NotFound(format!("instance {}", uri)));
        }

        self.state.record_open(ResourceKind::Instance);
        let instance = MemoryInstance {
            uri: uri.clone(),
            id: self.state.next_id(),
            state: Arc::clone(&self.state),
            released: AtomicBool::new(false),
        };
        debug!("Opened in-memory instance {}", instance);
        Ok(instance)
    }
}

/// Open in-memory instance
#[derive(Debug)]
pub struct MemoryInstance {
    uri: InstanceUri,
    id: u64,
    state: Arc<MemoryState>,
    released: AtomicBool,
}

impl MemoryInstance {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &InstanceUri {
        &self.uri
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl fmt::Display for MemoryInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

#[async_trait]
impl Resource for MemoryInstance {
    async fn release(&self) -> StorageResult<()> {
        self.state.release(
            ResourceKind::Instance,
            self.uri.instance(),
            self.id,
            &self.released,
        )
    }

    async fn probe(&self) -> StorageResult<()> {
        self.state.record_probe(ResourceKind::Instance);
        self.state.check_usable(self, &self.released)?;
        if let Some(err) = self
            .state
            .fault(ResourceKind::Instance, self.uri.instance(), |f| &f.probe)
        {
            return Err(err);
        }
        // Metadata lookup: the instance must still be in the catalog
        if !self.state.catalog.lock().contains_key(self.uri.instance()) {
            return Err(StorageError::Io(format!("metadata for {} is unavailable", self)));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageInstance for MemoryInstance {
    type Table = MemoryTable;

    async fn open_table(&self, name: &str) -> StorageResult<MemoryTable> {
        self.state.simulate_latency().await;
        self.state.check_usable(self, &self.released)?;

        if let Some(err) = self.state.fault(ResourceKind::Table, name, |f| &f.open) {
            return Err(err);
        }
        let exists = self
            .state
            .catalog
            .lock()
            .get(self.uri.instance())
            .map_or(false, |tables| tables.contains_key(name));
        if !exists {
            return Err(StorageError::NotFound(format!(
                "table {} in instance {}",
                name,
                self.uri.instance()
            )));
        }

        self.state.record_open(ResourceKind::Table);
        Ok(MemoryTable {
            instance: self.uri.instance().to_string(),
            name: name.to_string(),
            id: self.state.next_id(),
            state: Arc::clone(&self.state),
            released: AtomicBool::new(false),
        })
    }
}

/// Open in-memory table
#[derive(Debug)]
pub struct MemoryTable {
    instance: String,
    name: String,
    id: u64,
    state: Arc<MemoryState>,
    released: AtomicBool,
}

impl MemoryTable {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl fmt::Display for MemoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.instance, self.name)
    }
}

#[async_trait]
impl Resource for MemoryTable {
    async fn release(&self) -> StorageResult<()> {
        self.state
            .release(ResourceKind::Table, &self.name, self.id, &self.released)
    }

    async fn probe(&self) -> StorageResult<()> {
        self.state.record_probe(ResourceKind::Table);
        self.state.check_usable(self, &self.released)?;
        if let Some(err) = self.state.fault(ResourceKind::Table, &self.name, |f| &f.probe) {
            return Err(err);
        }
        // Capability lookup: the table layout must still resolve
        let exists = self
            .state
            .catalog
            .lock()
            .get(&self.instance)
            .map_or(false, |tables| tables.contains_key(&self.name));
        if !exists {
            return Err(StorageError::Io(format!("layout of {} is unavailable", self)));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageTable for MemoryTable {
    type Reader = MemoryReader;

    async fn open_reader(&self) -> StorageResult<MemoryReader> {
        self.state.check_usable(self, &self.released)?;

        if let Some(err) = self.state.fault(ResourceKind::Reader, &self.name, |f| &f.open) {
            return Err(err);
        }

        // A reader is bound to its table once the open starts
        self.state.simulate_latency().await;
        self.state.record_open(ResourceKind::Reader);
        Ok(MemoryReader {
            instance: self.instance.clone(),
            table: self.name.clone(),
            id: self.state.next_id(),
            state: Arc::clone(&self.state),
            released: AtomicBool::new(false),
        })
    }
}

/// Open in-memory table reader
#[derive(Debug)]
pub struct MemoryReader {
    instance: String,
    table: String,
    id: u64,
    state: Arc<MemoryState>,
    released: AtomicBool,
}

impl MemoryReader {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Point read of a single row
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.state.check_usable(self, &self.released)?;
        let catalog = self.state.catalog.lock();
        let rows = catalog
            .get(&self.instance)
            .and_then(|tables| tables.get(&self.table))
            .ok_or_else(|| StorageError::Io(format!("{} cannot reach its table", self)))?;
        Ok(rows.get(key).cloned())
    }
}

impl fmt::Display for MemoryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reader#{} on {}.{}", self.id, self.instance, self.table)
    }
}

#[async_trait]
impl Resource for MemoryReader {
    async fn release(&self) -> StorageResult<()> {
        self.state
            .release(ResourceKind::Reader, &self.table, self.id, &self.released)
    }

    async fn probe(&self) -> StorageResult<()> {
        self.state.record_probe(ResourceKind::Reader);
        if let Some(err) = self.state.fault(ResourceKind::Reader, &self.table, |f| &f.probe) {
            return Err(err);
        }
        // Empty read of a zero-length key
        self.get(&[]).map(|_| ())
    }
}

impl StorageReader for MemoryReader {}
