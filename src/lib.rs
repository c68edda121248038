//! # Ouroboros Table Cache (ouroboros-tablecache)
//!
//! Per-instance cache of open storage handles for a REST front end over a
//! wide-column table store.
//!
//! ## Features
//!
//! - Lazily opened table and reader handles, one per table name
//! - Idle expiration with release of every evicted handle
//! - At most one open in flight per key, shared by concurrent callers
//! - Orderly shutdown: readers, then tables, then the instance
//! - Health sweep over everything currently open
//!
//! ## Opening an Instance
//!
//! ```no_run
//! use ouroboros_tablecache::{CacheConfig, InstanceCache, InstanceUri, MemoryConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = MemoryConnector::new().with_instance("prod", &["users"]);
//!     let uri = InstanceUri::parse("memory://local/prod")?;
//!
//!     let cache = InstanceCache::open(&connector, uri, &CacheConfig::default()).await?;
//!     let users = cache.table("users").await?;
//!     println!("Opened {}", users);
//!
//!     cache.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Health Checks
//!
//! `check_health` returns one message per failed probe. It only probes
//! handles that are already open and never opens new ones.
//!
//! ```no_run
//! use ouroboros_tablecache::{CacheConfig, InstanceCache, InstanceUri, MemoryConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = MemoryConnector::new().with_instance("prod", &["users"]);
//!     let uri = InstanceUri::parse("memory://local/prod")?;
//!     let cache = InstanceCache::open(&connector, uri, &CacheConfig::default()).await?;
//!
//!     let report = cache.health_report().await;
//!     println!("Status: {:?}", report.status);
//!     println!("Response time: {}ms", report.response_time_ms);
//!     Ok(())
//! }
//! ```
//!
//! ## Serving Many Instances
//!
//! ```no_run
//! use ouroboros_tablecache::{CacheConfig, InstanceRegistry, InstanceUri, MemoryConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = MemoryConnector::new()
//!         .with_instance("prod", &["users"])
//!         .with_instance("staging", &["users"]);
//!     let cluster = InstanceUri::new("memory://local", "");
//!     let registry = InstanceRegistry::new(connector, cluster, CacheConfig::from_env()?)?;
//!
//!     let reader = registry.reader("staging", "users").await?;
//!     println!("Reading through {}", reader);
//!
//!     for (instance, issues) in registry.check_health().await {
//!         println!("{}: {} issues", instance, issues.len());
//!     }
//!
//!     registry.stop().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod health;
pub mod instance;
pub mod registry;
pub mod storage;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheEntry, CacheKey, CacheMetadata, CacheStats,
    ExpiringCache, Loader, RemovalCause, RemovalEvent,
};
pub use error::{CacheError, Result, StorageError, StorageResult};
pub use health::{HealthIssue, HealthReport, HealthStatus};
pub use instance::InstanceCache;
pub use registry::InstanceRegistry;
pub use storage::{
    InstanceUri, MemoryConnector, MemoryInstance, MemoryReader, MemoryTable, Resource,
    ResourceKind, StorageConnector, StorageInstance, StorageReader, StorageTable,
};
