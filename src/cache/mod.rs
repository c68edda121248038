//! # Expiring Handle Cache
//!
//! Keyed cache of open storage handles. Each entry owns one handle and
//! releases it exactly once when the entry leaves the cache.
//!
//! ## Features
//!
//! - **Idle Expiration**: entries not handed out within the idle window are released
//! - **Single-Flight Loading**: concurrent misses for a key share one open call
//! - **Release on Removal**: expiry, invalidation and teardown all release the handle
//! - **Loading Gate**: a shared flag that stops new opens during shutdown
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_tablecache::cache::{loader_fn, ExpiringCache};
//! use ouroboros_tablecache::{CacheError, MemoryConnector, InstanceUri};
//! use ouroboros_tablecache::storage::{StorageConnector, StorageInstance};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let connector = MemoryConnector::new().with_instance("prod", &["users"]);
//! let instance = Arc::new(
//!     connector
//!         .open_instance(&InstanceUri::new("memory://local", "prod"))
//!         .await?,
//! );
//!
//! let tables = ExpiringCache::new(
//!     "prod/tables",
//!     Duration::from_secs(600),
//!     loader_fn(move |name: String| {
//!         let instance = Arc::clone(&instance);
//!         async move {
//!             instance
//!                 .open_table(&name)
//!                 .await
//!                 .map_err(|e| CacheError::Construction { resource: name, source: e })
//!         }
//!     }),
//! );
//!
//! let users = tables.get("users").await?;
//! println!("Cache hit or miss, we have {}", users);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod invalidation;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::{CacheEntry, CacheMetadata};
pub use invalidation::{release_quietly, RemovalCause, RemovalEvent};
pub use store::{loader_fn, ExpiringCache, FnLoader, Loader};
pub use types::{CacheKey, CacheStats};
