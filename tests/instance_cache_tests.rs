//! Integration tests for the instance cache
//!
//! These tests verify:
//! - Lazy table and reader opens with handle reuse
//! - Invalidation of a table and its reader
//! - Stop semantics and the loading gate
//! - Idle expiry with the background sweeper
//! - Concurrent callers sharing one open

use futures::future::join_all;
use ouroboros_tablecache::{
    CacheConfig, CacheError, InstanceCache, InstanceUri, MemoryConnector, ResourceKind,
    StorageError,
};
use std::sync::Arc;
use std::time::Duration;

fn prod_uri() -> InstanceUri {
    InstanceUri::new("memory://local", "prod")
}

async fn open(connector: &MemoryConnector, config: CacheConfig) -> InstanceCache<MemoryConnector> {
    InstanceCache::open(connector, prod_uri(), &config)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_prod_users_scenario() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    let cache = open(&connector, CacheConfig::default()).await;

    let first = cache.table("users").await.unwrap();
    let second = cache.table("users").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(connector.opened(ResourceKind::Table), 1);

    cache.invalidate_table("users").await;
    assert!(first.is_released());

    let third = cache.table("users").await.unwrap();
    assert_ne!(first.id(), third.id());
    assert_eq!(connector.opened(ResourceKind::Table), 2);
    assert_eq!(connector.release_count(first.id()), 1);
}

#[tokio::test]
async fn test_open_missing_instance_fails() {
    let connector = MemoryConnector::new();

    let result = InstanceCache::open(&connector, prod_uri(), &CacheConfig::default()).await;
    let err = result.err().unwrap();

    assert!(err.is_construction());
    assert_eq!(connector.opened(ResourceKind::Instance), 0);
}

#[tokio::test]
async fn test_open_rejects_invalid_config() {
    let connector = MemoryConnector::new().with_instance("prod", &[]);
    let config = CacheConfig::builder()
        .table_idle_timeout(Duration::ZERO)
        .build();

    let result = InstanceCache::open(&connector, prod_uri(), &config).await;
    assert!(matches!(result, Err(CacheError::Config(_))));
    assert_eq!(connector.opened(ResourceKind::Instance), 0);
}

#[tokio::test]
async fn test_instance_handle_is_shared() {
    let connector = MemoryConnector::new().with_instance("prod", &[]);
    let cache = open(&connector, CacheConfig::default()).await;

    assert_eq!(cache.instance().uri(), &prod_uri());
    assert_eq!(cache.name(), "prod");
    assert!(cache.is_open());
    assert!(!cache.instance().is_released());
}

#[tokio::test]
async fn test_reader_reads_rows() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    connector.put_row("prod", "users", b"alice", b"admin");
    let cache = open(&connector, CacheConfig::default()).await;

    let reader = cache.reader("users").await.unwrap();
    assert_eq!(reader.get(b"alice").unwrap(), Some(b"admin".to_vec()));
    assert_eq!(reader.get(b"bob").unwrap(), None);

    let again = cache.reader("users").await.unwrap();
    assert!(Arc::ptr_eq(&reader, &again));
    assert_eq!(connector.opened(ResourceKind::Reader), 1);
}

#[tokio::test]
async fn test_reader_failure_surfaces_table_cause() {
    let connector = MemoryConnector::new().with_instance("prod", &[]);
    let cache = open(&connector, CacheConfig::default()).await;

    let err = cache.reader("missing").await.unwrap_err();
    match err {
        CacheError::Construction { resource, source } => {
            assert_eq!(resource, "table missing in instance prod");
            assert!(matches!(source, StorageError::NotFound(_)));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(connector.opened(ResourceKind::Reader), 0);
}

#[tokio::test]
async fn test_reader_open_failure_not_cached() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    connector.fail_open(
        ResourceKind::Reader,
        "users",
        StorageError::Io("region server down".to_string()),
    );
    let cache = open(&connector, CacheConfig::default()).await;

    let err = cache.reader("users").await.unwrap_err();
    assert!(err.is_construction());
    assert!(err.to_string().contains("reader on table prod.users"));

    connector.clear_faults();
    cache.reader("users").await.unwrap();
    assert_eq!(connector.opened(ResourceKind::Reader), 1);
    // The table opened for the first attempt was kept
    assert_eq!(connector.opened(ResourceKind::Table), 1);
}

#[tokio::test]
async fn test_invalidate_table_releases_both() {
    let connector = MemoryConnector::new().with_instance("prod", &["users", "orders"]);
    let cache = open(&connector, CacheConfig::default()).await;

    let reader = cache.reader("users").await.unwrap();
    let table = cache.table("users").await.unwrap();
    let other = cache.reader("orders").await.unwrap();

    cache.invalidate_table("users").await;

    assert!(reader.is_released());
    assert!(table.is_released());
    assert!(!other.is_released());
    assert_eq!(cache.table_names().await, vec!["orders".to_string()]);

    // Invalidating again is a no-op
    cache.invalidate_table("users").await;
    assert_eq!(connector.release_count(reader.id()), 1);
    assert_eq!(connector.release_count(table.id()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reader_opening_during_invalidate_table_is_dropped() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    let cache = Arc::new(open(&connector, CacheConfig::default()).await);
    let table = cache.table("users").await.unwrap();

    connector.set_open_delay(Some(Duration::from_millis(50)));
    let pending = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.reader("users").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    cache.invalidate_table("users").await;
    let result = pending.await.unwrap();

    // The reader finished opening on a released table; it must not be served
    assert!(result.unwrap_err().is_construction());
    assert!(table.is_released());
    assert_eq!(cache.reader_stats().await.entries, 0);
    assert_eq!(connector.opened(ResourceKind::Reader), 1);
    assert_eq!(connector.live(ResourceKind::Reader), 0);
    assert!(cache.table_names().await.is_empty());

    // The next request opens both afresh
    connector.set_open_delay(None);
    let reader = cache.reader("users").await.unwrap();
    assert!(!reader.is_released());
    assert_eq!(connector.opened(ResourceKind::Table), 2);
}

#[tokio::test]
async fn test_stop_releases_everything_once() {
    let connector = MemoryConnector::new().with_instance("prod", &["users", "orders"]);
    let cache = open(&connector, CacheConfig::default()).await;

    cache.reader("users").await.unwrap();
    cache.reader("orders").await.unwrap();

    cache.stop().await;
    assert!(!cache.is_open());
    assert_eq!(connector.live(ResourceKind::Reader), 0);
    assert_eq!(connector.live(ResourceKind::Table), 0);
    assert_eq!(connector.live(ResourceKind::Instance), 0);

    // Second stop does nothing
    cache.stop().await;
    assert_eq!(connector.release_calls(ResourceKind::Table), 2);
    assert_eq!(connector.release_calls(ResourceKind::Instance), 1);
}

#[tokio::test]
async fn test_get_after_stop_is_closed() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    let cache = open(&connector, CacheConfig::default()).await;
    cache.stop().await;

    let err = cache.table("users").await.unwrap_err();
    assert!(err.is_closed());
    assert_eq!(err.status_code(), 410);

    assert!(cache.reader("users").await.unwrap_err().is_closed());
    assert_eq!(connector.opened(ResourceKind::Table), 0);
    assert_eq!(connector.opened(ResourceKind::Reader), 0);
}

#[tokio::test]
async fn test_stop_survives_entry_release_failures() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    connector.fail_release(
        ResourceKind::Table,
        "users",
        StorageError::Io("connection reset".to_string()),
    );
    let cache = open(&connector, CacheConfig::default()).await;
    cache.reader("users").await.unwrap();

    cache.stop().await;

    assert_eq!(connector.release_calls(ResourceKind::Table), 1);
    assert_eq!(connector.released(ResourceKind::Reader), 1);
    assert_eq!(connector.released(ResourceKind::Instance), 1);
    assert_eq!(cache.table_stats().await.release_failures, 1);
}

#[tokio::test]
async fn test_stop_records_instance_release_failure() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    connector.fail_release(
        ResourceKind::Instance,
        "prod",
        StorageError::Io("zookeeper unreachable".to_string()),
    );
    let cache = open(&connector, CacheConfig::default()).await;
    cache.table("users").await.unwrap();

    // The failure is logged and recorded, never returned
    cache.stop().await;
    let err = cache.release_error().unwrap();
    assert!(matches!(err, CacheError::Release { .. }));
    assert!(err.to_string().contains("zookeeper unreachable"));

    // Entries were torn down before the instance release was attempted
    assert_eq!(connector.released(ResourceKind::Table), 1);
    assert_eq!(connector.release_calls(ResourceKind::Instance), 1);
    assert!(!cache.is_open());

    // A second stop does not retry the release
    cache.stop().await;
    assert_eq!(connector.release_calls(ResourceKind::Instance), 1);
}

#[tokio::test(start_paused = true)]
async fn test_load_in_flight_during_stop_leaves_nothing_open() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    connector.set_open_delay(Some(Duration::from_millis(50)));
    let cache = Arc::new(open(&connector, CacheConfig::default()).await);

    let pending = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.table("users").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    cache.stop().await;
    let result = pending.await.unwrap();

    // The instance was released underneath the open, so it fails
    assert!(result.is_err());
    assert_eq!(connector.live(ResourceKind::Table), 0);
    assert!(cache.table_names().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_readers_share_one_open() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    connector.set_open_delay(Some(Duration::from_millis(20)));
    let cache = open(&connector, CacheConfig::default()).await;

    let results = join_all((0..10).map(|_| cache.reader("users"))).await;
    let readers: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    assert!(readers.iter().all(|r| Arc::ptr_eq(r, &readers[0])));
    assert_eq!(connector.opened(ResourceKind::Table), 1);
    assert_eq!(connector.opened(ResourceKind::Reader), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_entries_expire() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    let config = CacheConfig::builder()
        .idle_timeout(Duration::from_secs(60))
        .enable_auto_cleanup(false)
        .build();
    let cache = open(&connector, config).await;

    let reader = cache.reader("users").await.unwrap();
    let table = cache.table("users").await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    let events = cache.cleanup_expired().await;

    let removed: usize = events.iter().map(|e| e.len()).sum();
    assert_eq!(removed, 2);
    assert!(reader.is_released());
    assert!(table.is_released());
    assert_eq!(cache.table_stats().await.evictions_ttl, 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_table_takes_its_reader() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    let config = CacheConfig::builder()
        .table_idle_timeout(Duration::from_secs(60))
        .reader_idle_timeout(Duration::from_secs(600))
        .build();
    let cache = open(&connector, config).await;

    let reader = cache.reader("users").await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    cache.cleanup_expired().await;

    assert!(reader.is_released());
    assert_eq!(connector.live(ResourceKind::Reader), 0);
    assert_eq!(connector.live(ResourceKind::Table), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reader_use_keeps_table_alive() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    let config = CacheConfig::builder()
        .table_idle_timeout(Duration::from_secs(60))
        .reader_idle_timeout(Duration::from_secs(600))
        .build();
    let cache = open(&connector, config).await;

    let reader = cache.reader("users").await.unwrap();
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(40)).await;
        cache.reader("users").await.unwrap();
        cache.cleanup_expired().await;
    }

    assert!(!reader.is_released());
    assert_eq!(connector.opened(ResourceKind::Table), 1);
    assert_eq!(connector.opened(ResourceKind::Reader), 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_cleanup() {
    let connector = MemoryConnector::new().with_instance("prod", &["users"]);
    let config = CacheConfig::builder()
        .idle_timeout(Duration::from_secs(30))
        .cleanup_interval(Duration::from_secs(10))
        .build();
    let cache = Arc::new(open(&connector, config.clone()).await);
    let task = cache.spawn_cleanup(config.cleanup_interval);

    let table = cache.table("users").await.unwrap();
    tokio::time::sleep(Duration::from_secs(45)).await;

    assert!(table.is_released());
    assert_eq!(connector.released(ResourceKind::Table), 1);

    cache.stop().await;
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_background_cleanup_ends_when_cache_dropped() {
    let connector = MemoryConnector::new().with_instance("prod", &[]);
    let cache = Arc::new(open(&connector, CacheConfig::default()).await);
    let task = cache.spawn_cleanup(Duration::from_secs(5));

    drop(cache);
    task.await.unwrap();
}
