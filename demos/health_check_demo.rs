//! Health Check Demo Application
//!
//! Opens an in-memory instance, exercises the table and reader caches, breaks
//! a table behind the cache's back and prints what the health sweep reports.
//!
//! Usage:
//!   cargo run --example health_check_demo
//!
//! Environment variables (a `.env` file is honoured):
//!   RUST_LOG                          - log filter (default: ouroboros_tablecache=info)
//!   TABLECACHE_TABLE_IDLE_SECS        - table idle timeout
//!   TABLECACHE_READER_IDLE_SECS       - reader idle timeout
//!   TABLECACHE_CLEANUP_INTERVAL_SECS  - background sweep interval
//!   TABLECACHE_AUTO_CLEANUP           - enable the background sweep

use ouroboros_tablecache::{CacheConfig, InstanceRegistry, InstanceUri, MemoryConnector};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ouroboros_tablecache=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Table Cache Health Check Demo ===");

    let config = CacheConfig::from_env()?;
    info!("Configuration: {}", serde_json::to_string(&config)?);

    let connector = MemoryConnector::new()
        .with_instance("prod", &["users", "orders"])
        .with_instance("staging", &["users"]);
    connector.put_row("prod", "users", b"alice", b"admin");

    let cluster = InstanceUri::parse("memory://local/prod")?;
    let registry = InstanceRegistry::new(connector.clone(), cluster, config)?;

    info!("\n--- Warm caches ---");
    let reader = registry.reader("prod", "users").await?;
    let row = reader.get(b"alice")?;
    info!("prod.users[alice] = {:?}", row.map(|v| String::from_utf8_lossy(&v).into_owned()));
    registry.reader("prod", "orders").await?;
    registry.table("staging", "users").await?;

    let prod = registry.instance("prod").await?;
    info!("Table stats for prod: {}", prod.table_stats().await);
    info!("Reader stats for prod: {}", prod.reader_stats().await);

    info!("\n--- Healthy sweep ---");
    for (instance, issues) in registry.check_health().await {
        info!("{}: {} issues", instance, issues.len());
    }

    info!("\n--- Drop prod.orders behind the cache ---");
    connector.drop_table("prod", "orders");
    let report = prod.health_report().await;
    info!(
        "Status: {:?} (HTTP {}), response time {}ms",
        report.status,
        report.status.to_http_status_code(),
        report.response_time_ms
    );
    for message in report.messages() {
        info!("  ✗ {}", message);
    }

    info!("\n--- Invalidate the broken table ---");
    registry.invalidate_table("prod", "orders").await;
    info!("prod healthy again: {}", prod.health_report().await.is_healthy());

    info!("\n--- Shutdown ---");
    let unclean = registry.stop().await;
    info!("Registry stopped ({} instances not released cleanly)", unclean);
    let issues = prod.check_health().await;
    info!("After stop: {:?}", issues);

    Ok(())
}
