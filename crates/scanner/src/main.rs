//! Headless sync pass: replay the device's offline queue against the backend once.

use std::sync::Arc;

use anyhow::Context;
use cylinder_observability::LogFormat;
use cylinder_scanner::backend::Backend;
use cylinder_scanner::{OfflineActionQueue, PostgrestBackend, ScannerConfig, SqliteStore, SyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = std::env::var("CYLINDER_LOG_FORMAT")
        .map(|name| LogFormat::from_name(&name))
        .unwrap_or_default();
    cylinder_observability::tracing::init(format);

    let config = ScannerConfig::from_env().context("reading CYLINDER_* configuration")?;
    let db_path = config
        .database_path
        .clone()
        .or_else(SqliteStore::default_path)
        .context("no data directory; set CYLINDER_DATA_DIR")?;
    tracing::info!(api_url = %config.api_url, db = %db_path.display(), "starting sync pass");

    let store = Arc::new(SqliteStore::new(db_path));
    let backend: Arc<dyn Backend> = Arc::new(
        PostgrestBackend::new(
            config.api_url.clone(),
            config.api_key.clone(),
            config.auth_token.clone(),
            config.request_timeout,
        )
        .context("building HTTP client")?,
    );

    let queue = OfflineActionQueue::new(store.clone()).with_max_bytes(config.queue_max_bytes);
    let restored = queue.load().await.context("loading offline queue")?;
    if restored == 0 {
        tracing::info!("offline queue is empty; nothing to sync");
        store.close().await;
        return Ok(());
    }

    backend.ping().await.context("backend unreachable")?;

    let report = SyncEngine::new(backend).sync_pending(&queue).await;
    let cleared = queue.clear_synced().await.context("compacting offline queue")?;
    tracing::info!(
        synced = report.synced,
        failed = report.failed,
        cleared,
        "sync pass complete"
    );
    for error in &report.errors {
        tracing::warn!(%error, "operation left pending");
    }

    store.close().await;
    Ok(())
}
