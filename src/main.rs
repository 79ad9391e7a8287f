//! Headless sync daemon for one store terminal.
//!
//! Reads `RETAIL_SYNC_*` environment variables, opens the local database,
//! pulls reference data, then keeps the queue draining until Ctrl-C.

use anyhow::{bail, Context};
use std::sync::Arc;
use tracing::{info, warn};

use retail_sync::config::mask_secret;
use retail_sync::remote::RestRemote;
use retail_sync::{db, diagnostics, init_logging, Session, SyncConfig, SyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = SyncConfig::from_env();
    let _log_guard = init_logging(&config.log_dir);
    info!("Starting retail-syncd v{}", env!("CARGO_PKG_VERSION"));

    let session = Session::from_env().context("failed to load terminal session")?;
    let db = Arc::new(db::init(&config.data_dir).context("failed to open local database")?);
    {
        let conn = db
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        config.apply_local_overrides(&conn);
    }

    if !config.is_configured() {
        bail!("remote store is not configured; set RETAIL_SYNC_REMOTE_URL and RETAIL_SYNC_API_KEY");
    }
    let (Some(url), Some(key)) = (config.remote_url.clone(), config.api_key.clone()) else {
        bail!("remote store is not configured");
    };
    info!(url = %url, key = %mask_secret(&key), "Using remote store");

    let remote = RestRemote::new(&url, key, &config.health_path, config.realtime_poll_interval)
        .context("failed to build remote client")?;
    let engine = SyncEngine::new(Arc::clone(&db), session, config, Arc::new(remote))
        .context("failed to start sync engine")?;

    match engine.prune_synced() {
        Ok(0) => {}
        Ok(pruned) => info!(pruned, "Pruned old synced queue entries"),
        Err(e) => warn!("Failed to prune synced entries: {e}"),
    }
    match diagnostics::snapshot(&db) {
        Ok(snap) => info!(queue = %snap["queue"], "Queue state at startup"),
        Err(e) => warn!("Failed to collect diagnostics: {e}"),
    }

    // Offline start is normal; the mirror keeps its last known state.
    if let Err(e) = engine.hydrate().await {
        warn!("Initial hydrate failed: {e}");
    }

    engine.start_health_probe();
    engine.start_auto_sync();
    engine.start_realtime();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    engine.shutdown().await;
    Ok(())
}
