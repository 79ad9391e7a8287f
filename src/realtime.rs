//! Remote change feed into the mirror cache.
//!
//! Pushed rows always win over cached ones. A pushed row whose `client_ref`
//! matches a local optimistic row takes its place, so a sale recorded here
//! and confirmed by another path never shows up twice.

use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::mirror::{self, MirrorTable};
use crate::remote::{ChangeEvent, Filter, RemoteStore};

/// Tables pulled by [`hydrate`].
const HYDRATE_TABLES: [MirrorTable; 5] = [
    MirrorTable::Stores,
    MirrorTable::Customers,
    MirrorTable::Products,
    MirrorTable::Inventory,
    MirrorTable::Debts,
];

fn store_filter(table: MirrorTable, store_id: &str) -> Filter {
    if table == MirrorTable::Stores {
        Filter::eq("id", store_id)
    } else {
        Filter::eq("store_id", store_id)
    }
}

/// Initial pull of reference data for one store. Returns the number of rows
/// written.
pub async fn hydrate(db: &DbState, remote: &dyn RemoteStore, store_id: &str) -> Result<usize> {
    let mut written = 0;
    for table in HYDRATE_TABLES {
        let rows = remote
            .select(table.remote_name(), &[store_filter(table, store_id)])
            .await
            .map_err(|e| SyncError::step(format!("hydrate:{}", table.remote_name()), e))?;

        let mut conn = db.conn.lock()?;
        let tx = conn.transaction()?;
        for row in &rows {
            if mirror::upsert_remote(&tx, table, row)?.is_some() {
                written += 1;
            }
        }
        tx.commit()?;
        debug!(table = table.local_name(), rows = rows.len(), "Hydrated mirror table");
    }
    info!(store_id, written, "Mirror hydrated");
    Ok(written)
}

/// Apply one change event, logging rather than propagating failures.
pub fn apply_event(db: &DbState, event: &ChangeEvent) {
    let result = db
        .conn
        .lock()
        .map_err(SyncError::from)
        .and_then(|mut conn| {
            let tx = conn.transaction()?;
            mirror::apply_change(&tx, event)?;
            tx.commit()?;
            Ok(())
        });
    if let Err(e) = result {
        warn!(table = %event.table, "Failed to apply remote change: {e}");
    }
}

/// Subscribe to every mirrored table for `store_id` and apply events until
/// `cancel` fires. `on_change` runs after each applied event.
pub fn spawn(
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    store_id: String,
    cancel: CancellationToken,
    on_change: Arc<dyn Fn() + Send + Sync>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut feeds = JoinSet::new();
        for table in MirrorTable::ALL {
            let mut rx = remote.subscribe(
                table.remote_name(),
                vec![store_filter(table, &store_id)],
                cancel.clone(),
            );
            let db = Arc::clone(&db);
            let cancel = cancel.clone();
            let on_change = Arc::clone(&on_change);
            feeds.spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => event,
                    };
                    let Some(event) = event else { break };
                    apply_event(&db, &event);
                    on_change();
                }
            });
        }
        info!(store_id = %store_id, "Realtime mirror started");
        while feeds.join_next().await.is_some() {}
        info!("Realtime mirror stopped");
    })
}
