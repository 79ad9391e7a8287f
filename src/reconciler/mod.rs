//! Sync reconciler.
//!
//! Drains the offline queue against the remote store, one entry at a time in
//! `queue_id` order. Each entry is claimed (`syncing`), its payload checked
//! against the recorded digest, replayed through a [`StepRunner`], and then
//! finalized in a single local transaction: id remaps, local id rewrites,
//! confirmed rows (remote wins) and the `synced` transition.
//!
//! A failed entry is marked `failed` with `attempts + 1`. Entity keys it
//! touched are blocked for the rest of the pass, so later entries for the
//! same entity wait instead of overtaking it.

mod steps;

pub use steps::{row_id, IdRemap, StepOutcome, StepRunner};

use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::mirror;
use crate::mutations::{
    DebtMutation, InventoryAdjustment, ProductMutation, SaleGroupMutation, SaleMutation,
};
use crate::queue::{self, EntityType, Mutation, QueueEntry};
use crate::remote::{RemoteError, RemoteStore};
use crate::status::StatusProjector;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub synced: usize,
    pub failed: usize,
    /// Entries held back because an earlier entry for the same entity failed.
    pub deferred: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.synced == 0 && self.failed == 0 && self.deferred == 0
    }
}

pub struct Reconciler {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<ConnectivityMonitor>,
    status: Arc<StatusProjector>,
    step_timeout: Duration,
    running: AtomicBool,
}

/// Clears the running flag however the pass ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Reconciler {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<ConnectivityMonitor>,
        status: Arc<StatusProjector>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            db,
            remote,
            connectivity,
            status,
            step_timeout,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one pass over the queue.
    ///
    /// Returns an empty report when a pass is already running or the monitor
    /// reports offline. Only local storage failures are returned as errors;
    /// remote failures are recorded on the entries.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            debug!("Reconcile already in progress; skipping");
            return Ok(ReconcileReport::default());
        }
        let _guard = RunningGuard(&self.running);

        if !self.connectivity.is_online() {
            debug!("Offline; deferring reconcile");
            return Ok(ReconcileReport::default());
        }

        let entries = {
            let conn = self.db.conn.lock()?;
            queue::load_drainable(&conn)?
        };
        if entries.is_empty() {
            return Ok(ReconcileReport::default());
        }
        info!(count = entries.len(), "Starting sync pass");

        let mut report = ReconcileReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in entries {
            if !self.connectivity.is_online() {
                info!("Network offline; keeping remaining queue entries pending");
                break;
            }

            let keys = touched_keys(&entry).unwrap_or_default();
            if keys.iter().any(|k| blocked.contains(k)) {
                debug!(
                    client_ref = %entry.client_ref,
                    "Deferring entry behind an earlier failure for the same entity"
                );
                report.deferred += 1;
                continue;
            }

            let claimed = {
                let conn = self.db.conn.lock()?;
                queue::mark_syncing(&conn, entry.queue_id)?
            };
            if !claimed {
                continue;
            }
            self.status.refresh();

            match self.sync_entry(&entry).await {
                Ok(()) => {
                    report.synced += 1;
                    debug!(
                        entity = entry.entity_type.as_str(),
                        client_ref = %entry.client_ref,
                        "Queue entry synced"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    let message = e.to_string();
                    warn!(
                        entity = entry.entity_type.as_str(),
                        client_ref = %entry.client_ref,
                        attempt = entry.attempts + 1,
                        "Queue entry failed to sync: {message}"
                    );
                    if let Err(record_err) = self.record_failure(&entry, &message) {
                        error!(
                            client_ref = %entry.client_ref,
                            "Failed to record sync failure: {record_err}"
                        );
                    }
                    blocked.extend(keys);
                    if is_offline_error(&e) {
                        self.connectivity.set_online(false);
                    }
                }
            }
            self.status.refresh();
            tokio::task::yield_now().await;
        }

        info!(
            synced = report.synced,
            failed = report.failed,
            deferred = report.deferred,
            "Sync pass complete"
        );
        Ok(report)
    }

    fn record_failure(&self, entry: &QueueEntry, message: &str) -> Result<()> {
        let conn = self.db.conn.lock()?;
        queue::mark_failed(&conn, entry.queue_id, message)?;
        queue::append_log(&conn, entry, "failed", entry.attempts + 1, Some(message))
    }

    async fn sync_entry(&self, entry: &QueueEntry) -> Result<()> {
        match entry.entity_type {
            EntityType::Sale => self.replay::<SaleMutation>(entry).await,
            EntityType::SaleGroup => self.replay::<SaleGroupMutation>(entry).await,
            EntityType::InventoryAdjustment => self.replay::<InventoryAdjustment>(entry).await,
            EntityType::Debt => self.replay::<DebtMutation>(entry).await,
            EntityType::Product => self.replay::<ProductMutation>(entry).await,
        }
    }

    async fn replay<T: Mutation>(&self, entry: &QueueEntry) -> Result<()> {
        let mutation: T = entry.decode()?;
        let mut steps = StepRunner::new(
            &self.db,
            self.remote.as_ref(),
            self.connectivity.subscribe(),
            self.step_timeout,
            entry,
        );
        mutation.replay(&mut steps).await?;
        self.finalize(entry, steps.finish())
    }

    /// Apply the replay outcome locally and mark the entry synced, atomically.
    fn finalize(&self, entry: &QueueEntry, outcome: StepOutcome) -> Result<()> {
        let mut conn = self.db.conn.lock()?;
        let tx = conn.transaction()?;
        for remap in &outcome.remaps {
            mirror::record_id_mapping(
                &tx,
                &remap.local_id,
                &remap.server_id,
                remap.table,
                Some(&entry.client_ref),
            )?;
            mirror::rewrite_local_id(&tx, remap.table, &remap.local_id, &remap.server_id)?;
        }
        for (table, row) in &outcome.confirmed {
            mirror::upsert_remote(&tx, *table, row)?;
        }
        for (table, id) in &outcome.removed {
            mirror::delete_row(&tx, *table, id)?;
        }
        queue::mark_synced(&tx, entry.queue_id)?;
        queue::append_log(&tx, entry, "synced", entry.attempts + 1, None)?;
        tx.commit()?;
        Ok(())
    }
}

fn decode_keys<T: Mutation>(entry: &QueueEntry) -> Result<Vec<String>> {
    let mutation: T = serde_json::from_str(&entry.payload)?;
    Ok(mutation.touched_keys())
}

/// Ordering keys of a queued entry, decoded from its payload.
fn touched_keys(entry: &QueueEntry) -> Result<Vec<String>> {
    match entry.entity_type {
        EntityType::Sale => decode_keys::<SaleMutation>(entry),
        EntityType::SaleGroup => decode_keys::<SaleGroupMutation>(entry),
        EntityType::InventoryAdjustment => decode_keys::<InventoryAdjustment>(entry),
        EntityType::Debt => decode_keys::<DebtMutation>(entry),
        EntityType::Product => decode_keys::<ProductMutation>(entry),
    }
}

fn is_offline_error(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::Offline
            | SyncError::SyncStep {
                source: RemoteError::Offline,
                ..
            }
    )
}
