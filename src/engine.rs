//! Engine facade.
//!
//! Owns the database handle, the remote collaborator, the connectivity
//! monitor, the reconciler and the status projector for one session, plus
//! the background tasks that tie them together:
//!
//! * auto-sync: reconciles on every offline to online edge and whenever a
//!   sync is requested (including after each record while online);
//! * health probe (optional): feeds connectivity from the remote health
//!   endpoint;
//! * realtime mirror (optional): applies remote change events.
//!
//! All tasks stop on [`SyncEngine::shutdown`].

use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Session, SyncConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::Result;
use crate::queue::{self, Mutation, OfflineMutationQueue, QueueEntry, QueueStatus};
use crate::realtime;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::remote::RemoteStore;
use crate::status::{StatusProjector, SyncStatus};

pub struct SyncEngine {
    db: Arc<DbState>,
    session: Session,
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<ConnectivityMonitor>,
    status: Arc<StatusProjector>,
    reconciler: Arc<Reconciler>,
    sync_requested: Arc<Notify>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build an engine. Entries left `syncing` by a previous run are moved
    /// to `failed`. Connectivity starts offline until the host or the health
    /// probe reports otherwise.
    pub fn new(
        db: Arc<DbState>,
        session: Session,
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        {
            let conn = db.conn.lock()?;
            queue::recover_interrupted(&conn)?;
        }

        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        let status = Arc::new(StatusProjector::new(Arc::clone(&db), connectivity.subscribe()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&db),
            Arc::clone(&remote),
            Arc::clone(&connectivity),
            Arc::clone(&status),
            config.step_timeout,
        ));

        info!(
            store_id = %session.store_id,
            device_id = %session.device_id,
            "Sync engine ready"
        );

        Ok(Self {
            db,
            session,
            config,
            remote,
            connectivity,
            status,
            reconciler,
            sync_requested: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn queue<T: Mutation>(&self) -> OfflineMutationQueue<T> {
        OfflineMutationQueue::new(Arc::clone(&self.db), self.session.clone())
    }

    /// Record a mutation, publish the new status and, when online, ask the
    /// auto-sync task for a pass.
    pub fn record<T: Mutation>(&self, mutation: &T) -> Result<QueueEntry> {
        let entry = self.queue::<T>().record(mutation)?;
        self.status.refresh();
        if self.connectivity.is_online() {
            self.request_sync();
        }
        Ok(entry)
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn set_online(&self, online: bool) {
        if self.connectivity.set_online(online) {
            self.status.refresh();
        }
    }

    /// Run a pass now and wait for it.
    pub async fn sync_now(&self) -> Result<ReconcileReport> {
        let report = self.reconciler.reconcile().await?;
        self.status.refresh();
        Ok(report)
    }

    /// Ask the auto-sync task for a pass without waiting.
    pub fn request_sync(&self) {
        self.sync_requested.notify_one();
    }

    pub fn status(&self) -> SyncStatus {
        self.status.refresh()
    }

    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn list_entries(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
        let conn = self.db.conn.lock()?;
        queue::list_entries(&conn, status)
    }

    /// Drop a pending or failed entry and its optimistic rows.
    pub fn discard(&self, client_ref: &str) -> Result<QueueEntry> {
        let entry = {
            let mut conn = self.db.conn.lock()?;
            queue::discard(&mut conn, client_ref)?
        };
        self.status.refresh();
        Ok(entry)
    }

    /// Delete synced entries older than the configured retention.
    pub fn prune_synced(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.config.synced_retention;
        let conn = self.db.conn.lock()?;
        queue::prune_synced(&conn, cutoff)
    }

    /// Pull reference data for the session's store into the mirror.
    pub async fn hydrate(&self) -> Result<usize> {
        realtime::hydrate(&self.db, self.remote.as_ref(), &self.session.store_id).await
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(e) => e.into_inner().push(handle),
        }
    }

    /// Start the auto-sync task. When already online, the first pass runs
    /// immediately so a backlog from an earlier run is not left waiting for
    /// the next connectivity change.
    pub fn start_auto_sync(&self) {
        let reconciler = Arc::clone(&self.reconciler);
        let connectivity = Arc::clone(&self.connectivity);
        let status = Arc::clone(&self.status);
        let requested = Arc::clone(&self.sync_requested);
        let cancel = self.cancel.clone();
        let mut online_rx = self.connectivity.subscribe();

        let handle = tokio::spawn(async move {
            info!("Auto-sync started");
            let mut drain_backlog = connectivity.is_online();
            loop {
                let run = if std::mem::take(&mut drain_backlog) {
                    info!("Online at start; draining queued entries");
                    true
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = online_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let online = *online_rx.borrow_and_update();
                            status.refresh();
                            if online {
                                info!("Network restored; resuming queued sync");
                            } else {
                                info!("Network offline; keeping queue pending");
                            }
                            online
                        }
                        _ = requested.notified() => connectivity.is_online(),
                    }
                };
                if !run {
                    continue;
                }
                match reconciler.reconcile().await {
                    Ok(report) if !report.is_empty() => {
                        info!(
                            synced = report.synced,
                            failed = report.failed,
                            deferred = report.deferred,
                            "Auto-sync pass finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Sync pass failed: {e}"),
                }
                status.refresh();
            }
            info!("Auto-sync stopped");
        });
        self.track(handle);
    }

    pub fn start_health_probe(&self) {
        let handle = self.connectivity.spawn_health_probe(
            Arc::clone(&self.remote),
            self.config.health_check_interval,
            self.cancel.clone(),
        );
        self.track(handle);
    }

    pub fn start_realtime(&self) {
        let status = Arc::clone(&self.status);
        let handle = realtime::spawn(
            Arc::clone(&self.db),
            Arc::clone(&self.remote),
            self.session.store_id.clone(),
            self.cancel.clone(),
            Arc::new(move || {
                status.refresh();
            }),
        );
        self.track(handle);
    }

    /// Cancel background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(e) => e.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {e}");
            }
        }
        info!("Sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::mutations::{InventoryAdjustment, SaleLine, SaleMutation};
    use crate::remote::{tables, MemoryRemote};
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> (SyncEngine, Arc<MemoryRemote>) {
        let db = Arc::new(db::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::new(
            db,
            Session::new("s1", "u1", "till-1"),
            SyncConfig::default(),
            remote.clone(),
        )
        .unwrap();
        (engine, remote)
    }

    #[tokio::test]
    async fn test_pending_count_follows_records_and_syncs() {
        let (engine, remote) = engine();
        remote.seed(
            tables::INVENTORY,
            vec![json!({ "id": "i1", "store_id": "s1", "product_id": "p1", "quantity": 50 })],
        );
        for _ in 0..4 {
            engine
                .record(&InventoryAdjustment::new("s1", "p1", 1, None))
                .unwrap();
        }
        assert_eq!(engine.status().pending_count, 4);

        remote.fail_next(
            "select",
            tables::INVENTORY,
            crate::remote::RemoteError::Http { status: 500, message: "boom".into() },
        );
        engine.set_online(true);
        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 3);

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.synced, 4);
        let status = engine.status();
        assert_eq!(status.pending_count, 0);
        assert!(!status.has_error);
        assert!(status.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn test_auto_sync_runs_on_reconnect() {
        let (engine, remote) = engine();
        remote.seed(
            tables::INVENTORY,
            vec![json!({ "id": "i1", "store_id": "s1", "product_id": "p1", "quantity": 5 })],
        );
        engine
            .record(&SaleMutation::new("s1", vec![SaleLine::new("p1", 2, 3.0)]))
            .unwrap();
        let mut status_rx = engine.status_receiver();
        engine.start_auto_sync();

        engine.set_online(true);
        tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|s| s.pending_count == 0 && s.is_online),
        )
        .await
        .expect("queue drained after reconnect")
        .unwrap();

        assert_eq!(remote.rows(tables::SALE_GROUPS).len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_sync_drains_backlog_when_started_online() {
        let (engine, remote) = engine();
        remote.seed(
            tables::INVENTORY,
            vec![json!({ "id": "i1", "store_id": "s1", "product_id": "p1", "quantity": 5 })],
        );
        engine
            .record(&InventoryAdjustment::new("s1", "p1", 2, None))
            .unwrap();
        engine.set_online(true);
        assert_eq!(engine.status().pending_count, 1);

        let mut status_rx = engine.status_receiver();
        engine.start_auto_sync();
        tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|s| s.pending_count == 0),
        )
        .await
        .expect("backlog drained without a connectivity change")
        .unwrap();
        assert_eq!(remote.rows(tables::INVENTORY)[0]["quantity"], 7);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_record_while_online_triggers_sync() {
        let (engine, remote) = engine();
        engine.set_online(true);
        engine.start_auto_sync();
        let mut status_rx = engine.status_receiver();

        engine
            .record(&InventoryAdjustment::new("s1", "p7", 3, None))
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|s| s.pending_count == 0 && s.last_sync_time.is_some()),
        )
        .await
        .expect("recorded entry synced")
        .unwrap();
        assert_eq!(remote.rows(tables::INVENTORY)[0]["quantity"], 3);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_interrupted_entries_recovered_on_open() {
        let db = Arc::new(db::open_in_memory().unwrap());
        let session = Session::new("s1", "u1", "till-1");
        let entry = OfflineMutationQueue::<InventoryAdjustment>::new(Arc::clone(&db), session.clone())
            .record(&InventoryAdjustment::new("s1", "p1", 1, None))
            .unwrap();
        {
            let conn = db.conn.lock().unwrap();
            queue::mark_syncing(&conn, entry.queue_id).unwrap();
        }

        let engine = SyncEngine::new(
            Arc::clone(&db),
            session,
            SyncConfig::default(),
            Arc::new(MemoryRemote::new()),
        )
        .unwrap();
        let failed = engine.list_entries(Some(QueueStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("interrupted"));
        let status = engine.status();
        assert!(status.has_error);
        assert_eq!(status.sync_error.as_deref(), Some("interrupted"));
    }

    #[tokio::test]
    async fn test_discard_updates_status() {
        let (engine, _remote) = engine();
        let entry = engine
            .record(&InventoryAdjustment::new("s1", "p1", 2, None))
            .unwrap();
        assert_eq!(engine.status().pending_count, 1);
        engine.discard(&entry.client_ref).unwrap();
        assert_eq!(engine.status().pending_count, 0);
        assert!(engine.list_entries(None).unwrap().is_empty());
    }
}
