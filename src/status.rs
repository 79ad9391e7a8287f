//! UI-facing sync counters derived from the queue.

use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use crate::db::DbState;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Entries not yet synced: pending, syncing and failed.
    pub pending_count: i64,
    pub failed_count: i64,
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<String>,
    pub has_error: bool,
    pub sync_error: Option<String>,
}

/// Compute the status from queue contents.
pub fn compute(conn: &Connection, is_online: bool) -> Result<SyncStatus> {
    let (pending_count, failed_count, syncing_count, errored_count, last_sync_time): (
        i64,
        i64,
        i64,
        i64,
        Option<String>,
    ) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN status != 'synced' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'syncing' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'failed' AND attempts > 0 THEN 1 ELSE 0 END), 0),
            MAX(synced_at)
         FROM offline_queue",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
    )?;

    let sync_error: Option<String> = if errored_count > 0 {
        conn.query_row(
            "SELECT last_error FROM offline_queue
             WHERE status = 'failed' AND last_error IS NOT NULL
             ORDER BY updated_at DESC, queue_id DESC
             LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok()
    } else {
        None
    };

    Ok(SyncStatus {
        pending_count,
        failed_count,
        is_online,
        is_syncing: syncing_count > 0,
        last_sync_time,
        has_error: errored_count > 0,
        sync_error,
    })
}

/// Publishes [`SyncStatus`] snapshots to any number of watchers.
pub struct StatusProjector {
    db: Arc<DbState>,
    online: watch::Receiver<bool>,
    tx: watch::Sender<SyncStatus>,
}

impl StatusProjector {
    pub fn new(db: Arc<DbState>, online: watch::Receiver<bool>) -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        let projector = Self { db, online, tx };
        projector.refresh();
        projector
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Recompute and publish. Watchers are only woken when the snapshot
    /// changed. A storage error keeps the previous snapshot.
    pub fn refresh(&self) -> SyncStatus {
        let is_online = *self.online.borrow();
        let computed = match self.db.conn.lock() {
            Ok(conn) => compute(&conn, is_online),
            Err(e) => Err(e.into()),
        };
        match computed {
            Ok(status) => {
                self.tx.send_if_modified(|current| {
                    if *current == status {
                        false
                    } else {
                        *current = status.clone();
                        true
                    }
                });
                status
            }
            Err(e) => {
                warn!("Failed to compute sync status: {e}");
                self.current()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::params;

    fn insert(
        conn: &Connection,
        client_ref: &str,
        status: &str,
        attempts: i64,
        error: Option<&str>,
        synced_at: Option<&str>,
    ) {
        conn.execute(
            "INSERT INTO offline_queue (client_ref, entity_type, operation, entity_id, store_id,
                status, attempts, last_error, payload, payload_digest, created_at, updated_at, synced_at)
             VALUES (?1, 'sale', 'create', 'e', 's1', ?2, ?3, ?4, '{}', 'x', ?5, ?5, ?6)",
            params![client_ref, status, attempts, error, "2026-01-01T00:00:00Z", synced_at],
        )
        .unwrap();
    }

    #[test]
    fn test_empty_queue() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        let status = compute(&conn, true).unwrap();
        assert_eq!(
            status,
            SyncStatus {
                is_online: true,
                ..SyncStatus::default()
            }
        );
    }

    #[test]
    fn test_counts_by_status() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        insert(&conn, "a", "pending", 0, None, None);
        insert(&conn, "b", "syncing", 0, None, None);
        insert(&conn, "c", "failed", 2, Some("HTTP 500"), None);
        insert(&conn, "d", "synced", 1, None, Some("2026-01-02T00:00:00Z"));
        insert(&conn, "e", "synced", 1, None, Some("2026-01-03T00:00:00Z"));

        let status = compute(&conn, false).unwrap();
        assert_eq!(status.pending_count, 3);
        assert_eq!(status.failed_count, 1);
        assert!(status.is_syncing);
        assert!(status.has_error);
        assert_eq!(status.sync_error.as_deref(), Some("HTTP 500"));
        assert_eq!(status.last_sync_time.as_deref(), Some("2026-01-03T00:00:00Z"));
        assert!(!status.is_online);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(SyncStatus::default()).unwrap();
        assert!(json.get("pendingCount").is_some());
        assert!(json.get("lastSyncTime").is_some());
        assert!(json.get("syncError").is_some());
    }

    #[tokio::test]
    async fn test_projector_publishes_changes() {
        let db = Arc::new(db::open_in_memory().unwrap());
        let (_online_tx, online_rx) = watch::channel(true);
        let projector = StatusProjector::new(Arc::clone(&db), online_rx);
        let mut rx = projector.subscribe();
        assert_eq!(projector.current().pending_count, 0);

        insert(&db.conn.lock().unwrap(), "a", "pending", 0, None, None);
        projector.refresh();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().pending_count, 1);

        projector.refresh();
        assert!(!rx.has_changed().unwrap());
    }
}
