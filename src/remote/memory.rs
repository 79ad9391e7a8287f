//! In-process remote store.
//!
//! Behaves like the hosted backend (server-assigned ids, `updated_at`
//! stamping, filtered CRUD, change broadcast) and adds the knobs needed to
//! exercise the reconciler: reachability, one-shot failure injection (before
//! or after the write lands), stalled calls, and a call log.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChangeEvent, ChangeKind, Filter, RemoteError, RemoteStore};

/// One recorded call against the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub op: &'static str,
    pub table: String,
    pub filters: Vec<Filter>,
    pub body: Option<Value>,
}

pub struct MemoryRemote {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    calls: Mutex<Vec<RemoteCall>>,
    failures: Mutex<Vec<(&'static str, String, RemoteError)>>,
    lost_responses: Mutex<Vec<(&'static str, String, RemoteError)>>,
    next_id: AtomicU64,
    reachable: AtomicBool,
    stalled: AtomicBool,
    stall_started: Notify,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            tables: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            lost_responses: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            stall_started: Notify::new(),
            changes,
        }
    }

    /// Insert rows directly, bypassing the call log and change feed.
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.entry(table.to_string()).or_default().extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every subsequent call hang until un-stalled calls are no longer
    /// awaited (the caller must abandon them).
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Resolves once a call has entered the stalled state.
    pub async fn wait_for_stall(&self) {
        self.stall_started.notified().await;
    }

    /// Fail the next `op` ("insert", "update", "delete", "select") on `table`.
    pub fn fail_next(&self, op: &'static str, table: &str, error: RemoteError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((op, table.to_string(), error));
    }

    /// Apply the next `op` on `table`, then report `error` instead of the
    /// result, as if the response was lost on the way back.
    pub fn lose_next_response(&self, op: &'static str, table: &str, error: RemoteError) {
        self.lost_responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((op, table.to_string(), error));
    }

    fn take_injected(
        list: &Mutex<Vec<(&'static str, String, RemoteError)>>,
        op: &'static str,
        table: &str,
    ) -> Option<RemoteError> {
        let mut list = list.lock().unwrap_or_else(|e| e.into_inner());
        list.iter()
            .position(|(o, t, _)| *o == op && t == table)
            .map(|idx| list.remove(idx).2)
    }

    fn lost_response(&self, op: &'static str, table: &str) -> Result<(), RemoteError> {
        match Self::take_injected(&self.lost_responses, op, table) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&self, op: &'static str, table: &str, filters: &[Filter], body: Option<&Value>) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RemoteCall {
                op,
                table: table.to_string(),
                filters: filters.to_vec(),
                body: body.cloned(),
            });
    }

    async fn gate(&self, op: &'static str, table: &str) -> Result<(), RemoteError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Offline);
        }
        if let Some(err) = Self::take_injected(&self.failures, op, table) {
            return Err(err);
        }
        if self.stalled.load(Ordering::SeqCst) {
            self.stall_started.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn publish(&self, table: &str, kind: ChangeKind, row: &Value) {
        // No subscribers is fine.
        let _ = self.changes.send(ChangeEvent {
            table: table.to_string(),
            kind,
            row: row.clone(),
        });
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

fn matches_all(row: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(row))
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, RemoteError> {
        self.record("insert", table, &[], Some(&row));
        self.gate("insert", table).await?;

        let Value::Object(mut fields) = row else {
            return Err(RemoteError::Http {
                status: 400,
                message: "row must be a JSON object".into(),
            });
        };
        if !fields.contains_key("id") {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            fields.insert("id".into(), Value::String(format!("srv-{id}")));
        }
        let now = Self::now();
        fields
            .entry("created_at")
            .or_insert_with(|| Value::String(now.clone()));
        fields.insert("updated_at".into(), Value::String(now));
        let stored = Value::Object(fields);

        {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            tables.entry(table.to_string()).or_default().push(stored.clone());
        }
        debug!(table, "memory remote insert");
        self.publish(table, ChangeKind::Insert, &stored);
        self.lost_response("insert", table)?;
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        changes: Value,
    ) -> Result<Vec<Value>, RemoteError> {
        self.record("update", table, filters, Some(&changes));
        self.gate("update", table).await?;

        let Value::Object(changes) = changes else {
            return Err(RemoteError::Http {
                status: 400,
                message: "changes must be a JSON object".into(),
            });
        };
        let now = Self::now();
        let updated: Vec<Value> = {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            let rows = tables.entry(table.to_string()).or_default();
            let mut updated = Vec::new();
            for row in rows.iter_mut().filter(|r| matches_all(r, filters)) {
                if let Value::Object(fields) = row {
                    for (k, v) in &changes {
                        fields.insert(k.clone(), v.clone());
                    }
                    fields.insert("updated_at".into(), Value::String(now.clone()));
                }
                updated.push(row.clone());
            }
            updated
        };
        for row in &updated {
            self.publish(table, ChangeKind::Update, row);
        }
        self.lost_response("update", table)?;
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, RemoteError> {
        self.record("delete", table, filters, None);
        self.gate("delete", table).await?;

        let removed: Vec<Value> = {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            let rows = tables.entry(table.to_string()).or_default();
            let (removed, kept): (Vec<Value>, Vec<Value>) =
                rows.drain(..).partition(|r| matches_all(r, filters));
            *rows = kept;
            removed
        };
        for row in &removed {
            self.publish(table, ChangeKind::Delete, row);
        }
        self.lost_response("delete", table)?;
        Ok(removed)
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, RemoteError> {
        self.record("select", table, filters, None);
        self.gate("select", table).await?;

        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| matches_all(r, filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn subscribe(
        &self,
        table: &str,
        filters: Vec<Filter>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(256);
        let mut changes = self.changes.subscribe();
        let table = table.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = changes.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if event.table != table || !matches_all(&event.row, &filters) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(table = %table, skipped, "memory change feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Offline)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_id_and_update_merges() {
        let remote = MemoryRemote::new();
        let row = remote
            .insert("dynamic_inventory", json!({ "product_id": "p1", "store_id": "s1", "quantity": 5 }))
            .await
            .unwrap();
        assert_eq!(row["id"], "srv-1");
        assert!(row.get("updated_at").is_some());

        let updated = remote
            .update(
                "dynamic_inventory",
                &[Filter::eq("product_id", "p1")],
                json!({ "quantity": 3 }),
            )
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["quantity"], 3);
        assert_eq!(remote.rows("dynamic_inventory")[0]["quantity"], 3);
    }

    #[tokio::test]
    async fn test_unreachable_and_injected_failures() {
        let remote = MemoryRemote::new();
        remote.set_reachable(false);
        assert_eq!(
            remote.select("stores", &[]).await.unwrap_err(),
            RemoteError::Offline
        );

        remote.set_reachable(true);
        remote.fail_next(
            "insert",
            "sale_groups",
            RemoteError::Http { status: 500, message: "boom".into() },
        );
        assert!(remote.insert("sale_groups", json!({})).await.is_err());
        assert!(remote.insert("sale_groups", json!({})).await.is_ok());
        assert_eq!(remote.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_table_and_store() {
        let remote = MemoryRemote::new();
        let cancel = CancellationToken::new();
        let mut rx = remote.subscribe(
            "dynamic_product",
            vec![Filter::eq("store_id", "s1")],
            cancel.clone(),
        );

        remote.insert("dynamic_product", json!({ "store_id": "s2", "name": "other" })).await.unwrap();
        remote.insert("customers", json!({ "store_id": "s1" })).await.unwrap();
        remote.insert("dynamic_product", json!({ "store_id": "s1", "name": "mine" })).await.unwrap();

        let event = rx.recv().await.expect("event");
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.row["name"], "mine");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_lost_response_still_applies_write() {
        let remote = MemoryRemote::new();
        remote.seed("debts", vec![json!({ "id": "d1", "amount_paid": 5 })]);
        remote.lose_next_response("update", "debts", RemoteError::Timeout(5));

        let err = remote
            .update("debts", &[Filter::eq("id", "d1")], json!({ "amount_paid": 8 }))
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::Timeout(5));
        assert_eq!(remote.rows("debts")[0]["amount_paid"], 8);
    }

    #[tokio::test]
    async fn test_delete_removes_matching_rows() {
        let remote = MemoryRemote::new();
        remote.seed("debts", vec![json!({ "id": "d1" }), json!({ "id": "d2" })]);
        let removed = remote.delete("debts", &[Filter::eq("id", "d1")]).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(remote.rows("debts"), vec![json!({ "id": "d2" })]);
    }
}
