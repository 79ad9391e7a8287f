//! Checkpointed remote steps for one queue entry.
//!
//! Every remote call made while replaying a mutation goes through a
//! [`StepRunner`]. A call is bounded by the step timeout and abandoned as
//! soon as connectivity flips to offline. Completed write steps are stored in
//! the entry's `checkpoint` column, and creates look for an existing row with
//! the same `client_ref` first, so a retried entry resumes where it stopped.

use serde_json::{json, Map, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connectivity::wait_offline;
use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::mirror::{self, MirrorTable};
use crate::queue::{self, QueueEntry};
use crate::remote::{Filter, RemoteError, RemoteStore};

/// A temporary id that received its server id during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdRemap {
    pub table: MirrorTable,
    pub local_id: String,
    pub server_id: String,
}

/// What a successful replay hands back for the finalizing transaction.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub remaps: Vec<IdRemap>,
    pub confirmed: Vec<(MirrorTable, Value)>,
    pub removed: Vec<(MirrorTable, String)>,
}

pub struct StepRunner<'a> {
    db: &'a DbState,
    remote: &'a dyn RemoteStore,
    online: watch::Receiver<bool>,
    step_timeout: Duration,
    queue_id: i64,
    client_ref: String,
    checkpoint: Map<String, Value>,
    outcome: StepOutcome,
}

impl<'a> StepRunner<'a> {
    pub(crate) fn new(
        db: &'a DbState,
        remote: &'a dyn RemoteStore,
        online: watch::Receiver<bool>,
        step_timeout: Duration,
        entry: &QueueEntry,
    ) -> Self {
        let checkpoint = match &entry.checkpoint {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Self {
            db,
            remote,
            online,
            step_timeout,
            queue_id: entry.queue_id,
            client_ref: entry.client_ref.clone(),
            checkpoint,
            outcome: StepOutcome::default(),
        }
    }

    /// Idempotency reference of the entry being replayed.
    pub fn client_ref(&self) -> &str {
        &self.client_ref
    }

    pub(crate) fn finish(self) -> StepOutcome {
        self.outcome
    }

    /// Map an id to its server id. Temporary ids resolve through ids remapped
    /// earlier in this replay, then through `id_map`.
    pub fn resolve(&self, id: &str) -> Result<String> {
        if !mirror::is_local_id(id) {
            return Ok(id.to_string());
        }
        if let Some(remap) = self.outcome.remaps.iter().find(|r| r.local_id == id) {
            return Ok(remap.server_id.clone());
        }
        let conn = self.db.conn.lock()?;
        mirror::resolve_id(&conn, id)?.ok_or_else(|| SyncError::UnresolvedReference(id.to_string()))
    }

    pub fn resolve_opt(&self, id: Option<&str>) -> Result<Option<String>> {
        id.map(|id| self.resolve(id)).transpose()
    }

    /// Record that `local_id` is now known remotely as `server_id`.
    pub fn remap(&mut self, table: MirrorTable, local_id: &str, server_id: &str) {
        if local_id == server_id {
            return;
        }
        self.outcome.remaps.push(IdRemap {
            table,
            local_id: local_id.to_string(),
            server_id: server_id.to_string(),
        });
    }

    /// Run one remote call under the step timeout, racing connectivity.
    async fn guarded<R>(
        &self,
        step: &str,
        call: impl Future<Output = std::result::Result<R, RemoteError>> + Send,
    ) -> Result<R> {
        let mut online = self.online.clone();
        let is_online = *online.borrow_and_update();
        if !is_online {
            return Err(SyncError::step(step, RemoteError::Offline));
        }
        let timeout_secs = self.step_timeout.as_secs();
        tokio::select! {
            result = tokio::time::timeout(self.step_timeout, call) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(SyncError::step(step, e)),
                Err(_) => {
                    warn!(step, "Remote step timed out after {timeout_secs}s");
                    Err(SyncError::step(step, RemoteError::Timeout(timeout_secs)))
                }
            },
            _ = wait_offline(&mut online) => {
                info!(step, "Connectivity lost during remote step; aborting");
                Err(SyncError::step(step, RemoteError::Offline))
            }
        }
    }

    fn completed(&self, step: &str) -> Option<Value> {
        self.checkpoint.get(step).cloned()
    }

    fn complete(&mut self, step: &str, value: Value) -> Result<()> {
        self.checkpoint.insert(step.to_string(), value);
        let conn = self.db.conn.lock()?;
        queue::save_checkpoint(&conn, self.queue_id, &Value::Object(self.checkpoint.clone()))
    }

    /// Create a row exactly once. The step is skipped if already checkpointed;
    /// otherwise a remote row carrying the same `client_ref` is reused before
    /// anything is inserted. Returns the stored remote row.
    pub async fn insert_once(
        &mut self,
        step: &str,
        table: MirrorTable,
        client_ref: &str,
        row: Value,
    ) -> Result<Value> {
        if let Some(done) = self.completed(step) {
            debug!(step, "Step already completed; reusing checkpoint");
            self.outcome.confirmed.push((table, done.clone()));
            return Ok(done);
        }

        let mut row = row;
        if let Value::Object(fields) = &mut row {
            fields.insert("client_ref".into(), Value::String(client_ref.to_string()));
        }

        let remote = self.remote;
        let existing = self
            .guarded(
                step,
                remote.select(table.remote_name(), &[Filter::eq("client_ref", client_ref)]),
            )
            .await?;

        let stored = match existing.into_iter().next() {
            Some(found) => {
                info!(step, client_ref, "Remote row already exists; skipping insert");
                found
            }
            None => self.guarded(step, remote.insert(table.remote_name(), row)).await?,
        };
        if row_id(&stored).is_none() {
            return Err(SyncError::step(
                step,
                RemoteError::InvalidResponse(format!("{} row without id", table.remote_name())),
            ));
        }

        self.complete(step, stored.clone())?;
        self.outcome.confirmed.push((table, stored.clone()));
        Ok(stored)
    }

    /// Update a row by id. Returns the updated rows (empty if the row no
    /// longer exists remotely).
    pub async fn update(
        &mut self,
        step: &str,
        table: MirrorTable,
        id: &str,
        changes: Value,
    ) -> Result<Vec<Value>> {
        if let Some(done) = self.completed(step) {
            let rows = as_rows(done);
            self.confirm_all(table, &rows);
            return Ok(rows);
        }
        let remote = self.remote;
        let rows = self
            .guarded(
                step,
                remote.update(table.remote_name(), &[Filter::eq("id", id)], changes),
            )
            .await?;
        self.complete(step, Value::Array(rows.clone()))?;
        self.confirm_all(table, &rows);
        Ok(rows)
    }

    pub async fn delete(&mut self, step: &str, table: MirrorTable, id: &str) -> Result<()> {
        if self.completed(step).is_none() {
            let remote = self.remote;
            let removed = self
                .guarded(step, remote.delete(table.remote_name(), &[Filter::eq("id", id)]))
                .await?;
            self.complete(step, Value::Array(removed))?;
        }
        self.outcome.removed.push((table, id.to_string()));
        Ok(())
    }

    /// Read rows. Reads are never checkpointed.
    pub async fn select(
        &mut self,
        step: &str,
        table: MirrorTable,
        filters: &[Filter],
    ) -> Result<Vec<Value>> {
        let remote = self.remote;
        self.guarded(step, remote.select(table.remote_name(), filters)).await
    }

    /// Add `delta` to a numeric column of the first row matching `filters`.
    ///
    /// The current value is read from the remote at apply time, so the write
    /// is `remote_value + delta` whatever the local cache says. Returns
    /// `None` when no row matches.
    ///
    /// The absolute target is checkpointed before the write is sent. A retry
    /// after an unconfirmed write sends that same target again instead of
    /// adding `delta` to a value that may already include it.
    pub async fn adjust_number(
        &mut self,
        step: &str,
        table: MirrorTable,
        filters: Vec<Filter>,
        column: &str,
        delta: f64,
    ) -> Result<Option<Value>> {
        if let Some(done) = self.completed(step) {
            self.outcome.confirmed.push((table, done.clone()));
            return Ok(Some(done));
        }

        let pending_key = format!("{step}:target");
        let (id, target) = match self.completed(&pending_key).and_then(|p| pending_target(&p)) {
            Some((id, target)) => {
                info!(step, id = %id, "Resending unconfirmed adjustment with its recorded target");
                (id, target)
            }
            None => {
                let remote = self.remote;
                let rows = self
                    .guarded(step, remote.select(table.remote_name(), &filters))
                    .await?;
                let Some(current) = rows.into_iter().next() else {
                    return Ok(None);
                };
                let Some(id) = row_id(&current) else {
                    return Err(SyncError::step(
                        step,
                        RemoteError::InvalidResponse(format!(
                            "{} row without id",
                            table.remote_name()
                        )),
                    ));
                };
                let before = current.get(column).and_then(Value::as_f64).unwrap_or(0.0);
                let target = number_value(before + delta);
                self.complete(
                    &pending_key,
                    json!({ "id": id, "before": number_value(before), "target": target }),
                )?;
                (id, target)
            }
        };

        let mut changes = Map::new();
        changes.insert(column.to_string(), target);

        let remote = self.remote;
        let updated = self
            .guarded(
                step,
                remote.update(
                    table.remote_name(),
                    &[Filter::eq("id", id.as_str())],
                    Value::Object(changes),
                ),
            )
            .await?;
        let Some(row) = updated.into_iter().next() else {
            return Ok(None);
        };

        self.checkpoint.remove(&pending_key);
        self.complete(step, row.clone())?;
        self.outcome.confirmed.push((table, row.clone()));
        Ok(Some(row))
    }

    fn confirm_all(&mut self, table: MirrorTable, rows: &[Value]) {
        for row in rows {
            self.outcome.confirmed.push((table, row.clone()));
        }
    }
}

/// Server id of a remote row, as text.
pub fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pending_target(pending: &Value) -> Option<(String, Value)> {
    let id = pending.get("id")?.as_str()?.to_string();
    let target = pending.get("target").filter(|t| t.is_number())?.clone();
    Some((id, target))
}

/// Integral results stay integers so stock counts do not turn into floats.
fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn as_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Session;
    use crate::db;
    use crate::mutations::InventoryAdjustment;
    use crate::queue::OfflineMutationQueue;
    use crate::remote::{tables, MemoryRemote};
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        db: Arc<DbState>,
        remote: MemoryRemote,
        online: watch::Sender<bool>,
        entry: QueueEntry,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(db::open_in_memory().unwrap());
        let queue: OfflineMutationQueue<InventoryAdjustment> =
            OfflineMutationQueue::new(Arc::clone(&db), Session::new("s1", "u1", "d1"));
        let entry = queue
            .record(&InventoryAdjustment::new("s1", "p1", 1, None))
            .unwrap();
        {
            let conn = db.conn.lock().unwrap();
            queue::mark_syncing(&conn, entry.queue_id).unwrap();
        }
        let (online, _) = watch::channel(true);
        Fixture {
            db,
            remote: MemoryRemote::new(),
            online,
            entry,
        }
    }

    fn runner(f: &Fixture) -> StepRunner<'_> {
        StepRunner::new(
            &f.db,
            &f.remote,
            f.online.subscribe(),
            Duration::from_secs(5),
            &f.entry,
        )
    }

    #[tokio::test]
    async fn test_insert_once_reuses_row_with_same_client_ref() {
        let f = fixture();
        f.remote.seed(
            tables::SALE_GROUPS,
            vec![json!({ "id": "g-1", "client_ref": "ref-1", "store_id": "s1" })],
        );
        let mut steps = runner(&f);
        let row = steps
            .insert_once("sale_group", MirrorTable::SaleGroups, "ref-1", json!({ "store_id": "s1" }))
            .await
            .unwrap();
        assert_eq!(row["id"], "g-1");
        assert!(f.remote.calls().iter().all(|c| c.op != "insert"));
        assert_eq!(f.remote.rows(tables::SALE_GROUPS).len(), 1);
    }

    #[tokio::test]
    async fn test_checkpointed_step_is_not_repeated() {
        let f = fixture();
        let mut steps = runner(&f);
        steps
            .insert_once("debt", MirrorTable::Debts, "ref-2", json!({ "store_id": "s1" }))
            .await
            .unwrap();

        let reloaded = {
            let conn = f.db.conn.lock().unwrap();
            queue::get_entry(&conn, &f.entry.client_ref).unwrap().unwrap()
        };
        assert!(reloaded.checkpoint.get("debt").is_some());

        let calls_before = f.remote.calls().len();
        let mut retry = StepRunner::new(
            &f.db,
            &f.remote,
            f.online.subscribe(),
            Duration::from_secs(5),
            &reloaded,
        );
        retry
            .insert_once("debt", MirrorTable::Debts, "ref-2", json!({ "store_id": "s1" }))
            .await
            .unwrap();
        assert_eq!(f.remote.calls().len(), calls_before);
        assert_eq!(f.remote.rows(tables::DEBTS).len(), 1);
    }

    #[tokio::test]
    async fn test_adjust_number_reads_remote_value() {
        let f = fixture();
        f.remote.seed(
            tables::INVENTORY,
            vec![json!({ "id": "inv-1", "store_id": "s1", "product_id": "p1", "quantity": 20 })],
        );
        let mut steps = runner(&f);
        let row = steps
            .adjust_number(
                "stock",
                MirrorTable::Inventory,
                vec![Filter::eq("store_id", "s1"), Filter::eq("product_id", "p1")],
                "quantity",
                -3.0,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["quantity"], 17);

        let missing = steps
            .adjust_number(
                "stock:missing",
                MirrorTable::Inventory,
                vec![Filter::eq("product_id", "nope")],
                "quantity",
                1.0,
            )
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_adjust_number_resends_recorded_target_after_lost_response() {
        let f = fixture();
        f.remote.seed(
            tables::INVENTORY,
            vec![json!({ "id": "inv-1", "store_id": "s1", "product_id": "p1", "quantity": 10 })],
        );
        f.remote
            .lose_next_response("update", tables::INVENTORY, RemoteError::Timeout(5));
        let filters = vec![Filter::eq("store_id", "s1"), Filter::eq("product_id", "p1")];

        let mut steps = runner(&f);
        let err = steps
            .adjust_number("stock", MirrorTable::Inventory, filters.clone(), "quantity", -3.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::SyncStep { source: RemoteError::Timeout(_), .. }
        ));
        assert_eq!(f.remote.rows(tables::INVENTORY)[0]["quantity"], 7);

        let reloaded = {
            let conn = f.db.conn.lock().unwrap();
            queue::get_entry(&conn, &f.entry.client_ref).unwrap().unwrap()
        };
        assert_eq!(reloaded.checkpoint["stock:target"]["target"], 7);

        let mut retry = StepRunner::new(
            &f.db,
            &f.remote,
            f.online.subscribe(),
            Duration::from_secs(5),
            &reloaded,
        );
        let row = retry
            .adjust_number("stock", MirrorTable::Inventory, filters, "quantity", -3.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["quantity"], 7);
        assert_eq!(f.remote.rows(tables::INVENTORY)[0]["quantity"], 7);

        let done = {
            let conn = f.db.conn.lock().unwrap();
            queue::get_entry(&conn, &f.entry.client_ref).unwrap().unwrap()
        };
        assert!(done.checkpoint.get("stock:target").is_none());
        assert_eq!(done.checkpoint["stock"]["quantity"], 7);
    }

    #[tokio::test]
    async fn test_offline_aborts_before_call() {
        let f = fixture();
        f.online.send_replace(false);
        let mut steps = runner(&f);
        let err = steps
            .select("read", MirrorTable::Products, &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::SyncStep { source: RemoteError::Offline, .. }
        ));
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let f = fixture();
        f.remote.set_stalled(true);
        let mut steps = StepRunner::new(
            &f.db,
            &f.remote,
            f.online.subscribe(),
            Duration::from_millis(20),
            &f.entry,
        );
        let err = steps
            .select("read", MirrorTable::Products, &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::SyncStep { source: RemoteError::Timeout(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_resolve_unmapped_local_id_fails() {
        let f = fixture();
        let mut steps = runner(&f);
        let local = mirror::new_local_id();
        assert!(matches!(
            steps.resolve(&local),
            Err(SyncError::UnresolvedReference(_))
        ));
        steps.remap(MirrorTable::Products, &local, "srv-7");
        assert_eq!(steps.resolve(&local).unwrap(), "srv-7");
        assert_eq!(steps.resolve("srv-1").unwrap(), "srv-1");
    }
}
