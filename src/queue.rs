//! Offline mutation queue.
//!
//! Every locally initiated write becomes exactly one row in `offline_queue`
//! with a client-generated `client_ref`, a frozen JSON payload and status
//! `pending`. The optimistic mirror update is written in the same
//! transaction, so a mutation is either fully recorded or not at all.
//!
//! One generic [`OfflineMutationQueue`] serves every mutation kind; the
//! kind-agnostic helpers below are shared with the reconciler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Session;
use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::mirror;
use crate::reconciler::StepRunner;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Sale,
    SaleGroup,
    InventoryAdjustment,
    Debt,
    Product,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Sale => "sale",
            EntityType::SaleGroup => "sale_group",
            EntityType::InventoryAdjustment => "inventory_adjustment",
            EntityType::Debt => "debt",
            EntityType::Product => "product",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sale" | "sales" => Some(EntityType::Sale),
            "sale_group" | "salegroup" => Some(EntityType::SaleGroup),
            "inventory_adjustment" | "inventoryadjustment" | "inventory" => {
                Some(EntityType::InventoryAdjustment)
            }
            "debt" | "debts" => Some(EntityType::Debt),
            "product" | "products" => Some(EntityType::Product),
            _ => None,
        }
    }

    /// Informational only. Drain order is always FIFO by `queue_id`.
    pub fn priority(self) -> i64 {
        match self {
            EntityType::Sale | EntityType::SaleGroup => 10,
            EntityType::InventoryAdjustment => 5,
            EntityType::Debt => 5,
            EntityType::Product => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Adjust,
    Payment,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Adjust => "adjust",
            Operation::Payment => "payment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            "adjust" => Some(Operation::Adjust),
            "payment" => Some(Operation::Payment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Synced => "synced",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(QueueStatus::Pending),
            "syncing" => Some(QueueStatus::Syncing),
            "synced" => Some(QueueStatus::Synced),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue entry
// ---------------------------------------------------------------------------

/// One durable queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub queue_id: i64,
    pub client_ref: String,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub entity_id: String,
    pub store_id: String,
    pub device_id: Option<String>,
    pub status: QueueStatus,
    pub priority: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Payload text exactly as recorded.
    pub payload: String,
    pub payload_digest: String,
    pub checkpoint: Value,
    pub created_at: String,
    pub updated_at: String,
    pub synced_at: Option<String>,
}

const ENTRY_COLUMNS: &str = "queue_id, client_ref, entity_type, operation, entity_id, store_id,
     device_id, status, priority, attempts, last_error, payload, payload_digest, checkpoint,
     created_at, updated_at, synced_at";

fn invalid_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}

impl QueueEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let entity_type: String = row.get(2)?;
        let operation: String = row.get(3)?;
        let status: String = row.get(7)?;
        let checkpoint: String = row.get(13)?;
        Ok(Self {
            queue_id: row.get(0)?,
            client_ref: row.get(1)?,
            entity_type: EntityType::parse(&entity_type)
                .ok_or_else(|| invalid_column(2, &entity_type))?,
            operation: Operation::parse(&operation).ok_or_else(|| invalid_column(3, &operation))?,
            entity_id: row.get(4)?,
            store_id: row.get(5)?,
            device_id: row.get(6)?,
            status: QueueStatus::parse(&status).ok_or_else(|| invalid_column(7, &status))?,
            priority: row.get(8)?,
            attempts: row.get(9)?,
            last_error: row.get(10)?,
            payload: row.get(11)?,
            payload_digest: row.get(12)?,
            checkpoint: serde_json::from_str(&checkpoint).unwrap_or_else(|_| Value::Object(Default::default())),
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            synced_at: row.get(16)?,
        })
    }

    /// Whether the payload still hashes to the digest captured at record time.
    pub fn payload_intact(&self) -> bool {
        payload_digest(&self.payload) == self.payload_digest
    }

    /// Deserialize the recorded payload after checking its digest.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.payload_intact() {
            return Err(SyncError::PayloadDigestMismatch {
                client_ref: self.client_ref.clone(),
            });
        }
        Ok(serde_json::from_str(&self.payload)?)
    }
}

pub fn new_client_ref() -> String {
    Uuid::new_v4().to_string()
}

pub fn payload_digest(payload: &str) -> String {
    format!("{:x}", md5::compute(payload.as_bytes()))
}

// ---------------------------------------------------------------------------
// Mutation trait
// ---------------------------------------------------------------------------

/// A kind of locally initiated write that can be queued and replayed.
///
/// The serialized form of the value is the queue payload. It must carry
/// everything replay needs (prices, quantities, store, temporary ids) since
/// it is never re-derived from local state.
#[async_trait]
pub trait Mutation: Serialize + DeserializeOwned + Send + Sync + 'static {
    const ENTITY: EntityType;

    fn operation(&self) -> Operation;

    /// Primary entity id (temporary or server).
    fn entity_id(&self) -> String;

    fn store_id(&self) -> &str;

    /// Ordering keys such as `product:{id}`. After a failure, later entries
    /// sharing a key are held back for the rest of the pass.
    fn touched_keys(&self) -> Vec<String>;

    /// Input and duplicate checks against local state. Runs inside the
    /// record transaction.
    fn validate(&self, conn: &Connection) -> Result<()>;

    /// Optimistic mirror writes.
    fn apply_optimistic(&self, conn: &Connection, client_ref: &str) -> Result<()>;

    /// Remote steps for this mutation.
    async fn replay(&self, steps: &mut StepRunner<'_>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Generic queue
// ---------------------------------------------------------------------------

pub struct OfflineMutationQueue<T: Mutation> {
    db: Arc<DbState>,
    session: Session,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Mutation> Clone for OfflineMutationQueue<T> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            session: self.session.clone(),
            _kind: PhantomData,
        }
    }
}

impl<T: Mutation> OfflineMutationQueue<T> {
    pub fn new(db: Arc<DbState>, session: Session) -> Self {
        Self {
            db,
            session,
            _kind: PhantomData,
        }
    }

    /// Validate, enqueue and optimistically apply one mutation.
    ///
    /// Validation errors come back unchanged and leave nothing behind;
    /// storage failures come back as [`SyncError::QueueWrite`].
    pub fn record(&self, mutation: &T) -> Result<QueueEntry> {
        self.record_inner(mutation).map_err(|e| {
            if !e.is_validation() {
                warn!(entity = T::ENTITY.as_str(), error = %e, "Failed to record mutation");
            }
            e.into_queue_write()
        })
    }

    fn record_inner(&self, mutation: &T) -> Result<QueueEntry> {
        if mutation.store_id() != self.session.store_id {
            return Err(SyncError::Validation(format!(
                "mutation targets store {} but the session is bound to {}",
                mutation.store_id(),
                self.session.store_id
            )));
        }

        let payload = serde_json::to_string(mutation)?;
        let digest = payload_digest(&payload);
        let client_ref = new_client_ref();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.db.conn.lock()?;
        let tx = conn.transaction()?;
        mutation.validate(&tx)?;
        tx.execute(
            "INSERT INTO offline_queue (
                client_ref, entity_type, operation, entity_id, store_id, device_id,
                status, priority, attempts, payload, payload_digest, checkpoint,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, 0, ?8, ?9, '{}', ?10, ?10)",
            params![
                client_ref,
                T::ENTITY.as_str(),
                mutation.operation().as_str(),
                mutation.entity_id(),
                mutation.store_id(),
                self.session.device_id,
                T::ENTITY.priority(),
                payload,
                digest,
                now,
            ],
        )?;
        mutation.apply_optimistic(&tx, &client_ref)?;
        let entry = get_entry(&tx, &client_ref)?
            .ok_or_else(|| SyncError::EntryNotFound(client_ref.clone()))?;
        tx.commit()?;

        info!(
            entity = T::ENTITY.as_str(),
            operation = entry.operation.as_str(),
            entity_id = %entry.entity_id,
            client_ref = %entry.client_ref,
            "Queued offline mutation"
        );
        Ok(entry)
    }

    /// Entries of this kind, oldest first.
    pub fn list(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.db.conn.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM offline_queue WHERE entity_type = ?1 ORDER BY queue_id"
        ))?;
        let entries = stmt
            .query_map(params![T::ENTITY.as_str()], QueueEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Not-yet-synced entries of this kind (pending, syncing or failed).
    pub fn pending_count(&self) -> Result<i64> {
        let conn = self.db.conn.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM offline_queue WHERE entity_type = ?1 AND status != 'synced'",
            params![T::ENTITY.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Decode a recorded payload of this kind.
    pub fn load(&self, client_ref: &str) -> Result<T> {
        let conn = self.db.conn.lock()?;
        let entry = get_entry(&conn, client_ref)?
            .filter(|e| e.entity_type == T::ENTITY)
            .ok_or_else(|| SyncError::EntryNotFound(client_ref.to_string()))?;
        entry.decode()
    }
}

// ---------------------------------------------------------------------------
// Kind-agnostic helpers
// ---------------------------------------------------------------------------

pub fn get_entry(conn: &Connection, client_ref: &str) -> Result<Option<QueueEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM offline_queue WHERE client_ref = ?1"),
            params![client_ref],
            QueueEntry::from_row,
        )
        .optional()?;
    Ok(entry)
}

/// All entries, optionally filtered by status, oldest first.
pub fn list_entries(conn: &Connection, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
    let entries = match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM offline_queue WHERE status = ?1 ORDER BY queue_id"
            ))?;
            let rows = stmt
                .query_map(params![status.as_str()], QueueEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM offline_queue ORDER BY queue_id"
            ))?;
            let rows = stmt
                .query_map([], QueueEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(entries)
}

/// Entries the reconciler should attempt, FIFO.
pub fn load_drainable(conn: &Connection) -> Result<Vec<QueueEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM offline_queue
         WHERE status IN ('pending', 'failed')
         ORDER BY queue_id ASC"
    ))?;
    let entries = stmt
        .query_map([], QueueEntry::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Claim an entry for replay. Returns `false` if it was no longer
/// pending/failed.
pub fn mark_syncing(conn: &Connection, queue_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE offline_queue SET status = 'syncing', updated_at = ?2
         WHERE queue_id = ?1 AND status IN ('pending', 'failed')",
        params![queue_id, Utc::now().to_rfc3339()],
    )?;
    Ok(changed == 1)
}

pub fn mark_synced(conn: &Connection, queue_id: i64) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE offline_queue
         SET status = 'synced', last_error = NULL, synced_at = ?2, updated_at = ?2
         WHERE queue_id = ?1 AND status = 'syncing'",
        params![queue_id, now],
    )?;
    Ok(())
}

pub fn mark_failed(conn: &Connection, queue_id: i64, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE offline_queue
         SET status = 'failed', attempts = attempts + 1, last_error = ?2, updated_at = ?3
         WHERE queue_id = ?1 AND status != 'synced'",
        params![queue_id, error, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn save_checkpoint(conn: &Connection, queue_id: i64, checkpoint: &Value) -> Result<()> {
    conn.execute(
        "UPDATE offline_queue SET checkpoint = ?2, updated_at = ?3
         WHERE queue_id = ?1 AND status = 'syncing'",
        params![queue_id, checkpoint.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn append_log(
    conn: &Connection,
    entry: &QueueEntry,
    outcome: &str,
    attempt: i64,
    message: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_log (client_ref, entity_type, outcome, attempt, message, logged_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.client_ref,
            entry.entity_type.as_str(),
            outcome,
            attempt,
            message,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Move entries left `syncing` by a crash to `failed`.
pub fn recover_interrupted(conn: &Connection) -> Result<usize> {
    let recovered = conn.execute(
        "UPDATE offline_queue
         SET status = 'failed', attempts = attempts + 1, last_error = 'interrupted', updated_at = ?1
         WHERE status = 'syncing'",
        params![Utc::now().to_rfc3339()],
    )?;
    if recovered > 0 {
        warn!(recovered, "Recovered interrupted sync entries as failed");
    }
    Ok(recovered)
}

/// Drop a not-yet-synced entry together with its optimistic mirror rows.
pub fn discard(conn: &mut Connection, client_ref: &str) -> Result<QueueEntry> {
    let tx = conn.transaction()?;
    let entry = get_entry(&tx, client_ref)?
        .ok_or_else(|| SyncError::EntryNotFound(client_ref.to_string()))?;
    match entry.status {
        QueueStatus::Synced => return Err(SyncError::AlreadySynced(client_ref.to_string())),
        QueueStatus::Syncing => {
            return Err(SyncError::Validation(format!(
                "queue entry {client_ref} is being synced"
            )))
        }
        QueueStatus::Pending | QueueStatus::Failed => {}
    }
    tx.execute(
        "DELETE FROM offline_queue WHERE client_ref = ?1",
        params![client_ref],
    )?;
    let removed = mirror::remove_local_rows_for(&tx, client_ref)?;
    append_log(&tx, &entry, "discarded", entry.attempts, None)?;
    tx.commit()?;
    info!(client_ref, removed, "Discarded queue entry");
    Ok(entry)
}

/// Delete synced entries whose `synced_at` is older than `cutoff`.
pub fn prune_synced(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let pruned = conn.execute(
        "DELETE FROM offline_queue WHERE status = 'synced' AND synced_at < ?1",
        params![cutoff.to_rfc3339()],
    )?;
    if pruned > 0 {
        debug!(pruned, "Pruned synced queue entries");
    }
    Ok(pruned)
}
