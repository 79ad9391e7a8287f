//! Remote collaborator interface.
//!
//! The hosted backend is consumed through table-level CRUD with filters and a
//! change-event subscription. Two implementations ship with the crate:
//! [`RestRemote`] for PostgREST-style HTTP backends and [`MemoryRemote`], an
//! in-process store used by tests and demos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod memory;
mod rest;

pub use memory::{MemoryRemote, RemoteCall};
pub use rest::{normalize_base_url, RestRemote};

/// Remote table names.
pub mod tables {
    pub const SALES: &str = "dynamic_sales";
    pub const SALE_GROUPS: &str = "sale_groups";
    pub const PRODUCTS: &str = "dynamic_product";
    pub const INVENTORY: &str = "dynamic_inventory";
    pub const DEBTS: &str = "debts";
    pub const CUSTOMERS: &str = "customers";
    pub const STORES: &str = "stores";
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote is unreachable (offline)")]
    Offline,
    #[error("remote call timed out after {0}s")]
    Timeout(u64),
    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Transport(String),
    #[error("invalid response from remote: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether a later retry could succeed without changing the request.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Offline | RemoteError::Timeout(_) | RemoteError::Transport(_) => true,
            RemoteError::Http { status, .. } => *status == 429 || *status >= 500,
            RemoteError::InvalidResponse(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Gt,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Gt => "gt",
        }
    }
}

/// A single column predicate. Multiple filters are AND-ed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn gt(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Gt,
            value: value.into(),
        }
    }

    /// Evaluate against a JSON row. Numbers and strings compare by their
    /// textual value for `eq`; `gt` compares numbers numerically and
    /// everything else lexically (RFC 3339 timestamps sort correctly).
    pub fn matches(&self, row: &Value) -> bool {
        let Some(field) = row.get(&self.column) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => value_as_text(field).as_deref() == Some(self.value.as_str()),
            FilterOp::Gt => match (field.as_f64(), self.value.parse::<f64>()) {
                (Some(lhs), Ok(rhs)) => lhs > rhs,
                _ => value_as_text(field)
                    .map(|text| text.as_str() > self.value.as_str())
                    .unwrap_or(false),
            },
        }
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A pushed row change. For deletes `row` carries at least the old `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub row: Value,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert one row and return it as stored (with the server id).
    async fn insert(&self, table: &str, row: Value) -> Result<Value, RemoteError>;

    /// Update all rows matching `filters`, returning the updated rows.
    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        changes: Value,
    ) -> Result<Vec<Value>, RemoteError>;

    /// Delete all rows matching `filters`, returning the deleted rows.
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, RemoteError>;

    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, RemoteError>;

    /// Start a change feed for `table`. The feed ends when `cancel` fires or
    /// the receiver is dropped.
    fn subscribe(
        &self,
        table: &str,
        filters: Vec<Filter>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ChangeEvent>;

    /// Lightweight reachability check.
    async fn health_check(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_eq_matches_strings_and_numbers() {
        let row = json!({ "store_id": "s1", "quantity": 4 });
        assert!(Filter::eq("store_id", "s1").matches(&row));
        assert!(Filter::eq("quantity", "4").matches(&row));
        assert!(!Filter::eq("store_id", "s2").matches(&row));
        assert!(!Filter::eq("missing", "s1").matches(&row));
    }

    #[test]
    fn test_filter_gt_on_timestamps_and_numbers() {
        let row = json!({ "updated_at": "2026-03-02T10:00:00Z", "quantity": 10 });
        assert!(Filter::gt("updated_at", "2026-03-01T00:00:00Z").matches(&row));
        assert!(!Filter::gt("updated_at", "2026-03-03T00:00:00Z").matches(&row));
        assert!(Filter::gt("quantity", "9").matches(&row));
        assert!(!Filter::gt("quantity", "10").matches(&row));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Offline.is_transient());
        assert!(RemoteError::Timeout(30).is_transient());
        assert!(RemoteError::Http { status: 503, message: "down".into() }.is_transient());
        assert!(RemoteError::Http { status: 429, message: "slow down".into() }.is_transient());
        assert!(!RemoteError::Http { status: 400, message: "bad".into() }.is_transient());
        assert!(!RemoteError::InvalidResponse("no id".into()).is_transient());
    }
}
