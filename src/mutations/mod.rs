//! Mutation kinds recorded by the offline queue.
//!
//! Each kind is a self-contained payload: everything its replay needs is
//! captured when it is recorded.

mod debt;
mod inventory;
mod product;
mod sale;
mod sale_group;

pub use debt::{DebtMutation, DebtOp};
pub use inventory::InventoryAdjustment;
pub use product::{ProductMutation, ProductOp};
pub use sale::{SaleLine, SaleMutation};
pub use sale_group::{SaleGroupMutation, SaleGroupOp};

use serde_json::Value;

use crate::error::{Result, SyncError};

pub(crate) fn product_key(id: &str) -> String {
    format!("product:{id}")
}

pub(crate) fn sale_group_key(id: &str) -> String {
    format!("sale_group:{id}")
}

pub(crate) fn debt_key(id: &str) -> String {
    format!("debt:{id}")
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(SyncError::Validation(message()))
    }
}

/// `changes` must be a non-empty object that does not try to move the row.
pub(crate) fn validate_changes(changes: &Value) -> Result<()> {
    let Some(fields) = changes.as_object() else {
        return Err(SyncError::Validation("changes must be a JSON object".into()));
    };
    ensure(!fields.is_empty(), || "changes must not be empty".into())?;
    for key in ["id", "store_id", "client_ref"] {
        ensure(!fields.contains_key(key), || format!("{key} cannot be changed"))?;
    }
    Ok(())
}

pub(crate) fn require_text(value: &str, field: &str) -> Result<()> {
    ensure(!value.trim().is_empty(), || format!("{field} is required"))
}
