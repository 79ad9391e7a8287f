use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::{ensure, require_text, sale_group_key, validate_changes};
use crate::error::{Result, SyncError};
use crate::mirror::{self, MirrorTable};
use crate::queue::{EntityType, Mutation, Operation};
use crate::reconciler::StepRunner;
use crate::remote::Filter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SaleGroupOp {
    Update { changes: Value },
    /// Later instalment on a partly paid sale.
    RecordPayment { amount: f64 },
}

/// Change to an already recorded sale group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleGroupMutation {
    pub sale_group_id: String,
    pub store_id: String,
    pub op: SaleGroupOp,
}

impl SaleGroupMutation {
    pub fn update(store_id: impl Into<String>, sale_group_id: impl Into<String>, changes: Value) -> Self {
        Self {
            sale_group_id: sale_group_id.into(),
            store_id: store_id.into(),
            op: SaleGroupOp::Update { changes },
        }
    }

    pub fn record_payment(
        store_id: impl Into<String>,
        sale_group_id: impl Into<String>,
        amount: f64,
    ) -> Self {
        Self {
            sale_group_id: sale_group_id.into(),
            store_id: store_id.into(),
            op: SaleGroupOp::RecordPayment { amount },
        }
    }
}

#[async_trait]
impl Mutation for SaleGroupMutation {
    const ENTITY: EntityType = EntityType::SaleGroup;

    fn operation(&self) -> Operation {
        match self.op {
            SaleGroupOp::Update { .. } => Operation::Update,
            SaleGroupOp::RecordPayment { .. } => Operation::Payment,
        }
    }

    fn entity_id(&self) -> String {
        self.sale_group_id.clone()
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn touched_keys(&self) -> Vec<String> {
        vec![sale_group_key(&self.sale_group_id)]
    }

    fn validate(&self, _conn: &Connection) -> Result<()> {
        require_text(&self.sale_group_id, "sale_group_id")?;
        match &self.op {
            SaleGroupOp::Update { changes } => validate_changes(changes),
            SaleGroupOp::RecordPayment { amount } => {
                ensure(*amount > 0.0, || "payment amount must be positive".into())
            }
        }
    }

    fn apply_optimistic(&self, conn: &Connection, _client_ref: &str) -> Result<()> {
        match &self.op {
            SaleGroupOp::Update { changes } => {
                mirror::merge_local(conn, MirrorTable::SaleGroups, &self.sale_group_id, changes)?;
            }
            SaleGroupOp::RecordPayment { amount } => {
                if let Some(row) = mirror::get_row(conn, MirrorTable::SaleGroups, &self.sale_group_id)? {
                    let paid = row.get("amount_paid").and_then(Value::as_f64).unwrap_or(0.0);
                    mirror::merge_local(
                        conn,
                        MirrorTable::SaleGroups,
                        &self.sale_group_id,
                        &json!({ "amount_paid": paid + amount }),
                    )?;
                }
            }
        }
        Ok(())
    }

    async fn replay(&self, steps: &mut StepRunner<'_>) -> Result<()> {
        let id = steps.resolve(&self.sale_group_id)?;
        match &self.op {
            SaleGroupOp::Update { changes } => {
                let rows = steps
                    .update("sale_group", MirrorTable::SaleGroups, &id, changes.clone())
                    .await?;
                if rows.is_empty() {
                    warn!(sale_group_id = %id, "Sale group no longer exists remotely; update dropped");
                }
            }
            SaleGroupOp::RecordPayment { amount } => {
                let updated = steps
                    .adjust_number(
                        "payment",
                        MirrorTable::SaleGroups,
                        vec![Filter::eq("id", id.as_str())],
                        "amount_paid",
                        *amount,
                    )
                    .await?;
                if updated.is_none() {
                    return Err(SyncError::Validation(format!(
                        "sale group {id} no longer exists remotely"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_payment_applies_to_local_group() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        mirror::upsert_local(
            &conn,
            MirrorTable::SaleGroups,
            "local_g1",
            "s1",
            json!({ "total_amount": 100.0, "amount_paid": 40.0 }),
            "ref-sale",
        )
        .unwrap();

        let payment = SaleGroupMutation::record_payment("s1", "local_g1", 25.0);
        payment.validate(&conn).unwrap();
        payment.apply_optimistic(&conn, "ref-pay").unwrap();

        let row = mirror::get_row(&conn, MirrorTable::SaleGroups, "local_g1")
            .unwrap()
            .unwrap();
        assert_eq!(row["amount_paid"], 65.0);
        assert_eq!(payment.touched_keys(), vec!["sale_group:local_g1".to_string()]);
    }

    #[test]
    fn test_rejects_empty_changes_and_bad_amounts() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        assert!(SaleGroupMutation::update("s1", "g1", json!({})).validate(&conn).is_err());
        assert!(SaleGroupMutation::record_payment("s1", "g1", 0.0).validate(&conn).is_err());
        assert!(SaleGroupMutation::update("s1", "g1", json!({ "notes": "gift" }))
            .validate(&conn)
            .is_ok());
    }
}
