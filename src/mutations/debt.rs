use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::{debt_key, ensure, require_text, validate_changes};
use crate::error::{Result, SyncError};
use crate::mirror::{self, MirrorTable};
use crate::queue::{EntityType, Mutation, Operation};
use crate::reconciler::{row_id, StepRunner};
use crate::remote::{Filter, RemoteError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DebtOp {
    Create {
        #[serde(default)]
        customer_id: Option<String>,
        amount: f64,
        #[serde(default)]
        amount_paid: f64,
        #[serde(default)]
        note: Option<String>,
        #[serde(default)]
        due_date: Option<String>,
    },
    Update {
        changes: Value,
    },
    RecordPayment {
        amount: f64,
    },
    Delete,
}

/// Customer debt ledger change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtMutation {
    pub debt_id: String,
    pub store_id: String,
    pub op: DebtOp,
    pub recorded_at: String,
}

impl DebtMutation {
    pub fn create(
        store_id: impl Into<String>,
        customer_id: Option<String>,
        amount: f64,
        note: Option<String>,
    ) -> Self {
        Self {
            debt_id: mirror::new_local_id(),
            store_id: store_id.into(),
            op: DebtOp::Create {
                customer_id,
                amount,
                amount_paid: 0.0,
                note,
                due_date: None,
            },
            recorded_at: super::now(),
        }
    }

    pub fn update(store_id: impl Into<String>, debt_id: impl Into<String>, changes: Value) -> Self {
        Self {
            debt_id: debt_id.into(),
            store_id: store_id.into(),
            op: DebtOp::Update { changes },
            recorded_at: super::now(),
        }
    }

    pub fn record_payment(store_id: impl Into<String>, debt_id: impl Into<String>, amount: f64) -> Self {
        Self {
            debt_id: debt_id.into(),
            store_id: store_id.into(),
            op: DebtOp::RecordPayment { amount },
            recorded_at: super::now(),
        }
    }

    pub fn delete(store_id: impl Into<String>, debt_id: impl Into<String>) -> Self {
        Self {
            debt_id: debt_id.into(),
            store_id: store_id.into(),
            op: DebtOp::Delete,
            recorded_at: super::now(),
        }
    }
}

#[async_trait]
impl Mutation for DebtMutation {
    const ENTITY: EntityType = EntityType::Debt;

    fn operation(&self) -> Operation {
        match self.op {
            DebtOp::Create { .. } => Operation::Create,
            DebtOp::Update { .. } => Operation::Update,
            DebtOp::RecordPayment { .. } => Operation::Payment,
            DebtOp::Delete => Operation::Delete,
        }
    }

    fn entity_id(&self) -> String {
        self.debt_id.clone()
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn touched_keys(&self) -> Vec<String> {
        vec![debt_key(&self.debt_id)]
    }

    fn validate(&self, _conn: &Connection) -> Result<()> {
        require_text(&self.debt_id, "debt_id")?;
        match &self.op {
            DebtOp::Create {
                amount,
                amount_paid,
                ..
            } => {
                ensure(*amount > 0.0, || "debt amount must be positive".into())?;
                ensure(*amount_paid >= 0.0 && *amount_paid <= *amount, || {
                    format!("amount_paid {amount_paid} must be between 0 and {amount}")
                })
            }
            DebtOp::Update { changes } => validate_changes(changes),
            DebtOp::RecordPayment { amount } => {
                ensure(*amount > 0.0, || "payment amount must be positive".into())
            }
            DebtOp::Delete => Ok(()),
        }
    }

    fn apply_optimistic(&self, conn: &Connection, client_ref: &str) -> Result<()> {
        match &self.op {
            DebtOp::Create {
                customer_id,
                amount,
                amount_paid,
                note,
                due_date,
            } => {
                mirror::upsert_local(
                    conn,
                    MirrorTable::Debts,
                    &self.debt_id,
                    &self.store_id,
                    json!({
                        "customer_id": customer_id,
                        "amount": amount,
                        "amount_paid": amount_paid,
                        "note": note,
                        "due_date": due_date,
                        "created_at": self.recorded_at,
                    }),
                    client_ref,
                )?;
            }
            DebtOp::Update { changes } => {
                mirror::merge_local(conn, MirrorTable::Debts, &self.debt_id, changes)?;
            }
            DebtOp::RecordPayment { amount } => {
                if let Some(row) = mirror::get_row(conn, MirrorTable::Debts, &self.debt_id)? {
                    let paid = row.get("amount_paid").and_then(Value::as_f64).unwrap_or(0.0);
                    mirror::merge_local(
                        conn,
                        MirrorTable::Debts,
                        &self.debt_id,
                        &json!({ "amount_paid": paid + amount }),
                    )?;
                }
            }
            DebtOp::Delete => {
                mirror::delete_row(conn, MirrorTable::Debts, &self.debt_id)?;
            }
        }
        Ok(())
    }

    async fn replay(&self, steps: &mut StepRunner<'_>) -> Result<()> {
        match &self.op {
            DebtOp::Create {
                customer_id,
                amount,
                amount_paid,
                note,
                due_date,
            } => {
                let client_ref = steps.client_ref().to_string();
                let customer_id = steps.resolve_opt(customer_id.as_deref())?;
                let stored = steps
                    .insert_once(
                        "debt",
                        MirrorTable::Debts,
                        &client_ref,
                        json!({
                            "store_id": self.store_id,
                            "customer_id": customer_id,
                            "amount": amount,
                            "amount_paid": amount_paid,
                            "note": note,
                            "due_date": due_date,
                            "created_at": self.recorded_at,
                        }),
                    )
                    .await?;
                let server_id = row_id(&stored).ok_or_else(|| {
                    SyncError::step("debt", RemoteError::InvalidResponse("debt without id".into()))
                })?;
                steps.remap(MirrorTable::Debts, &self.debt_id, &server_id);
            }
            DebtOp::Update { changes } => {
                let id = steps.resolve(&self.debt_id)?;
                let rows = steps
                    .update("debt", MirrorTable::Debts, &id, changes.clone())
                    .await?;
                if rows.is_empty() {
                    warn!(debt_id = %id, "Debt no longer exists remotely; update dropped");
                }
            }
            DebtOp::RecordPayment { amount } => {
                let id = steps.resolve(&self.debt_id)?;
                let updated = steps
                    .adjust_number(
                        "payment",
                        MirrorTable::Debts,
                        vec![Filter::eq("id", id.as_str())],
                        "amount_paid",
                        *amount,
                    )
                    .await?;
                if updated.is_none() {
                    return Err(SyncError::Validation(format!(
                        "debt {id} no longer exists remotely"
                    )));
                }
            }
            DebtOp::Delete => {
                let id = match steps.resolve(&self.debt_id) {
                    Ok(id) => id,
                    Err(SyncError::UnresolvedReference(_)) => return Ok(()),
                    Err(e) => return Err(e),
                };
                steps.delete("debt", MirrorTable::Debts, &id).await?;
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
    fn test_validation() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        assert!(DebtMutation::create("s1", None, 0.0, None).validate(&conn).is_err());
        assert!(DebtMutation::create("s1", None, 25.0, None).validate(&conn).is_ok());
        assert!(DebtMutation::record_payment("s1", "d1", -5.0).validate(&conn).is_err());
        assert_eq!(
            DebtMutation::record_payment("s1", "d1", 5.0).operation(),
            Operation::Payment
        );
    }

    #[test]
    fn test_optimistic_payment_updates_local_balance() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        let create = DebtMutation::create("s1", Some("c1".into()), 80.0, Some("phone repair".into()));
        create.apply_optimistic(&conn, "ref-1").unwrap();
        DebtMutation::record_payment("s1", create.debt_id.clone(), 30.0)
            .apply_optimistic(&conn, "ref-2")
            .unwrap();

        let row = mirror::get_row(&conn, MirrorTable::Debts, &create.debt_id)
            .unwrap()
            .unwrap();
        assert_eq!(row["amount_paid"], 30.0);
        assert_eq!(row["customer_id"], "c1");
    }
}
