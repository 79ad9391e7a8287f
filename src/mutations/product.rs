use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::{ensure, product_key, require_text, validate_changes};
use crate::error::{Result, SyncError};
use crate::mirror::{self, MirrorTable};
use crate::queue::{EntityType, Mutation, Operation};
use crate::reconciler::{row_id, StepRunner};
use crate::remote::RemoteError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProductOp {
    Create {
        fields: Value,
        #[serde(default)]
        initial_stock: i64,
    },
    Update {
        changes: Value,
    },
    Delete,
}

/// Catalog change. Creates run under a temporary id until synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMutation {
    pub product_id: String,
    pub store_id: String,
    pub op: ProductOp,
}

impl ProductMutation {
    pub fn create(store_id: impl Into<String>, fields: Value, initial_stock: i64) -> Self {
        Self {
            product_id: mirror::new_local_id(),
            store_id: store_id.into(),
            op: ProductOp::Create {
                fields,
                initial_stock,
            },
        }
    }

    pub fn update(store_id: impl Into<String>, product_id: impl Into<String>, changes: Value) -> Self {
        Self {
            product_id: product_id.into(),
            store_id: store_id.into(),
            op: ProductOp::Update { changes },
        }
    }

    pub fn delete(store_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            store_id: store_id.into(),
            op: ProductOp::Delete,
        }
    }

    fn inventory_ref(client_ref: &str) -> String {
        format!("{client_ref}:inventory")
    }
}

#[async_trait]
impl Mutation for ProductMutation {
    const ENTITY: EntityType = EntityType::Product;

    fn operation(&self) -> Operation {
        match self.op {
            ProductOp::Create { .. } => Operation::Create,
            ProductOp::Update { .. } => Operation::Update,
            ProductOp::Delete => Operation::Delete,
        }
    }

    fn entity_id(&self) -> String {
        self.product_id.clone()
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn touched_keys(&self) -> Vec<String> {
        vec![product_key(&self.product_id)]
    }

    fn validate(&self, _conn: &Connection) -> Result<()> {
        require_text(&self.product_id, "product_id")?;
        match &self.op {
            ProductOp::Create {
                fields,
                initial_stock,
            } => {
                let name = fields.get("name").and_then(Value::as_str).unwrap_or("");
                require_text(name, "name")?;
                ensure(*initial_stock >= 0, || "initial_stock cannot be negative".into())?;
                if let Some(price) = fields.get("price").and_then(Value::as_f64) {
                    ensure(price >= 0.0, || "price cannot be negative".into())?;
                }
                Ok(())
            }
            ProductOp::Update { changes } => validate_changes(changes),
            ProductOp::Delete => Ok(()),
        }
    }

    fn apply_optimistic(&self, conn: &Connection, client_ref: &str) -> Result<()> {
        match &self.op {
            ProductOp::Create {
                fields,
                initial_stock,
            } => {
                mirror::upsert_local(
                    conn,
                    MirrorTable::Products,
                    &self.product_id,
                    &self.store_id,
                    fields.clone(),
                    client_ref,
                )?;
                if *initial_stock > 0 {
                    mirror::adjust_local_inventory(
                        conn,
                        &self.store_id,
                        &self.product_id,
                        *initial_stock,
                        &Self::inventory_ref(client_ref),
                    )?;
                }
            }
            ProductOp::Update { changes } => {
                mirror::merge_local(conn, MirrorTable::Products, &self.product_id, changes)?;
            }
            ProductOp::Delete => {
                mirror::delete_row(conn, MirrorTable::Products, &self.product_id)?;
            }
        }
        Ok(())
    }

    async fn replay(&self, steps: &mut StepRunner<'_>) -> Result<()> {
        match &self.op {
            ProductOp::Create {
                fields,
                initial_stock,
            } => {
                let client_ref = steps.client_ref().to_string();
                let mut row = fields.clone();
                if let Value::Object(map) = &mut row {
                    map.insert("store_id".into(), Value::String(self.store_id.clone()));
                    map.remove("id");
                }
                let stored = steps
                    .insert_once("product", MirrorTable::Products, &client_ref, row)
                    .await?;
                let server_id = row_id(&stored).ok_or_else(|| {
                    SyncError::step("product", RemoteError::InvalidResponse("product without id".into()))
                })?;
                steps.remap(MirrorTable::Products, &self.product_id, &server_id);

                if *initial_stock > 0 {
                    steps
                        .insert_once(
                            "inventory",
                            MirrorTable::Inventory,
                            &Self::inventory_ref(&client_ref),
                            json!({
                                "store_id": self.store_id,
                                "product_id": server_id,
                                "quantity": initial_stock,
                            }),
                        )
                        .await?;
                }
            }
            ProductOp::Update { changes } => {
                let id = steps.resolve(&self.product_id)?;
                let rows = steps
                    .update("product", MirrorTable::Products, &id, changes.clone())
                    .await?;
                if rows.is_empty() {
                    warn!(product_id = %id, "Product no longer exists remotely; update dropped");
                }
            }
            ProductOp::Delete => {
                let id = match steps.resolve(&self.product_id) {
                    Ok(id) => id,
                    // Never reached the server; nothing to delete there.
                    Err(SyncError::UnresolvedReference(_)) => return Ok(()),
                    Err(e) => return Err(e),
                };
                steps.delete("product", MirrorTable::Products, &id).await?;
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
    fn test_payload_is_tagged() {
        let create = ProductMutation::create("s1", json!({ "name": "Charger" }), 3);
        let payload = serde_json::to_value(&create).unwrap();
        assert_eq!(payload["op"]["kind"], "create");
        assert_eq!(payload["op"]["initial_stock"], 3);
        let back: ProductMutation = serde_json::from_value(payload).unwrap();
        assert_eq!(back, create);
    }

    #[test]
    fn test_validation() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        assert!(ProductMutation::create("s1", json!({}), 0).validate(&conn).is_err());
        assert!(ProductMutation::create("s1", json!({ "name": "x" }), -1).validate(&conn).is_err());
        assert!(ProductMutation::update("s1", "p1", json!({})).validate(&conn).is_err());
        assert!(ProductMutation::update("s1", "p1", json!({ "id": "p2" })).validate(&conn).is_err());
        assert!(ProductMutation::update("s1", "p1", json!({ "price": 2.0 })).validate(&conn).is_ok());
        assert_eq!(ProductMutation::delete("s1", "p1").operation(), Operation::Delete);
    }

    #[test]
    fn test_optimistic_create_and_update() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        let create = ProductMutation::create("s1", json!({ "name": "Case", "price": 9.0 }), 4);
        create.apply_optimistic(&conn, "ref-1").unwrap();
        ProductMutation::update("s1", create.product_id.clone(), json!({ "price": 7.5 }))
            .apply_optimistic(&conn, "ref-2")
            .unwrap();

        let row = mirror::get_row(&conn, MirrorTable::Products, &create.product_id)
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], "Case");
        assert_eq!(row["price"], 7.5);
        assert_eq!(
            mirror::inventory_quantity(&conn, "s1", &create.product_id).unwrap(),
            Some(4)
        );
    }
}
