use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{ensure, product_key, require_text};
use crate::error::Result;
use crate::mirror::{self, MirrorTable};
use crate::queue::{EntityType, Mutation, Operation};
use crate::reconciler::StepRunner;
use crate::remote::Filter;

/// Stock correction for one product (restock, shrinkage, recount delta).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    pub product_id: String,
    pub store_id: String,
    pub delta: i64,
    #[serde(default)]
    pub reason: Option<String>,
    pub adjusted_at: String,
}

impl InventoryAdjustment {
    pub fn new(
        store_id: impl Into<String>,
        product_id: impl Into<String>,
        delta: i64,
        reason: Option<&str>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            store_id: store_id.into(),
            delta,
            reason: reason.map(str::to_string),
            adjusted_at: super::now(),
        }
    }
}

#[async_trait]
impl Mutation for InventoryAdjustment {
    const ENTITY: EntityType = EntityType::InventoryAdjustment;

    fn operation(&self) -> Operation {
        Operation::Adjust
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
        ensure(self.delta != 0, || "adjustment delta must not be zero".into())
    }

    fn apply_optimistic(&self, conn: &Connection, client_ref: &str) -> Result<()> {
        mirror::adjust_local_inventory(conn, &self.store_id, &self.product_id, self.delta, client_ref)?;
        Ok(())
    }

    async fn replay(&self, steps: &mut StepRunner<'_>) -> Result<()> {
        let product_id = steps.resolve(&self.product_id)?;
        let adjusted = steps
            .adjust_number(
                "stock",
                MirrorTable::Inventory,
                vec![
                    Filter::eq("store_id", self.store_id.as_str()),
                    Filter::eq("product_id", product_id.as_str()),
                ],
                "quantity",
                self.delta as f64,
            )
            .await?;

        if adjusted.is_none() {
            info!(product_id = %product_id, "No remote inventory row; creating one");
            let client_ref = format!("{}:inventory", steps.client_ref());
            steps
                .insert_once(
                    "stock_create",
                    MirrorTable::Inventory,
                    &client_ref,
                    json!({
                        "store_id": self.store_id,
                        "product_id": product_id,
                        "quantity": self.delta,
                        "updated_at": self.adjusted_at,
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Session;
    use crate::connectivity::ConnectivityMonitor;
    use crate::db;
    use crate::queue::OfflineMutationQueue;
    use crate::reconciler::Reconciler;
    use crate::remote::{tables, MemoryRemote};
    use crate::status::StatusProjector;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_zero_delta_rejected() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        assert!(InventoryAdjustment::new("s1", "p1", 0, None).validate(&conn).is_err());
        assert!(InventoryAdjustment::new("s1", "", 3, None).validate(&conn).is_err());
        assert!(InventoryAdjustment::new("s1", "p1", -3, None).validate(&conn).is_ok());
    }

    #[tokio::test]
    async fn test_missing_remote_row_is_created() {
        let db = Arc::new(db::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let status = Arc::new(StatusProjector::new(Arc::clone(&db), connectivity.subscribe()));
        let reconciler = Reconciler::new(
            Arc::clone(&db),
            remote.clone(),
            connectivity,
            status,
            Duration::from_secs(5),
        );
        OfflineMutationQueue::<InventoryAdjustment>::new(Arc::clone(&db), Session::new("s1", "u", "d"))
            .record(&InventoryAdjustment::new("s1", "p-new", 4, Some("first delivery")))
            .unwrap();

        assert_eq!(reconciler.reconcile().await.unwrap().synced, 1);
        let rows = remote.rows(tables::INVENTORY);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["quantity"], 4);

        let conn = db.conn.lock().unwrap();
        assert_eq!(mirror::inventory_quantity(&conn, "s1", "p-new").unwrap(), Some(4));
        assert!(mirror::local_ids(&conn, MirrorTable::Inventory).unwrap().is_empty());
    }
}
