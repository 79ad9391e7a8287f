//! Point-of-sale transactions: one sale group with one or more lines.

use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use tracing::warn;

use super::{ensure, product_key, require_text, sale_group_key};
use crate::error::{Result, SyncError};
use crate::mirror::{self, MirrorTable};
use crate::queue::{EntityType, Mutation, Operation};
use crate::reconciler::{row_id, StepRunner};
use crate::remote::{Filter, RemoteError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLine {
    /// Temporary id of the local sale row.
    pub line_id: String,
    pub product_id: String,
    pub quantity: i64,
    pub unit_price: f64,
    /// IMEI/serial numbers sold on this line, trimmed on the way in.
    #[serde(default, deserialize_with = "deserialize_device_ids")]
    pub device_ids: Vec<String>,
}

fn normalize_device_ids(device_ids: Vec<String>) -> Vec<String> {
    device_ids
        .into_iter()
        .map(|id| mirror::normalize_device_id(&id).to_string())
        .collect()
}

fn deserialize_device_ids<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer).map(normalize_device_ids)
}

impl SaleLine {
    pub fn new(product_id: impl Into<String>, quantity: i64, unit_price: f64) -> Self {
        Self {
            line_id: mirror::new_local_id(),
            product_id: product_id.into(),
            quantity,
            unit_price,
            device_ids: Vec::new(),
        }
    }

    pub fn with_devices(mut self, device_ids: Vec<String>) -> Self {
        self.device_ids = normalize_device_ids(device_ids);
        self
    }

    pub fn total(&self) -> f64 {
        self.quantity as f64 * self.unit_price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleMutation {
    /// Temporary id of the local sale group.
    pub sale_group_id: String,
    pub store_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub payment_method: String,
    pub amount_paid: f64,
    pub lines: Vec<SaleLine>,
    #[serde(default)]
    pub sold_by: Option<String>,
    pub sold_at: String,
}

impl SaleMutation {
    /// A fully paid cash sale.
    pub fn new(store_id: impl Into<String>, lines: Vec<SaleLine>) -> Self {
        let amount_paid = lines.iter().map(SaleLine::total).sum();
        Self {
            sale_group_id: mirror::new_local_id(),
            store_id: store_id.into(),
            customer_id: None,
            payment_method: "cash".into(),
            amount_paid,
            lines,
            sold_by: None,
            sold_at: super::now(),
        }
    }

    pub fn with_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn with_payment(mut self, method: impl Into<String>, amount_paid: f64) -> Self {
        self.payment_method = method.into();
        self.amount_paid = amount_paid;
        self
    }

    pub fn sold_by(mut self, user_id: impl Into<String>) -> Self {
        self.sold_by = Some(user_id.into());
        self
    }

    pub fn total_amount(&self) -> f64 {
        self.lines.iter().map(SaleLine::total).sum()
    }

    fn line_ref(client_ref: &str, index: usize) -> String {
        format!("{client_ref}:{index}")
    }
}

#[async_trait]
impl Mutation for SaleMutation {
    const ENTITY: EntityType = EntityType::Sale;

    fn operation(&self) -> Operation {
        Operation::Create
    }

    fn entity_id(&self) -> String {
        self.sale_group_id.clone()
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn touched_keys(&self) -> Vec<String> {
        let mut keys = vec![sale_group_key(&self.sale_group_id)];
        for line in &self.lines {
            let key = product_key(&line.product_id);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    fn validate(&self, conn: &Connection) -> Result<()> {
        require_text(&self.sale_group_id, "sale_group_id")?;
        require_text(&self.payment_method, "payment_method")?;
        ensure(!self.lines.is_empty(), || "a sale needs at least one line".into())?;
        ensure(self.amount_paid >= 0.0, || "amount_paid cannot be negative".into())?;

        let mut seen = HashSet::new();
        for line in &self.lines {
            require_text(&line.product_id, "product_id")?;
            ensure(line.quantity > 0, || {
                format!("quantity for product {} must be positive", line.product_id)
            })?;
            ensure(line.unit_price >= 0.0, || {
                format!("unit_price for product {} cannot be negative", line.product_id)
            })?;
            ensure(
                line.device_ids.is_empty() || line.device_ids.len() as i64 == line.quantity,
                || {
                    format!(
                        "product {} lists {} device ids for quantity {}",
                        line.product_id,
                        line.device_ids.len(),
                        line.quantity
                    )
                },
            )?;

            for device_id in &line.device_ids {
                let device_id = mirror::normalize_device_id(device_id);
                require_text(device_id, "device_id")?;
                let already_sold =
                    mirror::device_status(conn, &self.store_id, device_id)?.as_deref() == Some("sold");
                if !seen.insert(device_id.to_string()) || already_sold {
                    return Err(SyncError::DuplicateDetected {
                        store_id: self.store_id.clone(),
                        device_id: device_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_optimistic(&self, conn: &Connection, client_ref: &str) -> Result<()> {
        mirror::upsert_local(
            conn,
            MirrorTable::SaleGroups,
            &self.sale_group_id,
            &self.store_id,
            json!({
                "customer_id": self.customer_id,
                "total_amount": self.total_amount(),
                "amount_paid": self.amount_paid,
                "payment_method": self.payment_method,
                "sold_by": self.sold_by,
                "created_at": self.sold_at,
            }),
            client_ref,
        )?;

        for (index, line) in self.lines.iter().enumerate() {
            mirror::upsert_local(
                conn,
                MirrorTable::Sales,
                &line.line_id,
                &self.store_id,
                json!({
                    "sale_group_id": self.sale_group_id,
                    "product_id": line.product_id,
                    "quantity": line.quantity,
                    "unit_price": line.unit_price,
                    "total_amount": line.total(),
                    "device_ids": line.device_ids,
                    "created_at": self.sold_at,
                }),
                &Self::line_ref(client_ref, index),
            )?;
            let remaining = mirror::adjust_local_inventory(
                conn,
                &self.store_id,
                &line.product_id,
                -line.quantity,
                client_ref,
            )?;
            if remaining < 0 {
                warn!(product_id = %line.product_id, remaining, "Sale takes local stock below zero");
            }
            mirror::mark_devices_sold(
                conn,
                &self.store_id,
                Some(&line.product_id),
                Some(&self.sale_group_id),
                &line.device_ids,
            )?;
        }
        Ok(())
    }

    async fn replay(&self, steps: &mut StepRunner<'_>) -> Result<()> {
        let client_ref = steps.client_ref().to_string();
        let customer_id = steps.resolve_opt(self.customer_id.as_deref())?;

        let group = steps
            .insert_once(
                "sale_group",
                MirrorTable::SaleGroups,
                &client_ref,
                json!({
                    "store_id": self.store_id,
                    "customer_id": customer_id,
                    "total_amount": self.total_amount(),
                    "amount_paid": self.amount_paid,
                    "payment_method": self.payment_method,
                    "sold_by": self.sold_by,
                    "created_at": self.sold_at,
                }),
            )
            .await?;
        let group_id = row_id(&group).ok_or_else(|| {
            SyncError::step("sale_group", RemoteError::InvalidResponse("sale group without id".into()))
        })?;
        steps.remap(MirrorTable::SaleGroups, &self.sale_group_id, &group_id);

        for (index, line) in self.lines.iter().enumerate() {
            let product_id = steps.resolve(&line.product_id)?;
            let step = format!("sale_line:{index}");
            let stored = steps
                .insert_once(
                    &step,
                    MirrorTable::Sales,
                    &Self::line_ref(&client_ref, index),
                    json!({
                        "store_id": self.store_id,
                        "sale_group_id": group_id,
                        "product_id": product_id,
                        "quantity": line.quantity,
                        "unit_price": line.unit_price,
                        "total_amount": line.total(),
                        "device_ids": line.device_ids,
                        "created_at": self.sold_at,
                    }),
                )
                .await?;
            if let Some(line_id) = row_id(&stored) {
                steps.remap(MirrorTable::Sales, &line.line_id, &line_id);
            }

            let adjusted = steps
                .adjust_number(
                    &format!("stock:{index}"),
                    MirrorTable::Inventory,
                    vec![
                        Filter::eq("store_id", self.store_id.as_str()),
                        Filter::eq("product_id", product_id.as_str()),
                    ],
                    "quantity",
                    -(line.quantity as f64),
                )
                .await?;
            match adjusted {
                None => warn!(
                    product_id = %product_id,
                    "No remote inventory row for sold product; stock not adjusted"
                ),
                Some(row) => {
                    if row.get("quantity").and_then(|q| q.as_f64()).unwrap_or(0.0) < 0.0 {
                        warn!(product_id = %product_id, "Remote stock went negative after sale");
                    }
                }
            }
        }
        Ok(())
    }
}
