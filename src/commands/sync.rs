use serde::Deserialize;
use serde_json::Value;

use crate::engine::SyncEngine;
use crate::mutations::{
    DebtMutation, DebtOp, InventoryAdjustment, ProductMutation, SaleGroupMutation, SaleLine,
    SaleMutation,
};
use crate::queue::{EntityType, QueueEntry, QueueStatus};
use crate::{parse_channel_payload, value_i64, value_str};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleLinePayload {
    #[serde(alias = "product_id")]
    product_id: String,
    quantity: i64,
    #[serde(alias = "unit_price", alias = "price")]
    unit_price: f64,
    #[serde(default, alias = "device_ids", alias = "imeis", alias = "serials")]
    device_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SalePayload {
    #[serde(default, alias = "customer_id")]
    customer_id: Option<String>,
    #[serde(default, alias = "payment_method")]
    payment_method: Option<String>,
    #[serde(default, alias = "amount_paid")]
    amount_paid: Option<f64>,
    #[serde(alias = "items")]
    lines: Vec<SaleLinePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventoryPayload {
    #[serde(alias = "product_id")]
    product_id: String,
    #[serde(alias = "quantity_change", alias = "quantityChange")]
    delta: i64,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductPayload {
    #[serde(default, alias = "op", alias = "operation")]
    action: Option<String>,
    #[serde(default, alias = "product_id", alias = "id")]
    product_id: Option<String>,
    #[serde(default, alias = "changes", alias = "product")]
    fields: Option<Value>,
    #[serde(default, alias = "initial_stock", alias = "quantity")]
    initial_stock: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebtPayload {
    #[serde(default, alias = "op", alias = "operation")]
    action: Option<String>,
    #[serde(default, alias = "debt_id", alias = "id")]
    debt_id: Option<String>,
    #[serde(default, alias = "customer_id")]
    customer_id: Option<String>,
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default, alias = "due_date")]
    due_date: Option<String>,
    #[serde(default)]
    changes: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleGroupPayload {
    #[serde(default, alias = "op", alias = "operation")]
    action: Option<String>,
    #[serde(alias = "sale_group_id", alias = "id")]
    sale_group_id: String,
    #[serde(default)]
    changes: Option<Value>,
    #[serde(default)]
    amount: Option<f64>,
}

fn parse<T: for<'de> Deserialize<'de>>(payload: Value, what: &str) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|e| format!("Invalid {what} payload: {e}"))
}

fn action_of(action: Option<String>, default: &str) -> String {
    action
        .map(|a| a.trim().to_ascii_lowercase())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn require_id(id: Option<String>, what: &str) -> Result<String, String> {
    id.map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| format!("Missing {what}"))
}

fn entry_json(entry: &QueueEntry) -> Result<Value, String> {
    serde_json::to_value(entry).map_err(|e| e.to_string())
}

fn build_sale(engine: &SyncEngine, payload: Value) -> Result<SaleMutation, String> {
    let parsed: SalePayload = parse(payload, "sale")?;
    let lines = parsed
        .lines
        .into_iter()
        .map(|line| {
            SaleLine::new(line.product_id.trim(), line.quantity, line.unit_price)
                .with_devices(line.device_ids)
        })
        .collect();
    let session = engine.session();
    let mut sale = SaleMutation::new(session.store_id.clone(), lines).sold_by(session.user_id.clone());
    if let Some(customer_id) = parsed.customer_id.filter(|c| !c.trim().is_empty()) {
        sale = sale.with_customer(customer_id);
    }
    let method = parsed.payment_method.unwrap_or_else(|| sale.payment_method.clone());
    let paid = parsed.amount_paid.unwrap_or(sale.amount_paid);
    Ok(sale.with_payment(method, paid))
}

fn build_product(engine: &SyncEngine, payload: Value) -> Result<ProductMutation, String> {
    let parsed: ProductPayload = parse(payload, "product")?;
    let store_id = engine.session().store_id.clone();
    match action_of(parsed.action, "create").as_str() {
        "create" => Ok(ProductMutation::create(
            store_id,
            parsed.fields.unwrap_or(Value::Null),
            parsed.initial_stock,
        )),
        "update" => Ok(ProductMutation::update(
            store_id,
            require_id(parsed.product_id, "productId")?,
            parsed.fields.unwrap_or(Value::Null),
        )),
        "delete" => Ok(ProductMutation::delete(
            store_id,
            require_id(parsed.product_id, "productId")?,
        )),
        other => Err(format!("Unsupported product action: {other}")),
    }
}

fn build_debt(engine: &SyncEngine, payload: Value) -> Result<DebtMutation, String> {
    let parsed: DebtPayload = parse(payload, "debt")?;
    let store_id = engine.session().store_id.clone();
    match action_of(parsed.action, "create").as_str() {
        "create" => {
            let mut debt = DebtMutation::create(
                store_id,
                parsed.customer_id,
                parsed.amount.unwrap_or(0.0),
                parsed.note,
            );
            if let DebtOp::Create { due_date, .. } = &mut debt.op {
                *due_date = parsed.due_date;
            }
            Ok(debt)
        }
        "update" => Ok(DebtMutation::update(
            store_id,
            require_id(parsed.debt_id, "debtId")?,
            parsed.changes.unwrap_or(Value::Null),
        )),
        "payment" | "record_payment" | "pay" => Ok(DebtMutation::record_payment(
            store_id,
            require_id(parsed.debt_id, "debtId")?,
            parsed.amount.unwrap_or(0.0),
        )),
        "delete" => Ok(DebtMutation::delete(
            store_id,
            require_id(parsed.debt_id, "debtId")?,
        )),
        other => Err(format!("Unsupported debt action: {other}")),
    }
}

fn build_sale_group(engine: &SyncEngine, payload: Value) -> Result<SaleGroupMutation, String> {
    let parsed: SaleGroupPayload = parse(payload, "sale group")?;
    let store_id = engine.session().store_id.clone();
    let sale_group_id = require_id(Some(parsed.sale_group_id), "saleGroupId")?;
    match action_of(parsed.action, "update").as_str() {
        "update" => Ok(SaleGroupMutation::update(
            store_id,
            sale_group_id,
            parsed.changes.unwrap_or(Value::Null),
        )),
        "payment" | "record_payment" | "pay" => Ok(SaleGroupMutation::record_payment(
            store_id,
            sale_group_id,
            parsed.amount.unwrap_or(0.0),
        )),
        other => Err(format!("Unsupported sale group action: {other}")),
    }
}

/// Record one mutation. The payload names its kind in `entityType`.
pub fn sync_record(
    engine: &SyncEngine,
    arg0: Option<Value>,
    arg1: Option<Value>,
) -> Result<Value, String> {
    let payload = parse_channel_payload(arg0, arg1);
    let kind = value_str(&payload, &["entityType", "entity_type", "type"])
        .ok_or("Missing entityType")?;
    let entity = EntityType::parse(&kind).ok_or_else(|| format!("Unknown entityType: {kind}"))?;

    let entry = match entity {
        EntityType::Sale => engine.record(&build_sale(engine, payload)?),
        EntityType::SaleGroup => engine.record(&build_sale_group(engine, payload)?),
        EntityType::InventoryAdjustment => {
            let parsed: InventoryPayload = parse(payload, "inventory adjustment")?;
            engine.record(&InventoryAdjustment::new(
                engine.session().store_id.clone(),
                parsed.product_id.trim(),
                parsed.delta,
                parsed.reason.as_deref(),
            ))
        }
        EntityType::Debt => engine.record(&build_debt(engine, payload)?),
        EntityType::Product => engine.record(&build_product(engine, payload)?),
    }
    .map_err(|e| e.to_string())?;

    entry_json(&entry)
}

pub fn sync_get_status(engine: &SyncEngine) -> Result<Value, String> {
    serde_json::to_value(engine.status()).map_err(|e| e.to_string())
}

pub async fn sync_force(engine: &SyncEngine) -> Result<Value, String> {
    let report = engine.sync_now().await.map_err(|e| e.to_string())?;
    Ok(serde_json::json!({
        "success": true,
        "report": report,
        "status": engine.status(),
    }))
}

/// Accepts `true`/`false` or `{ "online": bool }`.
pub fn sync_set_online(engine: &SyncEngine, arg0: Option<Value>) -> Result<Value, String> {
    let online = match arg0 {
        Some(Value::Bool(online)) => online,
        Some(Value::Object(obj)) => obj
            .get("online")
            .or_else(|| obj.get("isOnline"))
            .and_then(Value::as_bool)
            .ok_or("Missing online flag")?,
        _ => return Err("Missing online flag".into()),
    };
    engine.set_online(online);
    sync_get_status(engine)
}

fn parse_failed_limit(arg0: Option<Value>) -> usize {
    const DEFAULT_LIMIT: i64 = 50;
    const MAX_LIMIT: i64 = 500;

    let limit = match arg0 {
        Some(Value::Number(num)) => num.as_i64(),
        Some(payload @ Value::Object(_)) => value_i64(&payload, &["limit", "max", "count"]),
        _ => None,
    };
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize
}

pub fn sync_list_failed(engine: &SyncEngine, arg0: Option<Value>) -> Result<Value, String> {
    let limit = parse_failed_limit(arg0);
    let entries = engine
        .list_entries(Some(QueueStatus::Failed))
        .map_err(|e| e.to_string())?;
    let items: Vec<Value> = entries
        .iter()
        .take(limit)
        .map(entry_json)
        .collect::<Result<_, _>>()?;
    Ok(serde_json::json!({ "items": items, "total": entries.len() }))
}

fn parse_client_ref(arg0: Option<Value>) -> Result<String, String> {
    let client_ref = match arg0 {
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(payload @ Value::Object(_)) => value_str(&payload, &["clientRef", "client_ref", "id"]),
        _ => None,
    };
    client_ref.ok_or_else(|| "Missing clientRef".into())
}

pub fn sync_discard_entry(engine: &SyncEngine, arg0: Option<Value>) -> Result<Value, String> {
    let client_ref = parse_client_ref(arg0)?;
    let entry = engine.discard(&client_ref).map_err(|e| e.to_string())?;
    Ok(serde_json::json!({
        "success": true,
        "discarded": entry_json(&entry)?,
        "status": engine.status(),
    }))
}

pub async fn sync_hydrate(engine: &SyncEngine) -> Result<Value, String> {
    let rows = engine.hydrate().await.map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "success": true, "rows": rows }))
}
