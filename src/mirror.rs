//! Mirrored entity cache.
//!
//! Local read replicas of remote rows. Optimistic writes land here under
//! temporary `local_` ids; confirmed remote rows replace them (remote wins).
//! When a temporary id gets its server id, [`rewrite_local_id`] moves every
//! local reference over, and the caller runs it inside the same transaction
//! that marks the queue entry synced.

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::reconciler::row_id;
use crate::remote::{tables, ChangeEvent, ChangeKind};

/// Prefix of ids assigned locally before the server has seen the row.
pub const LOCAL_ID_PREFIX: &str = "local_";

pub fn new_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4().simple())
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirrorTable {
    Stores,
    Customers,
    Products,
    Inventory,
    SaleGroups,
    Sales,
    Debts,
}

impl MirrorTable {
    pub const ALL: [MirrorTable; 7] = [
        MirrorTable::Stores,
        MirrorTable::Customers,
        MirrorTable::Products,
        MirrorTable::Inventory,
        MirrorTable::SaleGroups,
        MirrorTable::Sales,
        MirrorTable::Debts,
    ];

    pub fn local_name(self) -> &'static str {
        match self {
            MirrorTable::Stores => "stores",
            MirrorTable::Customers => "customers",
            MirrorTable::Products => "products",
            MirrorTable::Inventory => "inventory",
            MirrorTable::SaleGroups => "sale_groups",
            MirrorTable::Sales => "sales",
            MirrorTable::Debts => "debts",
        }
    }

    pub fn remote_name(self) -> &'static str {
        match self {
            MirrorTable::Stores => tables::STORES,
            MirrorTable::Customers => tables::CUSTOMERS,
            MirrorTable::Products => tables::PRODUCTS,
            MirrorTable::Inventory => tables::INVENTORY,
            MirrorTable::SaleGroups => tables::SALE_GROUPS,
            MirrorTable::Sales => tables::SALES,
            MirrorTable::Debts => tables::DEBTS,
        }
    }

    pub fn from_remote(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.remote_name() == name)
    }

    pub fn from_local(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.local_name() == name)
    }

    /// Key columns lifted out of `data` besides the common ones.
    fn extra_columns(self) -> &'static [&'static str] {
        match self {
            MirrorTable::Inventory => &["product_id", "quantity"],
            MirrorTable::SaleGroups => &["customer_id"],
            MirrorTable::Sales => &["sale_group_id", "product_id"],
            MirrorTable::Debts => &["customer_id"],
            MirrorTable::Stores | MirrorTable::Customers | MirrorTable::Products => &[],
        }
    }

    /// (table, column, has_data) pairs holding a reference to this table's ids.
    fn dependents(self) -> &'static [(&'static str, &'static str, bool)] {
        match self {
            MirrorTable::Products => &[
                ("inventory", "product_id", true),
                ("sales", "product_id", true),
                ("product_devices", "product_id", false),
            ],
            MirrorTable::SaleGroups => &[
                ("sales", "sale_group_id", true),
                ("product_devices", "sale_group_id", false),
            ],
            MirrorTable::Customers => &[
                ("sale_groups", "customer_id", true),
                ("debts", "customer_id", true),
            ],
            MirrorTable::Stores
            | MirrorTable::Inventory
            | MirrorTable::Sales
            | MirrorTable::Debts => &[],
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn json_text(value: Option<&Value>) -> SqlValue {
    match value {
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(Value::Number(n)) => SqlValue::Text(n.to_string()),
        _ => SqlValue::Null,
    }
}

fn json_integer(value: Option<&Value>) -> SqlValue {
    match value {
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_f64().map(|f| f.round() as i64))
            .map(SqlValue::Integer)
            .unwrap_or(SqlValue::Integer(0)),
        None => SqlValue::Integer(0),
    }
}

fn row_store_id(table: MirrorTable, row: &Value) -> Option<String> {
    let key = if table == MirrorTable::Stores { "id" } else { "store_id" };
    row.get("store_id")
        .or_else(|| row.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Insert or replace one mirror row.
fn upsert(
    conn: &Connection,
    table: MirrorTable,
    id: &str,
    store_id: &str,
    data: &Value,
    is_local: bool,
    client_ref: Option<&str>,
) -> Result<()> {
    let name = table.local_name();
    let extras = table.extra_columns();

    if table == MirrorTable::Inventory {
        // One inventory row per (store, product); a row under another id loses.
        let product_id = json_text(data.get("product_id"));
        conn.execute(
            "DELETE FROM inventory WHERE store_id = ?1 AND product_id = ?2 AND id != ?3",
            params![store_id, product_id, id],
        )?;
    }

    let mut columns = vec!["id", "store_id", "data", "is_local", "client_ref", "updated_at"];
    columns.extend_from_slice(extras);
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let mut updates = vec![
        "store_id = excluded.store_id".to_string(),
        "data = excluded.data".to_string(),
        "is_local = excluded.is_local".to_string(),
        format!("client_ref = COALESCE(excluded.client_ref, {name}.client_ref)"),
        "updated_at = excluded.updated_at".to_string(),
    ];
    updates.extend(extras.iter().map(|c| format!("{c} = excluded.{c}")));

    let sql = format!(
        "INSERT INTO {name} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    );

    let mut values: Vec<SqlValue> = vec![
        SqlValue::Text(id.to_string()),
        SqlValue::Text(store_id.to_string()),
        SqlValue::Text(data.to_string()),
        SqlValue::Integer(i64::from(is_local)),
        client_ref.map_or(SqlValue::Null, |c| SqlValue::Text(c.to_string())),
        SqlValue::Text(now()),
    ];
    for column in extras {
        if *column == "quantity" {
            values.push(json_integer(data.get(*column)));
        } else {
            values.push(json_text(data.get(*column)));
        }
    }

    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Write an optimistic row under a (usually temporary) id.
pub fn upsert_local(
    conn: &Connection,
    table: MirrorTable,
    id: &str,
    store_id: &str,
    data: Value,
    client_ref: &str,
) -> Result<()> {
    let mut data = data;
    if let Value::Object(fields) = &mut data {
        fields.insert("id".into(), Value::String(id.to_string()));
        fields.insert("store_id".into(), Value::String(store_id.to_string()));
    }
    upsert(conn, table, id, store_id, &data, is_local_id(id), Some(client_ref))
}

/// Merge `changes` into an existing row's data (optimistic update).
/// Returns `false` when the row is not mirrored locally.
pub fn merge_local(conn: &Connection, table: MirrorTable, id: &str, changes: &Value) -> Result<bool> {
    let Some(mut current) = get_row(conn, table, id)? else {
        return Ok(false);
    };
    let store_id = row_store_id(table, &current).unwrap_or_default();
    if let (Value::Object(fields), Value::Object(changes)) = (&mut current, changes) {
        for (k, v) in changes {
            fields.insert(k.clone(), v.clone());
        }
    }
    let client_ref: Option<String> = conn
        .query_row(
            &format!("SELECT client_ref FROM {} WHERE id = ?1", table.local_name()),
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    upsert(conn, table, id, &store_id, &current, is_local_id(id), client_ref.as_deref())?;
    Ok(true)
}

/// Store a server-confirmed row. Remote state replaces whatever is cached.
/// Returns the row id, or `None` for rows without an id or store.
pub fn upsert_remote(conn: &Connection, table: MirrorTable, row: &Value) -> Result<Option<String>> {
    let Some(id) = row_id(row) else {
        warn!(table = table.local_name(), "Remote row without id ignored");
        return Ok(None);
    };
    let Some(store_id) = row_store_id(table, row) else {
        warn!(table = table.local_name(), id = %id, "Remote row without store_id ignored");
        return Ok(None);
    };
    let client_ref = row.get("client_ref").and_then(Value::as_str);
    upsert(conn, table, &id, &store_id, row, false, client_ref)?;

    if table == MirrorTable::Sales {
        if let Some(devices) = row.get("device_ids").and_then(Value::as_array) {
            let devices: Vec<String> = devices
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            let product_id = row.get("product_id").and_then(Value::as_str);
            let group_id = row.get("sale_group_id").and_then(Value::as_str);
            mark_devices_sold(conn, &store_id, product_id, group_id, &devices)?;
        }
    }
    Ok(Some(id))
}

pub fn delete_row(conn: &Connection, table: MirrorTable, id: &str) -> Result<usize> {
    let removed = conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", table.local_name()),
        params![id],
    )?;
    Ok(removed)
}

pub fn get_row(conn: &Connection, table: MirrorTable, id: &str) -> Result<Option<Value>> {
    let data: Option<String> = conn
        .query_row(
            &format!("SELECT data FROM {} WHERE id = ?1", table.local_name()),
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(data.map(|d| serde_json::from_str(&d).unwrap_or(Value::Null)))
}

pub fn list_rows(conn: &Connection, table: MirrorTable, store_id: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT data FROM {} WHERE store_id = ?1 ORDER BY id",
        table.local_name()
    ))?;
    let rows = stmt
        .query_map(params![store_id], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .filter_map(|d| serde_json::from_str(&d).ok())
        .collect();
    Ok(rows)
}

/// Ids in `table` still living under a temporary id.
pub fn local_ids(conn: &Connection, table: MirrorTable) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE is_local = 1 ORDER BY id",
        table.local_name()
    ))?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Inventory & devices
// ---------------------------------------------------------------------------

pub fn inventory_quantity(conn: &Connection, store_id: &str, product_id: &str) -> Result<Option<i64>> {
    let quantity = conn
        .query_row(
            "SELECT quantity FROM inventory WHERE store_id = ?1 AND product_id = ?2",
            params![store_id, product_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(quantity)
}

/// Apply `delta` to the cached stock of a product, creating a local row when
/// the product has none yet. Returns the new cached quantity.
pub fn adjust_local_inventory(
    conn: &Connection,
    store_id: &str,
    product_id: &str,
    delta: i64,
    client_ref: &str,
) -> Result<i64> {
    let updated = conn.execute(
        "UPDATE inventory
         SET quantity = quantity + ?3,
             data = json_set(data, '$.quantity', quantity + ?3),
             updated_at = ?4
         WHERE store_id = ?1 AND product_id = ?2",
        params![store_id, product_id, delta, now()],
    )?;
    if updated == 0 {
        let id = new_local_id();
        upsert_local(
            conn,
            MirrorTable::Inventory,
            &id,
            store_id,
            serde_json::json!({ "product_id": product_id, "quantity": delta }),
            client_ref,
        )?;
    }
    Ok(inventory_quantity(conn, store_id, product_id)?.unwrap_or(delta))
}

/// Canonical form of an IMEI/serial number. Every registry read and write
/// goes through this so padded input cannot dodge the sold check.
pub fn normalize_device_id(device_id: &str) -> &str {
    device_id.trim()
}

/// `Some("sold")`, `Some("in_stock")`, or `None` for unknown devices.
pub fn device_status(conn: &Connection, store_id: &str, device_id: &str) -> Result<Option<String>> {
    let device_id = normalize_device_id(device_id);
    let status = conn
        .query_row(
            "SELECT status FROM product_devices WHERE store_id = ?1 AND device_id = ?2",
            params![store_id, device_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status)
}

pub fn register_device(conn: &Connection, store_id: &str, device_id: &str, product_id: &str) -> Result<()> {
    let device_id = normalize_device_id(device_id);
    conn.execute(
        "INSERT INTO product_devices (store_id, device_id, product_id, status, updated_at)
         VALUES (?1, ?2, ?3, 'in_stock', ?4)
         ON CONFLICT(store_id, device_id) DO UPDATE SET
            product_id = excluded.product_id,
            updated_at = excluded.updated_at",
        params![store_id, device_id, product_id, now()],
    )?;
    Ok(())
}

pub fn mark_devices_sold(
    conn: &Connection,
    store_id: &str,
    product_id: Option<&str>,
    sale_group_id: Option<&str>,
    device_ids: &[String],
) -> Result<()> {
    for device_id in device_ids {
        let device_id = normalize_device_id(device_id);
        conn.execute(
            "INSERT INTO product_devices (store_id, device_id, product_id, status, sale_group_id, updated_at)
             VALUES (?1, ?2, ?3, 'sold', ?4, ?5)
             ON CONFLICT(store_id, device_id) DO UPDATE SET
                product_id = COALESCE(excluded.product_id, product_devices.product_id),
                status = 'sold',
                sale_group_id = COALESCE(excluded.sale_group_id, product_devices.sale_group_id),
                updated_at = excluded.updated_at",
            params![store_id, device_id, product_id, sale_group_id, now()],
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Id mapping
// ---------------------------------------------------------------------------

pub fn record_id_mapping(
    conn: &Connection,
    local_id: &str,
    server_id: &str,
    table: MirrorTable,
    client_ref: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO id_map (local_id, server_id, entity_table, client_ref, mapped_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(local_id) DO UPDATE SET
            server_id = excluded.server_id,
            mapped_at = excluded.mapped_at",
        params![local_id, server_id, table.local_name(), client_ref, now()],
    )?;
    Ok(())
}

/// Resolve an id for use against the remote. Server ids pass through;
/// temporary ids map through `id_map` and yield `None` until synced.
pub fn resolve_id(conn: &Connection, id: &str) -> Result<Option<String>> {
    if !is_local_id(id) {
        return Ok(Some(id.to_string()));
    }
    let server_id = conn
        .query_row(
            "SELECT server_id FROM id_map WHERE local_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(server_id)
}

/// Replace `local_id` with `server_id` everywhere it is referenced locally.
///
/// If the server row is already mirrored (e.g. pushed by the change feed
/// first), the optimistic row is dropped instead of renamed.
pub fn rewrite_local_id(
    conn: &Connection,
    table: MirrorTable,
    local_id: &str,
    server_id: &str,
) -> Result<()> {
    if local_id == server_id {
        return Ok(());
    }
    let name = table.local_name();
    let server_exists: bool = conn
        .query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {name} WHERE id = ?1)"),
            params![server_id],
            |row| row.get(0),
        )?;

    if server_exists {
        conn.execute(&format!("DELETE FROM {name} WHERE id = ?1"), params![local_id])?;
    } else {
        conn.execute(
            &format!(
                "UPDATE {name}
                 SET id = ?2, is_local = 0, data = json_set(data, '$.id', ?2), updated_at = ?3
                 WHERE id = ?1"
            ),
            params![local_id, server_id, now()],
        )?;
    }

    for (dep_table, column, has_data) in table.dependents() {
        if *dep_table == "inventory" {
            conn.execute(
                "DELETE FROM inventory
                 WHERE product_id = ?1
                   AND EXISTS (SELECT 1 FROM inventory other
                               WHERE other.product_id = ?2 AND other.store_id = inventory.store_id)",
                params![local_id, server_id],
            )?;
        }
        let sql = if *has_data {
            format!(
                "UPDATE {dep_table}
                 SET {column} = ?2, data = json_set(data, '$.{column}', ?2)
                 WHERE {column} = ?1"
            )
        } else {
            format!("UPDATE {dep_table} SET {column} = ?2 WHERE {column} = ?1")
        };
        conn.execute(&sql, params![local_id, server_id])?;
    }

    conn.execute(
        "UPDATE offline_queue SET entity_id = ?2, updated_at = ?3
         WHERE entity_id = ?1 AND status != 'synced'",
        params![local_id, server_id, now()],
    )?;

    debug!(table = name, local_id, server_id, "Rewrote local id");
    Ok(())
}

// ---------------------------------------------------------------------------
// Remote change events
// ---------------------------------------------------------------------------

/// Apply one pushed change. Rows for tables that are not mirrored are ignored.
pub fn apply_change(conn: &Connection, event: &ChangeEvent) -> Result<()> {
    let Some(table) = MirrorTable::from_remote(&event.table) else {
        return Ok(());
    };

    match event.kind {
        ChangeKind::Delete => {
            match row_id(&event.row) {
                Some(id) => {
                    delete_row(conn, table, &id)?;
                }
                None => warn!(table = table.local_name(), "Delete event without id ignored"),
            }
        }
        ChangeKind::Insert | ChangeKind::Update => {
            let server_id = row_id(&event.row);
            let client_ref = event.row.get("client_ref").and_then(Value::as_str);
            if let (Some(server_id), Some(client_ref)) = (server_id.as_deref(), client_ref) {
                let local: Option<String> = conn
                    .query_row(
                        &format!(
                            "SELECT id FROM {} WHERE client_ref = ?1 AND is_local = 1 AND id != ?2",
                            table.local_name()
                        ),
                        params![client_ref, server_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(local_id) = local {
                    rewrite_local_id(conn, table, &local_id, server_id)?;
                    record_id_mapping(conn, &local_id, server_id, table, Some(client_ref))?;
                }
            }
            upsert_remote(conn, table, &event.row)?;
        }
    }
    Ok(())
}

/// Drop the optimistic rows written for one queue entry. Devices reserved by
/// a dropped sale return to stock.
pub fn remove_local_rows_for(conn: &Connection, client_ref: &str) -> Result<usize> {
    let line_pattern = format!("{client_ref}:%");
    let group_ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM sale_groups WHERE is_local = 1 AND client_ref = ?1",
        )?;
        let ids = stmt
            .query_map(params![client_ref], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        ids
    };
    for group_id in &group_ids {
        conn.execute(
            "UPDATE product_devices SET status = 'in_stock', sale_group_id = NULL
             WHERE sale_group_id = ?1",
            params![group_id],
        )?;
    }

    let mut removed = 0;
    for table in MirrorTable::ALL {
        removed += conn.execute(
            &format!(
                "DELETE FROM {} WHERE is_local = 1 AND (client_ref = ?1 OR client_ref LIKE ?2)",
                table.local_name()
            ),
            params![client_ref, line_pattern],
        )?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    fn conn() -> db::DbState {
        db::open_in_memory().expect("db")
    }

    #[test]
    fn test_local_ids_are_prefixed_and_unique() {
        let a = new_local_id();
        let b = new_local_id();
        assert!(is_local_id(&a));
        assert_ne!(a, b);
        assert!(!is_local_id("srv-1"));
    }

    #[test]
    fn test_remote_upsert_wins_over_local() {
        let state = conn();
        let conn = state.conn.lock().unwrap();
        upsert_local(
            &conn,
            MirrorTable::Products,
            "p-1",
            "s1",
            json!({ "name": "Local name" }),
            "ref-1",
        )
        .unwrap();
        upsert_remote(
            &conn,
            MirrorTable::Products,
            &json!({ "id": "p-1", "store_id": "s1", "name": "Server name" }),
        )
        .unwrap();

        let row = get_row(&conn, MirrorTable::Products, "p-1").unwrap().unwrap();
        assert_eq!(row["name"], "Server name");
    }

    #[test]
    fn test_rewrite_local_id_moves_all_references() {
        let state = conn();
        let conn = state.conn.lock().unwrap();
        let product = new_local_id();
        upsert_local(&conn, MirrorTable::Products, &product, "s1", json!({ "name": "Case" }), "ref-p").unwrap();
        adjust_local_inventory(&conn, "s1", &product, 5, "ref-p").unwrap();
        upsert_local(
            &conn,
            MirrorTable::Sales,
            &new_local_id(),
            "s1",
            json!({ "product_id": product, "quantity": 1 }),
            "ref-s:0",
        )
        .unwrap();
        register_device(&conn, "s1", "IMEI-1", &product).unwrap();

        rewrite_local_id(&conn, MirrorTable::Products, &product, "srv-9").unwrap();

        assert!(get_row(&conn, MirrorTable::Products, &product).unwrap().is_none());
        assert_eq!(get_row(&conn, MirrorTable::Products, "srv-9").unwrap().unwrap()["id"], "srv-9");
        assert_eq!(inventory_quantity(&conn, "s1", "srv-9").unwrap(), Some(5));
        let sales = list_rows(&conn, MirrorTable::Sales, "s1").unwrap();
        assert_eq!(sales[0]["product_id"], "srv-9");

        let dangling: i64 = conn
            .query_row(
                "SELECT
                    (SELECT COUNT(*) FROM products WHERE id = ?1)
                  + (SELECT COUNT(*) FROM inventory WHERE product_id = ?1)
                  + (SELECT COUNT(*) FROM sales WHERE product_id = ?1 OR data LIKE '%' || ?1 || '%')
                  + (SELECT COUNT(*) FROM product_devices WHERE product_id = ?1)",
                params![product],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dangling, 0);
    }

    #[test]
    fn test_rewrite_drops_local_row_when_server_row_exists() {
        let state = conn();
        let conn = state.conn.lock().unwrap();
        let group = new_local_id();
        upsert_local(&conn, MirrorTable::SaleGroups, &group, "s1", json!({ "total_amount": 10.0 }), "ref-g").unwrap();
        upsert_remote(
            &conn,
            MirrorTable::SaleGroups,
            &json!({ "id": "srv-1", "store_id": "s1", "total_amount": 10.0, "client_ref": "ref-g" }),
        )
        .unwrap();

        rewrite_local_id(&conn, MirrorTable::SaleGroups, &group, "srv-1").unwrap();
        let rows = list_rows(&conn, MirrorTable::SaleGroups, "s1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "srv-1");
    }

    #[test]
    fn test_resolve_id_through_map() {
        let state = conn();
        let conn = state.conn.lock().unwrap();
        let local = new_local_id();
        assert_eq!(resolve_id(&conn, "srv-3").unwrap().as_deref(), Some("srv-3"));
        assert!(resolve_id(&conn, &local).unwrap().is_none());
        record_id_mapping(&conn, &local, "srv-3", MirrorTable::Products, None).unwrap();
        assert_eq!(resolve_id(&conn, &local).unwrap().as_deref(), Some("srv-3"));
    }

    #[test]
    fn test_apply_change_replaces_optimistic_row_by_client_ref() {
        let state = conn();
        let conn = state.conn.lock().unwrap();
        let local = new_local_id();
        upsert_local(&conn, MirrorTable::Debts, &local, "s1", json!({ "amount": 40.0 }), "ref-d").unwrap();

        let event = ChangeEvent {
            table: tables::DEBTS.into(),
            kind: ChangeKind::Insert,
            row: json!({ "id": "srv-5", "store_id": "s1", "amount": 40.0, "client_ref": "ref-d" }),
        };
        apply_change(&conn, &event).unwrap();

        assert!(local_ids(&conn, MirrorTable::Debts).unwrap().is_empty());
        assert_eq!(resolve_id(&conn, &local).unwrap().as_deref(), Some("srv-5"));

        let delete = ChangeEvent {
            table: tables::DEBTS.into(),
            kind: ChangeKind::Delete,
            row: json!({ "id": "srv-5" }),
        };
        apply_change(&conn, &delete).unwrap();
        assert!(get_row(&conn, MirrorTable::Debts, "srv-5").unwrap().is_none());
    }

    #[test]
    fn test_apply_change_deletes_numeric_id_row() {
        let state = conn();
        let conn = state.conn.lock().unwrap();
        let insert = ChangeEvent {
            table: tables::DEBTS.into(),
            kind: ChangeKind::Insert,
            row: json!({ "id": 42, "store_id": "s1", "amount": 10.0 }),
        };
        apply_change(&conn, &insert).unwrap();
        assert!(get_row(&conn, MirrorTable::Debts, "42").unwrap().is_some());

        let delete = ChangeEvent {
            table: tables::DEBTS.into(),
            kind: ChangeKind::Delete,
            row: json!({ "id": 42 }),
        };
        apply_change(&conn, &delete).unwrap();
        assert!(get_row(&conn, MirrorTable::Debts, "42").unwrap().is_none());

        let no_id = ChangeEvent {
            table: tables::DEBTS.into(),
            kind: ChangeKind::Delete,
            row: json!({ "store_id": "s1" }),
        };
        apply_change(&conn, &no_id).unwrap();
    }

    #[test]
    fn test_device_registry_ignores_padding() {
        let state = conn();
        let conn = state.conn.lock().unwrap();
        register_device(&conn, "s1", " SN-9 ", "p1").unwrap();
        assert_eq!(device_status(&conn, "s1", "SN-9").unwrap().as_deref(), Some("in_stock"));
        upsert_remote(
            &conn,
            MirrorTable::Sales,
            &json!({ "id": "line-9", "store_id": "s1", "product_id": "p1",
                     "sale_group_id": "g9", "device_ids": ["SN-9\n"] }),
        )
        .unwrap();
        assert_eq!(device_status(&conn, "s1", " SN-9").unwrap().as_deref(), Some("sold"));
    }

    #[test]
    fn test_remote_sale_marks_devices_sold() {
        let state = conn();
        let conn = state.conn.lock().unwrap();
        register_device(&conn, "s1", "SN-1", "p1").unwrap();
        upsert_remote(
            &conn,
            MirrorTable::Sales,
            &json!({ "id": "line-1", "store_id": "s1", "product_id": "p1",
                     "sale_group_id": "g1", "device_ids": ["SN-1"] }),
        )
        .unwrap();
        assert_eq!(device_status(&conn, "s1", "SN-1").unwrap().as_deref(), Some("sold"));
    }

    #[test]
    fn test_inventory_adjust_creates_and_updates() {
        let state = conn();
        let conn = state.conn.lock().unwrap();
        assert_eq!(adjust_local_inventory(&conn, "s1", "p1", 10, "r1").unwrap(), 10);
        assert_eq!(adjust_local_inventory(&conn, "s1", "p1", -3, "r2").unwrap(), 7);
        let rows = list_rows(&conn, MirrorTable::Inventory, "s1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["quantity"], 7);
    }
}
