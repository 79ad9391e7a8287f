//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the
//! category/key/value settings helpers, and the shared connection state used
//! by the queue, the mirror cache and the reconciler.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::Result;

/// Shared database handle. The connection is never held across an `.await`.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
pub(crate) const CURRENT_SCHEMA_VERSION: i32 = 3;

const DB_FILE_NAME: &str = "retail-sync.db";

/// Initialize the database at `{data_dir}/retail-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| crate::SyncError::Config(format!("failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a migrated in-memory database. Used by tests and by embedders that
/// do not need durability.
pub fn open_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub(crate) fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, the offline queue and the sync log.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- offline_queue (one row per logical mutation)
        CREATE TABLE IF NOT EXISTS offline_queue (
            queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_ref TEXT UNIQUE NOT NULL,
            entity_type TEXT NOT NULL CHECK(entity_type IN
                ('sale', 'sale_group', 'inventory_adjustment', 'debt', 'product')),
            operation TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            store_id TEXT NOT NULL,
            device_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN
                ('pending', 'syncing', 'synced', 'failed')),
            priority INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            payload TEXT NOT NULL,
            payload_digest TEXT NOT NULL,
            checkpoint TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced_at TEXT
        );

        -- Synced entries are terminal.
        CREATE TRIGGER IF NOT EXISTS trg_offline_queue_synced_immutable
        BEFORE UPDATE ON offline_queue
        WHEN OLD.status = 'synced'
        BEGIN
            SELECT RAISE(ABORT, 'synced queue entries are immutable');
        END;

        -- Sales-only projection of the queue.
        CREATE VIEW IF NOT EXISTS offline_sales_queue AS
            SELECT queue_id, client_ref, entity_type, operation, entity_id, store_id,
                   status, priority, attempts, last_error, created_at, synced_at, payload
            FROM offline_queue
            WHERE entity_type IN ('sale', 'sale_group');

        -- sync_log (append-only audit of reconciliation outcomes)
        CREATE TABLE IF NOT EXISTS sync_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_ref TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            outcome TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            message TEXT,
            logged_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_offline_queue_status ON offline_queue(status);
        CREATE INDEX IF NOT EXISTS idx_offline_queue_store ON offline_queue(store_id, status);
        CREATE INDEX IF NOT EXISTS idx_offline_queue_entity ON offline_queue(entity_id);
        CREATE INDEX IF NOT EXISTS idx_sync_log_client_ref ON sync_log(client_ref);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        e
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: mirrored entity cache.
///
/// Every mirror row keeps the last known full row as JSON in `data`; key
/// columns are lifted out for indexing and for id rewrites. `is_local = 1`
/// marks rows that only exist optimistically under a temporary id.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS stores (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            is_local INTEGER NOT NULL DEFAULT 0,
            client_ref TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            is_local INTEGER NOT NULL DEFAULT 0,
            client_ref TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            is_local INTEGER NOT NULL DEFAULT 0,
            client_ref TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS inventory (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}',
            is_local INTEGER NOT NULL DEFAULT 0,
            client_ref TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sale_groups (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            customer_id TEXT,
            data TEXT NOT NULL DEFAULT '{}',
            is_local INTEGER NOT NULL DEFAULT 0,
            client_ref TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            sale_group_id TEXT,
            product_id TEXT,
            data TEXT NOT NULL DEFAULT '{}',
            is_local INTEGER NOT NULL DEFAULT 0,
            client_ref TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS debts (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            customer_id TEXT,
            data TEXT NOT NULL DEFAULT '{}',
            is_local INTEGER NOT NULL DEFAULT 0,
            client_ref TEXT,
            updated_at TEXT NOT NULL
        );

        -- Serial/IMEI registry for duplicate-sale validation.
        CREATE TABLE IF NOT EXISTS product_devices (
            store_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            product_id TEXT,
            status TEXT NOT NULL DEFAULT 'in_stock' CHECK(status IN ('in_stock', 'sold')),
            sale_group_id TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(store_id, device_id)
        );

        CREATE INDEX IF NOT EXISTS idx_stores_store_id ON stores(store_id, id);
        CREATE INDEX IF NOT EXISTS idx_customers_store_id ON customers(store_id, id);
        CREATE INDEX IF NOT EXISTS idx_products_store_id ON products(store_id, id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_inventory_store_product
            ON inventory(store_id, product_id);
        CREATE INDEX IF NOT EXISTS idx_sale_groups_store_id ON sale_groups(store_id, id);
        CREATE INDEX IF NOT EXISTS idx_sales_store_id ON sales(store_id, id);
        CREATE INDEX IF NOT EXISTS idx_sales_group ON sales(sale_group_id);
        CREATE INDEX IF NOT EXISTS idx_debts_store_id ON debts(store_id, id);
        CREATE INDEX IF NOT EXISTS idx_product_devices_product ON product_devices(product_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        e
    })?;

    info!("Applied migration v2 (mirrored entity cache)");
    Ok(())
}

/// Migration v3: temporary id to server id map.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS id_map (
            local_id TEXT PRIMARY KEY,
            server_id TEXT NOT NULL,
            entity_table TEXT NOT NULL,
            client_ref TEXT,
            mapped_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_id_map_server_id ON id_map(server_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        e
    })?;

    info!("Applied migration v3 (id_map)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// All key/value pairs of one settings category, ordered by key.
pub fn get_settings_in_category(conn: &Connection, category: &str) -> Vec<(String, String)> {
    let mut stmt = match conn.prepare(
        "SELECT setting_key, setting_value FROM local_settings
         WHERE setting_category = ?1 ORDER BY setting_key",
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("get_settings_in_category prepare: {e}");
            return Vec::new();
        }
    };

    let rows = match stmt.query_map(params![category], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    }) {
        Ok(r) => r,
        Err(e) => {
            error!("get_settings_in_category query: {e}");
            return Vec::new();
        }
    };

    rows.flatten().collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn insert_queue_row(conn: &Connection, client_ref: &str, entity_type: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO offline_queue (client_ref, entity_type, operation, entity_id, store_id,
                                        payload, payload_digest, created_at, updated_at)
             VALUES (?1, ?2, 'create', 'local_1', 'store-1', '{}', 'x',
                     datetime('now'), datetime('now'))",
            params![client_ref, entity_type],
        )
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "local_settings",
            "offline_queue",
            "offline_sales_queue",
            "sync_log",
            "stores",
            "customers",
            "products",
            "inventory",
            "sale_groups",
            "sales",
            "debts",
            "product_devices",
            "id_map",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing {expected}"
            );
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = std::env::temp_dir().join(format!("retail_sync_wal_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let db_path = dir.join("test_wal.db");
        let _ = std::fs::remove_file(&db_path);

        let conn = open_and_configure(&db_path).expect("open temp db");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");

        drop(conn);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_client_ref_unique() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        insert_queue_row(&conn, "ref-1", "sale").expect("first insert");
        assert!(
            insert_queue_row(&conn, "ref-1", "sale").is_err(),
            "duplicate client_ref should be rejected"
        );
    }

    #[test]
    fn test_synced_rows_reject_updates() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        insert_queue_row(&conn, "ref-1", "sale").expect("insert");

        conn.execute(
            "UPDATE offline_queue SET status = 'synced', synced_at = datetime('now')
             WHERE client_ref = 'ref-1'",
            [],
        )
        .expect("pending -> synced is allowed");

        let result = conn.execute(
            "UPDATE offline_queue SET status = 'pending' WHERE client_ref = 'ref-1'",
            [],
        );
        assert!(result.is_err(), "synced row must be immutable");
    }

    #[test]
    fn test_sales_view_filters_entity_types() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        insert_queue_row(&conn, "ref-sale", "sale").unwrap();
        insert_queue_row(&conn, "ref-group", "sale_group").unwrap();
        insert_queue_row(&conn, "ref-debt", "debt").unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM offline_sales_queue", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_unknown_entity_type_rejected() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        assert!(insert_queue_row(&conn, "ref-x", "refund").is_err());
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        assert!(get_setting(&conn, "sync", "step_timeout_secs").is_none());
        set_setting(&conn, "sync", "step_timeout_secs", "10").unwrap();
        set_setting(&conn, "sync", "health_path", "/health").unwrap();
        assert_eq!(
            get_setting(&conn, "sync", "step_timeout_secs").as_deref(),
            Some("10")
        );

        set_setting(&conn, "sync", "step_timeout_secs", "20").unwrap();
        let all = get_settings_in_category(&conn, "sync");
        assert_eq!(
            all,
            vec![
                ("health_path".to_string(), "/health".to_string()),
                ("step_timeout_secs".to_string(), "20".to_string()),
            ]
        );
    }
}
