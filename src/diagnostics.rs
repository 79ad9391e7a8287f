//! Diagnostics for the sync subsystem.
//!
//! Provides a health snapshot (schema version, queue backlog by status,
//! recent failures from `sync_log`) and the log rotation helper used by
//! [`crate::init_logging`].

use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db::DbState;
use crate::error::Result;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the daily rolling log files.
pub const LOG_FILE_PREFIX: &str = "retail-sync";

/// Number of recent failures included in a snapshot.
const RECENT_FAILURES: i64 = 20;

fn queue_counts(conn: &Connection) -> Result<Value> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM offline_queue GROUP BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    let mut counts = json!({ "pending": 0, "syncing": 0, "synced": 0, "failed": 0 });
    for row in rows {
        let (status, count) = row?;
        counts[status] = json!(count);
    }
    Ok(counts)
}

fn recent_failures(conn: &Connection) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT client_ref, entity_type, attempt, message, logged_at
         FROM sync_log
         WHERE outcome = 'failed'
         ORDER BY id DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![RECENT_FAILURES], |row| {
        Ok(json!({
            "clientRef": row.get::<_, String>(0)?,
            "entityType": row.get::<_, String>(1)?,
            "attempt": row.get::<_, i64>(2)?,
            "message": row.get::<_, Option<String>>(3)?,
            "loggedAt": row.get::<_, String>(4)?,
        }))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Health snapshot for support screens and the daemon's startup log.
pub fn snapshot(db: &DbState) -> Result<Value> {
    let conn = db.conn.lock()?;
    let schema_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    let last_sync: Option<String> = conn.query_row(
        "SELECT MAX(logged_at) FROM sync_log WHERE outcome = 'synced'",
        [],
        |row| row.get(0),
    )?;
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
        "schemaVersion": schema_version,
        "queue": queue_counts(&conn)?,
        "lastSyncTime": last_sync,
        "recentFailures": recent_failures(&conn)?,
        "dbSizeBytes": db_size,
    }))
}

/// Prune old log files in `log_dir`, keeping only the most recent
/// `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&format!("{LOG_FILE_PREFIX}.")) {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::queue;

    #[test]
    fn test_snapshot_counts_queue_and_failures() {
        let state = db::open_in_memory().unwrap();
        {
            let conn = state.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO offline_queue
                    (client_ref, entity_type, operation, entity_id, store_id, status, payload,
                     payload_digest, created_at, updated_at)
                 VALUES ('r1', 'debt', 'create', 'd1', 's1', 'failed', '{}', ?1, 'now', 'now')",
                params![queue::payload_digest("{}")],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO sync_log (client_ref, entity_type, outcome, attempt, message, logged_at)
                 VALUES ('r1', 'debt', 'failed', 1, 'HTTP 500', '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }

        let snap = snapshot(&state).unwrap();
        assert_eq!(snap["queue"]["failed"], 1);
        assert_eq!(snap["queue"]["pending"], 0);
        assert_eq!(snap["recentFailures"][0]["message"], "HTTP 500");
        assert!(snap["lastSyncTime"].is_null());
        assert!(snap["schemaVersion"].as_i64().unwrap() >= 3);
    }

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = std::env::temp_dir().join(format!("retail-sync-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for i in 0..(MAX_LOG_FILES + 3) {
            fs::write(dir.join(format!("{LOG_FILE_PREFIX}.2026-01-{:02}", i + 1)), "x").unwrap();
        }
        fs::write(dir.join("unrelated.txt"), "keep").unwrap();

        prune_old_logs(&dir);

        let remaining: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
            .collect();
        assert_eq!(remaining.len(), MAX_LOG_FILES);
        assert!(dir.join("unrelated.txt").exists());
        fs::remove_dir_all(&dir).ok();
    }
}
