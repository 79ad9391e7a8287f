//! Retail Sync
//!
//! Offline-first sync subsystem for retail terminals. Sales, inventory
//! adjustments, debts and product edits are recorded into a durable SQLite
//! queue with optimistic writes to a local mirror of the hosted tables, then
//! replayed against the remote store in FIFO order once connectivity returns.
//!
//! The [`SyncEngine`] facade wires the pieces together; the
//! [`commands`] module exposes the same operations as JSON handlers for a
//! UI host.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod commands;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod mirror;
pub mod mutations;
pub mod queue;
pub mod realtime;
pub mod reconciler;
pub mod remote;
pub mod status;

pub use config::{Session, SyncConfig};
pub use connectivity::ConnectivityMonitor;
pub use db::DbState;
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use queue::{EntityType, Mutation, OfflineMutationQueue, Operation, QueueEntry, QueueStatus};
pub use reconciler::{ReconcileReport, Reconciler};
pub use remote::{RemoteError, RemoteStore};
pub use status::{StatusProjector, SyncStatus};

/// Install structured logging: console plus a daily rolling file in
/// `log_dir`. Keep the returned guard alive until exit; dropping it flushes
/// the file writer.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,retail_sync=debug"));

    diagnostics::prune_old_logs(log_dir);
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log dir {}: {e}", log_dir.display());
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

/// Merge the two positional IPC arguments into one payload. Keys in `arg1`
/// override keys in `arg0` when both are objects.
pub(crate) fn parse_channel_payload(
    arg0: Option<serde_json::Value>,
    arg1: Option<serde_json::Value>,
) -> serde_json::Value {
    match (arg0, arg1) {
        (Some(serde_json::Value::Object(mut obj0)), Some(serde_json::Value::Object(obj1))) => {
            for (k, v) in obj1 {
                obj0.insert(k, v);
            }
            serde_json::Value::Object(obj0)
        }
        (Some(v), _) => v,
        (None, Some(v)) => v,
        _ => serde_json::json!({}),
    }
}

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_channel_payload_merges_objects() {
        let merged = parse_channel_payload(
            Some(json!({ "entityType": "sale", "a": 1 })),
            Some(json!({ "a": 2, "b": 3 })),
        );
        assert_eq!(merged, json!({ "entityType": "sale", "a": 2, "b": 3 }));
        assert_eq!(parse_channel_payload(None, Some(json!("x"))), json!("x"));
        assert_eq!(parse_channel_payload(None, None), json!({}));
    }

    #[test]
    fn test_value_helpers_take_first_usable_key() {
        let v = json!({ "clientRef": "  ", "client_ref": " r1 ", "limit": 5 });
        assert_eq!(value_str(&v, &["clientRef", "client_ref"]).as_deref(), Some("r1"));
        assert_eq!(value_i64(&v, &["max", "limit"]), Some(5));
        assert_eq!(value_i64(&v, &["max"]), None);
    }
}
