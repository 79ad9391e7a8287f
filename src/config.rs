//! Session context and engine configuration.
//!
//! The session (which store, which user, which device) is passed in
//! explicitly by the host application. Configuration comes from the
//! environment or a connection string, then `local_settings` rows in the
//! `sync` category override individual values.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::db;
use crate::error::{Result, SyncError};

const ENV_PREFIX: &str = "RETAIL_SYNC_";
pub(crate) const SETTINGS_CATEGORY: &str = "sync";

/// Identity of the terminal recording mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub store_id: String,
    pub user_id: String,
    pub device_id: String,
}

impl Session {
    pub fn new(
        store_id: impl Into<String>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let store_id = env_var("STORE_ID")
            .ok_or_else(|| SyncError::Config(format!("{ENV_PREFIX}STORE_ID is not set")))?;
        let user_id = env_var("USER_ID").unwrap_or_else(|| "system".to_string());
        let device_id = env_var("DEVICE_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(Self::new(store_id, user_id, device_id))
    }
}

#[derive(Clone)]
pub struct SyncConfig {
    pub remote_url: Option<String>,
    pub api_key: Option<Zeroizing<String>>,
    /// Upper bound for a single remote step.
    pub step_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_path: String,
    pub realtime_poll_interval: Duration,
    /// Synced queue entries older than this are pruned.
    pub synced_retention: chrono::Duration,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("remote_url", &self.remote_url)
            .field("api_key", &self.api_key.as_ref().map(|k| mask_secret(k)))
            .field("step_timeout", &self.step_timeout)
            .field("health_check_interval", &self.health_check_interval)
            .field("health_path", &self.health_path)
            .field("realtime_poll_interval", &self.realtime_poll_interval)
            .field("synced_retention", &self.synced_retention)
            .field("data_dir", &self.data_dir)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            remote_url: None,
            api_key: None,
            step_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(15),
            health_path: "/auth/v1/health".to_string(),
            realtime_poll_interval: Duration::from_secs(10),
            synced_retention: chrono::Duration::days(7),
            log_dir: data_dir.join("logs"),
            data_dir,
        }
    }
}

impl SyncConfig {
    /// Build from `RETAIL_SYNC_*` environment variables.
    ///
    /// `RETAIL_SYNC_CONNECTION` may carry a connection string with both the
    /// URL and the key; explicit `RETAIL_SYNC_REMOTE_URL` / `RETAIL_SYNC_API_KEY`
    /// win over it.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(raw) = env_var("CONNECTION") {
            config.remote_url = extract_url_from_connection_string(&raw);
            config.api_key = extract_key_from_connection_string(&raw).map(Zeroizing::new);
        }
        if let Some(url) = env_var("REMOTE_URL") {
            config.remote_url = Some(url);
        }
        if let Some(key) = env_var("API_KEY") {
            config.api_key = Some(Zeroizing::new(key));
        }
        if let Some(dir) = env_var("DATA_DIR") {
            config.data_dir = PathBuf::from(&dir);
            config.log_dir = config.data_dir.join("logs");
        }
        if let Some(dir) = env_var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_var("HEALTH_PATH") {
            config.health_path = path;
        }
        if let Some(secs) = env_var("STEP_TIMEOUT_SECS").and_then(|v| parse_secs("STEP_TIMEOUT_SECS", &v)) {
            config.step_timeout = secs;
        }
        if let Some(secs) = env_var("HEALTH_INTERVAL_SECS")
            .and_then(|v| parse_secs("HEALTH_INTERVAL_SECS", &v))
        {
            config.health_check_interval = secs;
        }
        if let Some(secs) = env_var("REALTIME_POLL_SECS")
            .and_then(|v| parse_secs("REALTIME_POLL_SECS", &v))
        {
            config.realtime_poll_interval = secs;
        }

        config
    }

    /// Apply overrides stored in `local_settings` (category `sync`).
    pub fn apply_local_overrides(&mut self, conn: &Connection) {
        for (key, value) in db::get_settings_in_category(conn, SETTINGS_CATEGORY) {
            match key.as_str() {
                "remote_url" => self.remote_url = Some(value),
                "health_path" => self.health_path = value,
                "step_timeout_secs" => {
                    if let Some(d) = parse_secs(&key, &value) {
                        self.step_timeout = d;
                    }
                }
                "health_interval_secs" => {
                    if let Some(d) = parse_secs(&key, &value) {
                        self.health_check_interval = d;
                    }
                }
                "realtime_poll_secs" => {
                    if let Some(d) = parse_secs(&key, &value) {
                        self.realtime_poll_interval = d;
                    }
                }
                "synced_retention_days" => match value.trim().parse::<i64>() {
                    Ok(days) if days >= 0 => self.synced_retention = chrono::Duration::days(days),
                    _ => warn!(key = %key, value = %value, "Ignoring invalid sync setting"),
                },
                other => warn!(key = other, "Unknown sync setting"),
            }
        }
    }

    /// Whether a remote backend is configured at all.
    pub fn is_configured(&self) -> bool {
        self.remote_url.as_deref().is_some_and(|u| !u.trim().is_empty())
            && self.api_key.as_ref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Persist the URL into `local_settings` so later runs pick it up without
    /// environment variables. The key is never written to the database.
    pub fn store_remote_url(conn: &Connection, url: &str) -> Result<()> {
        db::set_setting(conn, SETTINGS_CATEGORY, "remote_url", url.trim())?;
        info!("Stored remote URL in local settings");
        Ok(())
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_secs(key: &str, raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!(key, value = raw, "Ignoring invalid duration setting");
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .or_else(|_| std::env::var("LOCALAPPDATA"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("retail-sync")
}

/// Mask all but the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Decode a connection string: either raw JSON or URL-safe base64 of JSON,
/// shaped `{ "url": "...", "key": "..." }`.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .or_else(|| v.get("anonKey"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(crate::remote::normalize_base_url)
        })
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "CONNECTION",
            "REMOTE_URL",
            "API_KEY",
            "DATA_DIR",
            "LOG_DIR",
            "HEALTH_PATH",
            "STEP_TIMEOUT_SECS",
            "HEALTH_INTERVAL_SECS",
            "REALTIME_POLL_SECS",
            "STORE_ID",
            "USER_ID",
            "DEVICE_ID",
        ] {
            std::env::remove_var(format!("{ENV_PREFIX}{key}"));
        }
    }

    #[test]
    fn test_connection_string_base64_and_json() {
        let json = r#"{"url":"demo.supabase.co","key":"anon-key-123"}"#;
        assert_eq!(
            extract_url_from_connection_string(json).as_deref(),
            Some("https://demo.supabase.co")
        );

        let encoded = BASE64_STANDARD
            .encode(json)
            .replace('+', "-")
            .replace('/', "_")
            .trim_end_matches('=')
            .to_string();
        assert_eq!(
            extract_key_from_connection_string(&encoded).as_deref(),
            Some("anon-key-123")
        );
        assert!(extract_key_from_connection_string("short").is_none());
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret("secret-value-9876"), "****9876");
    }

    #[test]
    #[serial]
    fn test_from_env_explicit_values_win() {
        clear_env();
        std::env::set_var(
            "RETAIL_SYNC_CONNECTION",
            r#"{"url":"from-conn.example.com","key":"conn-key"}"#,
        );
        std::env::set_var("RETAIL_SYNC_REMOTE_URL", "https://explicit.example.com");
        std::env::set_var("RETAIL_SYNC_STEP_TIMEOUT_SECS", "12");
        std::env::set_var("RETAIL_SYNC_HEALTH_INTERVAL_SECS", "not-a-number");

        let config = SyncConfig::from_env();
        assert_eq!(config.remote_url.as_deref(), Some("https://explicit.example.com"));
        assert_eq!(config.api_key.as_deref().map(String::as_str), Some("conn-key"));
        assert_eq!(config.step_timeout, Duration::from_secs(12));
        assert_eq!(config.health_check_interval, Duration::from_secs(15));
        assert!(config.is_configured());
        assert!(!format!("{config:?}").contains("conn-key"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_session_from_env_requires_store() {
        clear_env();
        assert!(matches!(Session::from_env(), Err(SyncError::Config(_))));

        std::env::set_var("RETAIL_SYNC_STORE_ID", "store-7");
        std::env::set_var("RETAIL_SYNC_DEVICE_ID", "till-2");
        let session = Session::from_env().expect("session");
        assert_eq!(session.store_id, "store-7");
        assert_eq!(session.user_id, "system");
        assert_eq!(session.device_id, "till-2");
        clear_env();
    }

    #[test]
    fn test_local_overrides() {
        let state = db::open_in_memory().expect("db");
        let conn = state.conn.lock().unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, "step_timeout_secs", "5").unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, "synced_retention_days", "30").unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, "health_path", "/health").unwrap();
        SyncConfig::store_remote_url(&conn, " https://stored.example.com ").unwrap();

        let mut config = SyncConfig::default();
        config.apply_local_overrides(&conn);
        assert_eq!(config.step_timeout, Duration::from_secs(5));
        assert_eq!(config.synced_retention, chrono::Duration::days(30));
        assert_eq!(config.health_path, "/health");
        assert_eq!(config.remote_url.as_deref(), Some("https://stored.example.com"));
        assert!(!config.is_configured(), "no key configured");
    }
}
