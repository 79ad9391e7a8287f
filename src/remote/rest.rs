//! PostgREST-style HTTP client for the hosted data backend.
//!
//! Rows live under `{base}/rest/v1/{table}`; filters are query parameters of
//! the form `column=op.value`. Writes ask for `return=representation` so the
//! server-assigned row comes back in the response body.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{ChangeEvent, ChangeKind, Filter, RemoteError, RemoteStore};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const REST_PREFIX: &str = "/rest/v1";
const CHANGE_FEED_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with(REST_PREFIX) {
        url.truncate(url.len() - REST_PREFIX.len());
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// PostgREST filter pairs: `column=op.value`.
fn filter_pairs(filters: &[Filter]) -> impl Iterator<Item = (&str, String)> + '_ {
    filters
        .iter()
        .map(|f| (f.column.as_str(), format!("{}.{}", f.op.as_str(), f.value)))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout(DEFAULT_TIMEOUT.as_secs());
    }
    if err.is_connect() {
        return RemoteError::Offline;
    }
    if err.is_builder() {
        return RemoteError::Transport(format!("invalid backend URL: {url}"));
    }
    RemoteError::Transport(format!("error communicating with {url}: {err}"))
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Not authorized for this table".to_string(),
        404 => "Backend endpoint not found".to_string(),
        409 => "Conflicting row already exists".to_string(),
        s if s >= 500 => "Backend server error".to_string(),
        _ => "Unexpected response from backend".to_string(),
    }
}

/// Build the error for a non-success response, keeping the backend's own
/// message and details when the body is JSON.
fn http_error(status: StatusCode, body_text: &str) -> RemoteError {
    let message = match serde_json::from_str::<Value>(body_text) {
        Ok(json) => {
            let message = json
                .get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status_message(status));
            match json.get("details").or_else(|| json.get("hint")) {
                Some(Value::String(details)) if !details.is_empty() => {
                    format!("{message}: {details}")
                }
                _ => message,
            }
        }
        Err(_) if !body_text.trim().is_empty() => {
            format!("{}: {}", status_message(status), body_text.trim())
        }
        Err(_) => status_message(status),
    };
    RemoteError::Http {
        status: status.as_u16(),
        message,
    }
}

fn into_rows(value: Value) -> Result<Vec<Value>, RemoteError> {
    match value {
        Value::Array(rows) => Ok(rows),
        Value::Null => Ok(Vec::new()),
        Value::Object(_) => Ok(vec![value]),
        other => Err(RemoteError::InvalidResponse(format!(
            "expected rows, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RestRemote {
    client: Client,
    base_url: String,
    rest_root: Url,
    api_key: Zeroizing<String>,
    health_path: String,
    poll_interval: Duration,
}

impl std::fmt::Debug for RestRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestRemote")
            .field("base_url", &self.base_url)
            .field("health_path", &self.health_path)
            .finish_non_exhaustive()
    }
}

impl RestRemote {
    pub fn new(
        base_url: &str,
        api_key: Zeroizing<String>,
        health_path: &str,
        poll_interval: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to create HTTP client: {e}")))?;
        let base_url = normalize_base_url(base_url);
        let rest_root = Url::parse(&format!("{base_url}{REST_PREFIX}"))
            .map_err(|e| RemoteError::Transport(format!("invalid remote URL {base_url}: {e}")))?;
        if rest_root.cannot_be_a_base() {
            return Err(RemoteError::Transport(format!("invalid remote URL {base_url}")));
        }
        Ok(Self {
            client,
            base_url,
            rest_root,
            api_key,
            health_path: health_path.to_string(),
            poll_interval,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str, filters: &[Filter], select: bool) -> Url {
        let mut url = self.rest_root.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(table);
        }
        if select || !filters.is_empty() {
            let mut qp = url.query_pairs_mut();
            if select {
                qp.append_pair("select", "*");
            }
            for (column, value) in filter_pairs(filters) {
                qp.append_pair(column, &value);
            }
        }
        url
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<Value, RemoteError> {
        let mut req = self
            .client
            .request(method, url)
            .header("apikey", self.api_key.as_str())
            .header("Authorization", format!("Bearer {}", self.api_key.as_str()))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation");

        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(http_error(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| RemoteError::InvalidResponse(format!("invalid JSON: {e}")))
    }
}

#[async_trait]
impl RemoteStore for RestRemote {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, RemoteError> {
        let url = self.table_url(table, &[], false);
        let rows = into_rows(self.send(Method::POST, url, Some(row)).await?)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse(format!("insert into {table} returned no row")))
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        changes: Value,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table, filters, false);
        into_rows(self.send(Method::PATCH, url, Some(changes)).await?)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table, filters, false);
        into_rows(self.send(Method::DELETE, url, None).await?)
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table, filters, true);
        into_rows(self.send(Method::GET, url, None).await?)
    }

    /// Change feed backed by an `updated_at` cursor poll. Inserts and updates
    /// both surface as [`ChangeKind::Update`]; deletes are not observable
    /// this way.
    fn subscribe(
        &self,
        table: &str,
        filters: Vec<Filter>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(CHANGE_FEED_BUFFER);
        let remote = self.clone();
        let table = table.to_string();

        tokio::spawn(async move {
            let mut cursor = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            info!(table = %table, "Change feed started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(remote.poll_interval) => {}
                }

                let mut query = filters.clone();
                query.push(Filter::gt("updated_at", cursor.clone()));
                let rows = match remote.select(&table, &query).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        debug!(table = %table, error = %e, "Change feed poll failed");
                        continue;
                    }
                };

                for row in rows {
                    if let Some(ts) = row.get("updated_at").and_then(Value::as_str) {
                        if ts > cursor.as_str() {
                            cursor = ts.to_string();
                        }
                    }
                    let event = ChangeEvent {
                        table: table.clone(),
                        kind: ChangeKind::Update,
                        row,
                    };
                    if tx.send(event).await.is_err() {
                        info!(table = %table, "Change feed receiver dropped");
                        return;
                    }
                }
            }
            info!(table = %table, "Change feed stopped");
        });

        rx
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        let url = format!("{}{}", self.base_url, self.health_path);
        let resp = self
            .client
            .get(&url)
            .header("apikey", self.api_key.as_str())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            warn!(status = status.as_u16(), "Backend health check failed");
            Err(RemoteError::Http {
                status: status.as_u16(),
                message: status_message(status),
            })
        }
    }
}
