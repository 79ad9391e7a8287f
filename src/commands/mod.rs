//! JSON command bridge for a UI host.
//!
//! Each handler takes the engine plus up to two loosely shaped JSON
//! arguments and returns `Result<serde_json::Value, String>`, so a webview
//! IPC layer can forward calls without knowing the typed API.

pub mod sync;
