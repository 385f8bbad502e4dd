//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.parley/config.json`) and environment.
//! Every field has a default, so a missing or empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stream::ReconnectPolicy;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend API settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Token streaming settings (socket fallback reconnect policy).
    #[serde(default)]
    pub stream: StreamConfig,

    /// Local-simulation (guest) settings.
    #[serde(default)]
    pub guest: GuestConfig,

    /// Where messages and the offline outbox are persisted.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Backend base URLs, workspace scope and auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// REST base, including the version prefix (default "http://127.0.0.1:8080/api/v1"). Overridden by PARLEY_API_BASE.
    #[serde(default = "default_api_base")]
    pub base_url: String,

    /// WebSocket base for the fallback transport (e.g. "wss://chat.example.com"). When unset it is derived from base_url's origin. Overridden by PARLEY_WS_BASE.
    #[serde(default)]
    pub ws_base: Option<String>,

    /// Workspace (tenant) id sent as X-Workspace-ID and stamped on persisted records. Overridden by PARLEY_WORKSPACE_ID.
    #[serde(default)]
    pub workspace_id: Option<String>,

    /// Bearer token for the backend. Overridden by PARLEY_AUTH_TOKEN.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Timeout for REST calls (session probe, thread creation, message post). Streams are not bounded by it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_api_base() -> String {
    "http://127.0.0.1:8080/api/v1".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base(),
            ws_base: None,
            workspace_id: None,
            auth_token: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Socket reconnect policy: at most `max_attempts` connections, waiting `base_delay_ms × attempt` (capped at `max_delay_ms`) between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    800
}

fn default_max_delay_ms() -> u64 {
    2500
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::linear(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestConfig {
    /// Delay between simulated token batches (default 18 ms).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_tick_ms() -> u64 {
    18
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Data directory. Relative paths are resolved against the config file's parent. Default: `data` next to the config file.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the API base: env PARLEY_API_BASE overrides config. Trailing slashes are dropped.
pub fn resolve_api_base(config: &Config) -> String {
    env_override("PARLEY_API_BASE")
        .unwrap_or_else(|| config.api.base_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve the explicit WebSocket base: env PARLEY_WS_BASE overrides config. None means derive from the API origin.
pub fn resolve_ws_base(config: &Config) -> Option<String> {
    env_override("PARLEY_WS_BASE")
        .or_else(|| trimmed(config.api.ws_base.as_ref()))
        .map(|s| s.trim_end_matches('/').to_string())
}

/// Resolve the workspace id: env PARLEY_WORKSPACE_ID overrides config.
pub fn resolve_workspace_id(config: &Config) -> Option<String> {
    env_override("PARLEY_WORKSPACE_ID").or_else(|| trimmed(config.api.workspace_id.as_ref()))
}

/// Resolve the bearer token: env PARLEY_AUTH_TOKEN overrides config.
pub fn resolve_auth_token(config: &Config) -> Option<String> {
    env_override("PARLEY_AUTH_TOKEN").or_else(|| trimmed(config.api.auth_token.as_ref()))
}

/// Derive the WebSocket origin from an HTTP base: http→ws, https→wss, same host and port, path dropped.
pub fn derive_ws_base(api_base: &str) -> Option<String> {
    let (scheme, rest) = api_base.split_once("://")?;
    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "https" => "wss",
        "http" => "ws",
        _ => return None,
    };
    let host = rest.split('/').next().filter(|h| !h.is_empty())?;
    Some(format!("{}://{}", ws_scheme, host))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PARLEY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".parley").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Default data directory: `data` subdirectory of the config file's parent.
pub fn data_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("data")
}

/// Resolve the data directory: `storage.directory` if set (relative paths resolved against the config file's parent), otherwise the default.
pub fn resolve_data_dir(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.storage.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => data_dir(config_path),
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used (for resolving the data directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        if s.trim().is_empty() {
            Config::default()
        } else {
            serde_json::from_str(&s)
                .with_context(|| format!("parsing config from {}", path.display()))?
        }
    };
    Ok((config, path))
}
