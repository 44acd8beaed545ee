//! Connection configuration: persisted client config, per-call connect
//! parameters, and websocket URL resolution.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Storage key for the persisted [`PhoenixConfig`].
pub const CONFIG_STORAGE_KEY: &str = "phoenix_config";

/// Storage key for the persisted `{endpoint, params}` subset of
/// [`ConnectionParams`].
pub const PARAMS_STORAGE_KEY: &str = "phoenix_connection_params";

/// Path suffix appended to a base URL derived from the environment.
pub const SOCKET_PATH: &str = "/socket";

/// Default window for a connect attempt to report open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide client configuration.
///
/// Mutated only through the connection manager's setters, persisted as a
/// whole on every mutation, restored at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhoenixConfig {
    /// Explicit websocket URL, overriding environment derivation.
    pub url: Option<String>,
    /// Auth parameters appended to the connect query string.
    pub auth_params: Option<BTreeMap<String, Value>>,
    /// Whether to prefer the long-poll fallback transport.
    pub use_long_poll: bool,
    /// Whether the long-poll fallback is disabled entirely.
    pub disable_long_poll_fallback: bool,
}

/// Partial update applied to [`PhoenixConfig`] via `update_config`.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub url: Option<Option<String>>,
    pub auth_params: Option<Option<BTreeMap<String, Value>>>,
    pub use_long_poll: Option<bool>,
    pub disable_long_poll_fallback: Option<bool>,
}

impl PhoenixConfig {
    /// Apply a partial update, returning true if anything changed.
    pub fn apply(&mut self, update: ConfigUpdate) -> bool {
        let before = self.clone();
        if let Some(url) = update.url {
            self.url = url;
        }
        if let Some(auth) = update.auth_params {
            self.auth_params = auth;
        }
        if let Some(lp) = update.use_long_poll {
            self.use_long_poll = lp;
        }
        if let Some(disable) = update.disable_long_poll_fallback {
            self.disable_long_poll_fallback = disable;
        }
        *self != before
    }
}

/// Per-call connection parameters.
///
/// Merged with the last-used params on every connect so a reconnect can
/// partially reconfigure without restating everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Explicit endpoint, highest precedence in URL resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Query parameters sent with the connect request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, Value>>,
    /// Extra headers for transports that support them.
    #[serde(skip, default)]
    pub headers: Option<BTreeMap<String, String>>,
    /// Override for the connect timeout.
    #[serde(skip, default)]
    pub timeout: Option<Duration>,
}

impl ConnectionParams {
    /// Merge `new` over `self`: scalar fields are replaced when present,
    /// the `params` map is shallow-merged with new keys winning.
    pub fn merged_with(&self, new: &ConnectionParams) -> ConnectionParams {
        let params = match (&self.params, &new.params) {
            (Some(old), Some(fresh)) => {
                let mut merged = old.clone();
                for (k, v) in fresh {
                    merged.insert(k.clone(), v.clone());
                }
                Some(merged)
            }
            (old, fresh) => fresh.clone().or_else(|| old.clone()),
        };

        ConnectionParams {
            endpoint: new.endpoint.clone().or_else(|| self.endpoint.clone()),
            params,
            headers: new.headers.clone().or_else(|| self.headers.clone()),
            timeout: new.timeout.or(self.timeout),
        }
    }

    /// The subset persisted for session resumption.
    pub fn persistable(&self) -> ConnectionParams {
        ConnectionParams {
            endpoint: self.endpoint.clone(),
            params: self.params.clone(),
            headers: None,
            timeout: None,
        }
    }

    /// Effective connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }
}

/// Environment-provided endpoints, lowest precedence in URL resolution.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    /// Dedicated socket endpoint, used as-is when present.
    pub socket_url: Option<String>,
    /// Base HTTP(S) endpoint, converted to a websocket URL.
    pub api_url: Option<String>,
}

impl EnvConfig {
    /// Read endpoints from `REALTIME_SOCKET_URL` / `REALTIME_API_URL`.
    pub fn from_env() -> Self {
        Self {
            socket_url: std::env::var("REALTIME_SOCKET_URL").ok(),
            api_url: std::env::var("REALTIME_API_URL").ok(),
        }
    }
}

/// Resolve the websocket URL for a connect attempt.
///
/// Precedence: explicit per-call endpoint > configured URL > environment
/// socket URL > environment API base URL (scheme swapped to ws/wss, any
/// trailing `/api/vN` segment stripped, `/socket` appended).
pub fn resolve_socket_url(
    params: &ConnectionParams,
    config: &PhoenixConfig,
    env: &EnvConfig,
) -> Result<String, Error> {
    if let Some(endpoint) = &params.endpoint {
        return Ok(endpoint.clone());
    }
    if let Some(url) = &config.url {
        return Ok(url.clone());
    }
    if let Some(socket_url) = &env.socket_url {
        return Ok(socket_url.clone());
    }
    if let Some(api_url) = &env.api_url {
        return websocket_url_from_base(api_url);
    }
    Err(Error::Configuration(
        "set an endpoint, a configured URL, or REALTIME_SOCKET_URL/REALTIME_API_URL".to_string(),
    ))
}

/// Derive a websocket URL from an HTTP(S) base URL.
fn websocket_url_from_base(base: &str) -> Result<String, Error> {
    let mut parsed = url::Url::parse(base)
        .map_err(|e| Error::Configuration(format!("invalid base URL '{}': {}", base, e)))?;

    let scheme = match parsed.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Error::Configuration(format!(
                "unsupported scheme '{}' in base URL",
                other
            )));
        }
    };
    // set_scheme rejects http->ws directly, so rebuild the URL by hand.
    let path = strip_api_version(parsed.path()).to_string();
    parsed.set_path(&path);

    let rest = parsed
        .as_str()
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(parsed.as_str());
    let trimmed = rest.trim_end_matches('/');

    Ok(format!("{}://{}{}", scheme, trimmed, SOCKET_PATH))
}

/// Strip one trailing `/api/v<digits>` segment from a path.
fn strip_api_version(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if let Some(idx) = trimmed.rfind("/api/v") {
        let tail = &trimmed[idx + "/api/v".len()..];
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            return &trimmed[..idx];
        }
    }
    trimmed
}

/// Build the connect query string from merged params and configured auth
/// params. Connect params win over same-named auth params.
pub fn build_query_string(params: &ConnectionParams, config: &PhoenixConfig) -> String {
    let mut pairs: BTreeMap<String, String> = BTreeMap::new();

    if let Some(auth) = &config.auth_params {
        for (k, v) in auth {
            pairs.insert(k.clone(), value_to_query_string(v));
        }
    }
    if let Some(p) = &params.params {
        for (k, v) in p {
            pairs.insert(k.clone(), value_to_query_string(v));
        }
    }

    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn value_to_query_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
