//! Transport configuration and endpoint URL building.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::traits::{TransportError, TransportKind};

/// Protocol revision sent as `EIO=`.
pub const PROTOCOL_REVISION: &str = "3";

static CACHE_BUSTER: AtomicU64 = AtomicU64::new(0);

/// Where and how a transport reaches the server.
///
/// # Example TOML
///
/// ```toml
/// host = "chat.example.com"
/// secure = true
/// path = "/engine.io/"
/// timestamp_requests = true
///
/// [query]
/// token = "abc"
///
/// [cookies]
/// session = "42"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    /// Explicit port; scheme default when absent
    pub port: Option<u16>,
    /// https/wss instead of http/ws
    pub secure: bool,
    pub path: String,
    /// Extra query parameters appended to every request
    pub query: BTreeMap<String, String>,
    /// Sent as a single `Cookie` header
    pub cookies: BTreeMap<String, String>,
    pub extra_headers: BTreeMap<String, String>,
    /// Append a unique cache-busting parameter to every request
    pub timestamp_requests: bool,
    pub timestamp_param: String,
    /// Never send raw binary frames; binary packets travel as base64
    pub force_base64: bool,
    /// Per-request timeout for polling requests
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            secure: false,
            path: "/engine.io/".to_string(),
            query: BTreeMap::new(),
            cookies: BTreeMap::new(),
            extra_headers: BTreeMap::new(),
            timestamp_requests: false,
            timestamp_param: "t".to_string(),
            force_base64: false,
            request_timeout_ms: 60_000,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Endpoint URL for a transport kind, carrying the session id once known.
    pub fn url(&self, kind: TransportKind, session_id: Option<&str>) -> Result<Url, TransportError> {
        let scheme = match (kind, self.secure) {
            (TransportKind::Polling, false) => "http",
            (TransportKind::Polling, true) => "https",
            (TransportKind::WebSocket, false) => "ws",
            (TransportKind::WebSocket, true) => "wss",
        };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let authority = match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };

        let mut url = Url::parse(&format!("{scheme}://{authority}{}", self.path))
            .map_err(|e| TransportError::Connect(format!("invalid endpoint: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("EIO", PROTOCOL_REVISION);
            pairs.append_pair("transport", kind.name());
            if let Some(sid) = session_id {
                pairs.append_pair("sid", sid);
            }
            if self.force_base64 {
                pairs.append_pair("b64", "1");
            }
            if self.timestamp_requests {
                pairs.append_pair(&self.timestamp_param, &cache_buster());
            }
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Extra headers plus the cookie header, if any cookies are configured.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .extra_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.push(("Cookie".to_string(), cookie));
        }
        headers
    }
}

/// Unique per call within the process.
fn cache_buster() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = CACHE_BUSTER.fetch_add(1, Ordering::Relaxed);
    format!("{millis:x}-{seq}")
}
