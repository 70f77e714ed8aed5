//! Client configuration and endpoint construction.
//!
//! The bearer token is treated as an opaque string supplied by the caller;
//! persisting it is out of scope for this crate.

use serde::{Deserialize, Serialize};

use crate::error::WsError;

/// Path prefix every API endpoint lives under.
pub const API_PREFIX: &str = "/api";

/// Configuration for one dashboard backend.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the backend, e.g. `http://host:3000` (no trailing slash).
    pub base_url: String,
    /// Bearer token - NOT serialized to disk; the caller owns persistence.
    #[serde(skip)]
    pub token: String,
}

impl ClientConfig {
    /// Create a config, normalizing away a trailing slash on the base URL.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            token: token.into(),
        }
    }

    /// The token, or `NoLogin` if none is present. Checked before any
    /// network activity so a logged-out client never opens a socket.
    pub fn require_token(&self) -> Result<&str, WsError> {
        if self.token.is_empty() {
            return Err(WsError::NoLogin);
        }
        Ok(&self.token)
    }

    /// WebSocket URL of the shared multiplex channel.
    pub fn subscribe_url(&self) -> String {
        format!("{}{}/subscribe", http_to_ws_scheme(&self.base_url), API_PREFIX)
    }

    /// HTTP URL of the liveness probe used by the self-update flow.
    pub fn ping_url(&self) -> String {
        format!("{}{}/ping", self.base_url, API_PREFIX)
    }

    /// WebSocket URL for a container-scoped stream endpoint
    /// (`logs`, `exec`), without query string.
    pub fn container_stream_url(&self, container_id: &str, endpoint: &str) -> String {
        format!(
            "{}{}/container/{}/{}",
            http_to_ws_scheme(&self.base_url),
            API_PREFIX,
            container_id,
            endpoint
        )
    }

    /// WebSocket URL of the image pull endpoint, without query string.
    pub fn image_pull_url(&self) -> String {
        format!("{}{}/image/pull", http_to_ws_scheme(&self.base_url), API_PREFIX)
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://").replace("http://", "ws://")
    }
}
