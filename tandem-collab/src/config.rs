//! Client configuration.

use std::time::Duration;

use crate::presence::{DEFAULT_IDLE_TIMEOUT, DEFAULT_PRESENCE_INTERVAL};
use crate::session::{BackoffConfig, DEFAULT_MAX_PENDING};

/// Settings for one [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub relay_url: String,
    pub doc_id: String,
    /// Opaque credential passed through to the relay
    pub auth_token: String,
    /// Name shown next to our cursor
    pub display_name: String,
    pub backoff: BackoffConfig,
    /// Give up on an opening handshake after this long
    pub connect_timeout: Duration,
    /// Send PING this often while connected
    pub keepalive_interval: Duration,
    /// Drop the connection after this long without inbound traffic
    pub keepalive_timeout: Duration,
    /// Minimum gap between presence broadcasts
    pub presence_interval: Duration,
    pub idle_timeout: Duration,
    /// Save the op-log this often; `None` disables periodic saves
    pub snapshot_interval: Option<Duration>,
    /// Cap on ops queued while not synced
    pub max_pending: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090".to_string(),
            doc_id: "default".to_string(),
            auth_token: String::new(),
            display_name: "Anonymous".to_string(),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(45),
            presence_interval: DEFAULT_PRESENCE_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            snapshot_interval: Some(Duration::from_secs(30)),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            doc_id: doc_id.into(),
            ..Self::default()
        }
    }

    /// Short timers, for tests.
    pub fn for_testing(relay_url: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            backoff: BackoffConfig::for_testing(),
            connect_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_millis(200),
            keepalive_timeout: Duration::from_secs(2),
            presence_interval: Duration::from_millis(10),
            snapshot_interval: None,
            max_pending: 1_000,
            ..Self::new(relay_url, doc_id)
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Full WebSocket URL for this document.
    pub fn url(&self) -> String {
        format!("{}/{}", self.relay_url.trim_end_matches('/'), self.doc_id)
    }
}
