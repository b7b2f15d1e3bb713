//! Handshake carried by the first OPEN packet of a session.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wirelink_transport::TransportKind;

use crate::errors::ChannelError;

/// Session identity and heartbeat timing, fixed for the session's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

impl Handshake {
    /// Parse the OPEN packet's JSON text. Duplicate upgrade names are dropped.
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let mut handshake: Handshake = serde_json::from_str(text)
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;
        if handshake.sid.is_empty() {
            return Err(ChannelError::Handshake("empty session id".to_string()));
        }

        let mut seen = Vec::with_capacity(handshake.upgrades.len());
        handshake.upgrades.retain(|name| {
            if seen.contains(name) {
                false
            } else {
                seen.push(name.clone());
                true
            }
        });
        Ok(handshake)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout)
    }

    /// Silence allowed before the connection is considered dead.
    pub fn heartbeat_window(&self) -> Duration {
        self.ping_interval() + self.ping_timeout()
    }

    /// Upgrades the server offers that this side knows, in server order.
    pub fn known_upgrades(&self) -> Vec<TransportKind> {
        self.upgrades
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect()
    }
}
