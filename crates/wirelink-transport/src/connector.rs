//! Connector building the network transports.

use reqwest::Client;

use crate::config::TransportConfig;
use crate::polling::PollingTransport;
use crate::traits::{Transport, TransportConnector, TransportKind};
use crate::websocket::WebSocketTransport;

/// Builds real polling and websocket transports. Polling transports share
/// one HTTP client and its connection pool.
#[derive(Clone, Default)]
pub struct NetworkConnector {
    client: Client,
}

impl NetworkConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured HTTP client (proxies, root certificates).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl TransportConnector for NetworkConnector {
    fn connect(
        &self,
        kind: TransportKind,
        config: &TransportConfig,
        session_id: Option<&str>,
    ) -> Box<dyn Transport> {
        let session_id = session_id.map(str::to_owned);
        match kind {
            TransportKind::Polling => Box::new(PollingTransport::new(
                self.client.clone(),
                config.clone(),
                session_id,
            )),
            TransportKind::WebSocket => {
                Box::new(WebSocketTransport::new(config.clone(), session_id))
            }
        }
    }
}
