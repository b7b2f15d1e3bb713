//! Transport trait, its events and errors, and the connector seam.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;
use crate::packet::{CodecError, Packet};

/// Transport type identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// HTTP long-polling
    Polling,
    /// Full-duplex websocket
    WebSocket,
}

impl TransportKind {
    /// Name used on the wire (`transport=` query parameter, `upgrades` list)
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportKind::Polling),
            "websocket" => Ok(TransportKind::WebSocket),
            other => Err(TransportError::UnknownTransport(other.to_string())),
        }
    }
}

/// Transport lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Opening,
    Open,
    Paused,
    Closing,
}

/// Something the transport reports to its owner.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Medium established; the transport is writable.
    Opened,
    /// A decoded inbound packet.
    Packet(Packet),
    /// The last batch handed to `send` has been written.
    Drained,
    /// Requested pause completed: no request in flight, no writes pending.
    Paused,
    /// Medium gone. Emitted at most once and always last.
    Closed(String),
    /// Request or socket failure.
    Error(TransportError),
}

/// Transport error type
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport not writable")]
    NotWritable,

    #[error("transport closed")]
    Closed,

    #[error("unknown transport: {0:?}")]
    UnknownTransport(String),
}

/// A bidirectional packet medium.
///
/// Every method except [`Transport::next_event`] returns immediately;
/// outcomes are reported as [`TransportEvent`]s. `next_event` is cancel-safe
/// so it can be polled inside `tokio::select!`.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> TransportState;

    /// Whether binary packets travel raw (otherwise base64 text)
    fn supports_binary(&self) -> bool;

    /// True when open and no write is outstanding
    fn is_writable(&self) -> bool;

    /// Begin establishing the medium. Reports `Opened` or `Error` + `Closed`.
    fn open(&mut self);

    /// Hand a batch of packets to the medium. Reports `Drained` once written.
    fn send(&mut self, packets: Vec<Packet>) -> Result<(), TransportError>;

    /// Stop reading once quiescent. Reports `Paused`.
    fn pause(&mut self);

    /// Undo a pause: reads continue and the transport is writable again.
    fn resume(&mut self);

    /// Tear the medium down. Pending writes are flushed best-effort.
    fn close(&mut self);

    /// Next event, or `None` once the transport is finished.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Next event if one is already queued.
    fn try_next_event(&mut self) -> Option<TransportEvent>;
}

/// Builds transports. The engine only ever sees this seam.
pub trait TransportConnector: Send + Sync {
    /// Create an unopened transport of `kind` for the given session.
    fn connect(
        &self,
        kind: TransportKind,
        config: &TransportConfig,
        session_id: Option<&str>,
    ) -> Box<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!("polling".parse::<TransportKind>().unwrap(), TransportKind::Polling);
        assert_eq!("websocket".parse::<TransportKind>().unwrap(), TransportKind::WebSocket);
        assert!("flashsocket".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::WebSocket.to_string(), "websocket");
    }

    #[test]
    fn test_kind_serde() {
        let kinds: Vec<TransportKind> = serde_json::from_str(r#"["websocket","polling"]"#).unwrap();
        assert_eq!(kinds, vec![TransportKind::WebSocket, TransportKind::Polling]);
        assert_eq!(serde_json::to_string(&TransportKind::Polling).unwrap(), r#""polling""#);
    }
}
