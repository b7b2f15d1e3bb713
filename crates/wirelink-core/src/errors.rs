//! Error types and close reasons for the channel engine.
//!
//! Only [`OpenError`] is ever returned. Once the engine task runs, every
//! failure is reported as a `ChannelEvent`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use wirelink_transport::TransportError;

use crate::config::ConfigError;

/// Failures fatal to the channel.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    /// Malformed packet or payload from the peer
    #[error("decode error: {0}")]
    Decode(String),

    /// I/O failure on the active transport
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No PONG within ping interval + ping timeout
    #[error("no heartbeat within {0:?}")]
    HeartbeatTimeout(Duration),

    /// OPEN packet without a usable handshake
    #[error("invalid handshake: {0}")]
    Handshake(String),

    /// The channel closed before the operation completed
    #[error("channel closed")]
    Closed,
}

/// Why a channel could not be started.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine task needs a tokio runtime to run on
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Failures of an upgrade probe. Never fatal to the channel.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe transport failed: {0}")]
    Transport(TransportError),

    #[error("probe transport closed: {0}")]
    TransportClosed(String),

    #[error("unexpected probe response: {0}")]
    UnexpectedResponse(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel closed during probe")]
    ChannelClosed,
}

/// Why a channel reached CLOSED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Caller closed the channel
    Forced,
    /// The medium went away
    TransportClose,
    /// The active transport failed
    TransportError,
    /// Heartbeat window elapsed without a PONG
    PingTimeout,
    /// The peer sent something undecodable
    ParseError,
    /// The peer sent CLOSE
    ServerClose,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Forced => "forced close",
            CloseReason::TransportClose => "transport close",
            CloseReason::TransportError => "transport error",
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::ParseError => "parse error",
            CloseReason::ServerClose => "server close",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
