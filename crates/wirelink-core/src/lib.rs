//! Channel engine for wirelink.
//!
//! A channel opens on one transport, reads the handshake, keeps the
//! connection alive with PING/PONG heartbeats, buffers outgoing packets
//! while the transport is busy, and upgrades from long-polling to websocket
//! when the server offers it. All of it runs in one task per channel;
//! callers hold a [`Channel`] handle and read [`ChannelEvents`].

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod errors;
pub mod handshake;
pub mod state;
pub mod transport;

pub use config::*;
pub use engine::*;
pub use errors::*;
pub use handshake::*;
pub use state::*;
pub use transport::*;
