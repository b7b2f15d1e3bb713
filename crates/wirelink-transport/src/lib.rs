//! Packet framing and transports for the wirelink channel.
//!
//! This crate provides the wire codecs (single packets and multiplexed
//! payloads) and the two transports a channel can ride on: HTTP long-polling
//! and a full-duplex websocket. Transports are driven through the
//! [`Transport`] trait so the channel engine never depends on a concrete
//! medium.

pub mod packet;
pub mod payload;
pub mod traits;
pub mod lifecycle;
pub mod config;
pub mod polling;
pub mod websocket;
pub mod connector;
pub mod testing;

pub use packet::*;
pub use payload::*;
pub use traits::*;
pub use lifecycle::*;
pub use config::*;
pub use polling::*;
pub use websocket::*;
pub use connector::*;
