//! Ready state and connection statistics shared between the engine task and
//! the [`Channel`](crate::Channel) handle.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wirelink_transport::{Packet, TransportKind};

use crate::handshake::Handshake;

/// Channel ready state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Written by the engine task only; read from anywhere.
pub struct ConnectionTracker {
    state: Mutex<ReadyState>,
    opened_at: Mutex<Option<Instant>>,
    handshake: Mutex<Option<Handshake>>,
    transport: Mutex<Option<TransportKind>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    upgrades: AtomicU32,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReadyState::Opening),
            opened_at: Mutex::new(None),
            handshake: Mutex::new(None),
            transport: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            upgrades: AtomicU32::new(0),
        }
    }

    /// Transition to new state, returning the old one
    pub fn transition(&self, new_state: ReadyState) -> ReadyState {
        let mut state = self.state.lock();
        let old_state = *state;

        match new_state {
            ReadyState::Open => {
                *self.opened_at.lock() = Some(Instant::now());
            }
            ReadyState::Closed => {
                *self.opened_at.lock() = None;
                // a handshake never outlives its connection
                *self.handshake.lock() = None;
            }
            _ => {}
        }

        *state = new_state;
        old_state
    }

    pub fn state(&self) -> ReadyState {
        *self.state.lock()
    }

    /// Time since the channel reached OPEN
    pub fn duration(&self) -> Option<Duration> {
        self.opened_at.lock().map(|t| t.elapsed())
    }

    pub fn set_handshake(&self, handshake: Handshake) {
        *self.handshake.lock() = Some(handshake);
    }

    pub fn handshake(&self) -> Option<Handshake> {
        self.handshake.lock().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.handshake.lock().as_ref().map(|h| h.sid.clone())
    }

    pub fn set_transport(&self, kind: TransportKind) {
        *self.transport.lock() = Some(kind);
    }

    pub fn transport(&self) -> Option<TransportKind> {
        *self.transport.lock()
    }

    pub fn record_sent(&self, packets: &[Packet]) {
        let bytes: usize = packets.iter().filter_map(|p| p.data.as_ref()).map(|d| d.len()).sum();
        self.packets_sent.fetch_add(packets.len() as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, packet: &Packet) {
        let bytes = packet.data.as_ref().map_or(0, |d| d.len());
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_upgrade(&self) {
        self.upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            state: self.state(),
            transport: self.transport(),
            duration: self.duration(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel statistics
#[derive(Clone, Debug)]
pub struct ChannelStats {
    pub state: ReadyState,
    pub transport: Option<TransportKind>,
    pub duration: Option<Duration>,
    /// Payload bytes handed to transports
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub upgrades: u32,
}
