//! In-memory transports for exercising the channel engine.
//!
//! [`MockConnector`] hands out [`MockTransport`]s and, for each one, a
//! [`MockPeer`] through [`MockPeers`]. The peer plays the server: it decides
//! when the transport opens, what arrives on it, when writes drain, and it
//! sees everything the engine sends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::lifecycle::{EventSink, Lifecycle};
use crate::packet::{decode_packet, Frame, Packet, PacketKind};
use crate::payload::{decode_payload_packets, encode_payload};
use crate::traits::{
    Transport, TransportConnector, TransportError, TransportEvent, TransportKind, TransportState,
};

/// What the engine did to a mock transport, as seen by its peer.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerSignal {
    Packets(Vec<Packet>),
    Pause,
    Resume,
    Close,
}

#[derive(Default)]
struct ConnectorState {
    refused: HashSet<TransportKind>,
    connects: Vec<(TransportKind, Option<String>)>,
}

/// Connector producing in-memory transports.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

/// Receives the peer side of every transport the connector creates.
pub struct MockPeers {
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockConnector {
    pub fn new() -> (Self, MockPeers) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(Mutex::new(ConnectorState::default())),
            peers: tx,
        };
        (connector, MockPeers { peers: rx })
    }

    /// Transports of `kind` fail to open from now on.
    pub fn refuse(&self, kind: TransportKind) {
        self.state.lock().refused.insert(kind);
    }

    /// Every `connect` call so far, with the session id it carried.
    pub fn connects(&self) -> Vec<(TransportKind, Option<String>)> {
        self.state.lock().connects.clone()
    }
}

impl TransportConnector for MockConnector {
    fn connect(
        &self,
        kind: TransportKind,
        config: &TransportConfig,
        session_id: Option<&str>,
    ) -> Box<dyn Transport> {
        let refused = {
            let mut state = self.state.lock();
            state.connects.push((kind, session_id.map(str::to_owned)));
            state.refused.contains(&kind)
        };
        let (transport, peer) = MockTransport::pair(kind, !config.force_base64, refused);
        let _ = self.peers.send(peer);
        Box::new(transport)
    }
}

impl MockPeers {
    /// Peer of the next transport created.
    pub async fn next(&mut self) -> Option<MockPeer> {
        self.peers.recv().await
    }

    /// Peer of a transport already created, if any.
    pub fn try_next(&mut self) -> Option<MockPeer> {
        self.peers.try_recv().ok()
    }
}

/// In-memory transport.
pub struct MockTransport {
    kind: TransportKind,
    supports_binary: bool,
    refused: bool,
    lifecycle: Lifecycle,
    sink: EventSink,
    signals: mpsc::UnboundedSender<PeerSignal>,
    auto_drain: Arc<AtomicBool>,
    last_frame: Arc<Mutex<Option<Frame>>>,
    pause_requested: bool,
    pause_pending: bool,
}

impl MockTransport {
    /// A transport and the peer that scripts it.
    pub fn pair(kind: TransportKind, supports_binary: bool, refused: bool) -> (Self, MockPeer) {
        let (lifecycle, sink) = Lifecycle::new();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let auto_drain = Arc::new(AtomicBool::new(true));
        let last_frame = Arc::new(Mutex::new(None));
        let peer = MockPeer {
            kind,
            sink: sink.clone(),
            signals: signal_rx,
            auto_drain: auto_drain.clone(),
            last_frame: last_frame.clone(),
        };
        let transport = Self {
            kind,
            supports_binary,
            refused,
            lifecycle,
            sink,
            signals: signal_tx,
            auto_drain,
            last_frame,
            pause_requested: false,
            pause_pending: false,
        };
        (transport, peer)
    }

    fn after_event(&mut self, event: &Option<TransportEvent>) {
        if matches!(event, Some(TransportEvent::Drained)) && self.pause_pending {
            self.pause_pending = false;
            let _ = self.sink.send(TransportEvent::Paused);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    fn is_writable(&self) -> bool {
        self.lifecycle.is_writable()
    }

    fn open(&mut self) {
        if self.lifecycle.state() != TransportState::Closed {
            return;
        }
        self.lifecycle.transition(TransportState::Opening);
        if self.refused {
            let error = TransportError::Connect(format!("{} refused", self.kind));
            let _ = self.sink.send(TransportEvent::Error(error));
            let _ = self.sink.send(TransportEvent::Closed("transport error".to_string()));
        }
    }

    fn send(&mut self, packets: Vec<Packet>) -> Result<(), TransportError> {
        if !self.lifecycle.is_writable() {
            return Err(TransportError::NotWritable);
        }
        if packets.is_empty() {
            return Ok(());
        }
        // through the real codec, as a network transport would
        let frame = encode_payload(&packets, self.supports_binary)?;
        let packets = decode_payload_packets(&frame)?;
        *self.last_frame.lock() = Some(frame);

        self.signals
            .send(PeerSignal::Packets(packets))
            .map_err(|_| TransportError::Closed)?;
        self.lifecycle.mark_sending();
        if self.auto_drain.load(Ordering::SeqCst) {
            let _ = self.sink.send(TransportEvent::Drained);
        }
        Ok(())
    }

    fn pause(&mut self) {
        if self.pause_requested {
            return;
        }
        self.pause_requested = true;
        let _ = self.signals.send(PeerSignal::Pause);
        if self.lifecycle.is_writable() {
            let _ = self.sink.send(TransportEvent::Paused);
        } else {
            self.pause_pending = true;
        }
    }

    fn resume(&mut self) {
        self.lifecycle.resume();
        if !self.pause_requested {
            return;
        }
        self.pause_requested = false;
        self.pause_pending = false;
        let _ = self.signals.send(PeerSignal::Resume);
    }

    fn close(&mut self) {
        if matches!(
            self.lifecycle.state(),
            TransportState::Closed | TransportState::Closing
        ) {
            return;
        }
        self.lifecycle.transition(TransportState::Closing);
        let _ = self.signals.send(PeerSignal::Close);
        let _ = self.sink.send(TransportEvent::Closed("forced close".to_string()));
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        let event = self.lifecycle.next().await;
        self.after_event(&event);
        event
    }

    fn try_next_event(&mut self) -> Option<TransportEvent> {
        let event = self.lifecycle.try_next();
        self.after_event(&event);
        event
    }
}

/// Server side of a [`MockTransport`].
pub struct MockPeer {
    kind: TransportKind,
    sink: EventSink,
    signals: mpsc::UnboundedReceiver<PeerSignal>,
    auto_drain: Arc<AtomicBool>,
    last_frame: Arc<Mutex<Option<Frame>>>,
}

impl MockPeer {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Complete the transport's open.
    pub fn accept(&self) {
        let _ = self.sink.send(TransportEvent::Opened);
    }

    /// Accept and send the OPEN packet carrying the handshake.
    pub fn handshake(&self, sid: &str, upgrades: &[&str], ping_interval_ms: u64, ping_timeout_ms: u64) {
        self.accept();
        let body = serde_json::json!({
            "sid": sid,
            "upgrades": upgrades,
            "pingInterval": ping_interval_ms,
            "pingTimeout": ping_timeout_ms,
        });
        self.deliver(Packet::new(PacketKind::Open, Some(body.to_string().into())));
    }

    pub fn deliver(&self, packet: Packet) {
        let _ = self.sink.send(TransportEvent::Packet(packet));
    }

    /// Deliver a raw text frame through the packet decoder.
    pub fn deliver_raw(&self, text: &str) {
        self.deliver(decode_packet(&Frame::Text(text.to_string())));
    }

    pub fn fail(&self, error: TransportError) {
        let _ = self.sink.send(TransportEvent::Error(error));
    }

    /// The medium went away from the server side.
    pub fn close_remote(&self) {
        let _ = self.sink.send(TransportEvent::Closed("transport close".to_string()));
    }

    /// Report the outstanding write as written.
    pub fn drain(&self) {
        let _ = self.sink.send(TransportEvent::Drained);
    }

    /// Whether writes drain immediately (the default).
    pub fn set_auto_drain(&self, enabled: bool) {
        self.auto_drain.store(enabled, Ordering::SeqCst);
    }

    /// Payload frame of the most recent write, as it would cross the wire.
    pub fn last_frame(&self) -> Option<Frame> {
        self.last_frame.lock().clone()
    }

    pub async fn next_signal(&mut self) -> Option<PeerSignal> {
        self.signals.recv().await
    }

    pub fn try_signal(&mut self) -> Option<PeerSignal> {
        self.signals.try_recv().ok()
    }

    /// Next batch of packets written, skipping other signals.
    pub async fn next_sent(&mut self) -> Option<Vec<Packet>> {
        loop {
            if let PeerSignal::Packets(packets) = self.signals.recv().await? {
                return Some(packets);
            }
        }
    }

    /// Every packet written and not yet observed, in order.
    pub fn sent_packets(&mut self) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Ok(signal) = self.signals.try_recv() {
            if let PeerSignal::Packets(packets) = signal {
                out.extend(packets);
            }
        }
        out
    }
}
