//! Channel engine.
//!
//! A [`Channel`] is a handle to one engine task. The task owns all mutable
//! channel state (active transport, outgoing buffer, timers, upgrade probe)
//! and runs a single `select!` loop over caller commands, transport events
//! and timer deadlines. Transport I/O happens in the transports' own tasks,
//! so nothing the engine does blocks on the network.
//!
//! # Upgrade
//!
//! After the handshake on polling, a websocket candidate is opened next to
//! the active transport and sent `PING "probe"`. Until its `PONG "probe"`
//! arrives the active transport keeps flushing normally. On the PONG the
//! engine raises `upgrading`, pauses the polling transport, and once paused
//! (or after the pause timeout) swaps the candidate in, sends `UPGRADE` on it
//! ahead of anything buffered, and resumes flushing.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use wirelink_transport::{
    Packet, PacketData, PacketKind, Transport, TransportConnector, TransportEvent, TransportKind,
};

use crate::config::{ChannelConfig, ConfigError};
use crate::errors::{ChannelError, CloseReason, OpenError, ProbeError};
use crate::handshake::Handshake;
use crate::state::{ChannelStats, ConnectionTracker, ReadyState};
use crate::transport::TransportPreferences;

const PROBE: &str = "probe";

/// Everything a channel reports, in the order it happened.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// Handshake received; the channel is OPEN.
    Opened(Handshake),
    /// Application data from a MESSAGE packet.
    Message(PacketData),
    /// Any packet received, before it is acted upon.
    Packet(Packet),
    /// A batch of this many packets was written by the transport.
    Flushed(usize),
    /// Probe answered; the active transport is being paused.
    Upgrading(TransportKind),
    /// The candidate is now the active transport.
    Upgraded(TransportKind),
    /// The probe was abandoned; the original transport stays active.
    UpgradeFailed(ProbeError),
    Error(ChannelError),
    /// Always the last event.
    Closed(CloseReason),
}

type Callback = Box<dyn FnOnce(Result<(), ChannelError>) + Send>;

/// Runs its callback exactly once: on `complete`, or with `Closed` on drop.
struct Completion(Option<Callback>);

impl Completion {
    fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<(), ChannelError>) + Send + 'static,
    {
        Self(Some(Box::new(callback)))
    }

    fn complete(mut self, result: Result<(), ChannelError>) {
        if let Some(callback) = self.0.take() {
            callback(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback(Err(ChannelError::Closed));
        }
    }
}

enum Command {
    Send(Packet, Completion),
    Close(oneshot::Sender<()>),
}

/// Resolves once the transport reports the packet written, or with an error
/// if the channel closes first.
pub struct Delivery {
    rx: oneshot::Receiver<Result<(), ChannelError>>,
}

impl Future for Delivery {
    type Output = Result<(), ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ChannelError::Closed)))
    }
}

/// Receiving side of a channel's events. Ends after `Closed`.
pub struct ChannelEvents {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelEvents {
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }
}

/// Handle to a running channel. Cheap to clone; dropping every handle
/// closes the channel.
#[derive(Clone)]
pub struct Channel {
    commands: mpsc::UnboundedSender<Command>,
    tracker: Arc<ConnectionTracker>,
}

impl Channel {
    /// Start a channel on the current tokio runtime.
    pub fn open(
        config: ChannelConfig,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<(Self, ChannelEvents), OpenError> {
        Self::open_with_hint(config, connector, false)
    }

    /// Start a channel, telling it whether a previous channel with this
    /// configuration upgraded successfully.
    pub fn open_with_hint(
        config: ChannelConfig,
        connector: Arc<dyn TransportConnector>,
        prior_upgrade_succeeded: bool,
    ) -> Result<(Self, ChannelEvents), OpenError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| OpenError::NoRuntime)?;
        config.validate()?;
        let prefs = config.preferences()?;
        let kind = prefs
            .initial_transport(prior_upgrade_succeeded)
            .ok_or_else(|| ConfigError::ValidationError("no transport allowed".to_string()))?;

        let tracker = Arc::new(ConnectionTracker::new());
        tracker.set_transport(kind);
        let transport = connector.connect(kind, &config.transport, None);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let engine = Engine {
            config,
            prefs,
            connector,
            tracker: tracker.clone(),
            events: event_tx,
            state: ReadyState::Opening,
            transport,
            handshake: None,
            buffer: VecDeque::new(),
            in_flight: Vec::new(),
            in_flight_packets: 0,
            upgrading: false,
            probe: None,
            ping_at: None,
            heartbeat_deadline: None,
        };
        runtime.spawn(engine.run(command_rx));

        let channel = Self {
            commands: command_tx,
            tracker,
        };
        Ok((channel, ChannelEvents { events: event_rx }))
    }

    /// Queue a MESSAGE packet.
    pub fn send(&self, data: impl Into<PacketData>) -> Delivery {
        let (tx, rx) = oneshot::channel();
        self.send_with(data, move |result| {
            let _ = tx.send(result);
        });
        Delivery { rx }
    }

    /// Queue a MESSAGE packet; `on_complete` runs exactly once with the outcome.
    pub fn send_with<F>(&self, data: impl Into<PacketData>, on_complete: F)
    where
        F: FnOnce(Result<(), ChannelError>) + Send + 'static,
    {
        let command = Command::Send(Packet::message(data), Completion::new(on_complete));
        // a finished engine hands the command back; dropping it fails the completion
        let _ = self.commands.send(command);
    }

    /// Close the channel. Returns once it is CLOSED with timers and any
    /// probe torn down. Closing a closed channel does nothing.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.tracker.state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.tracker.session_id()
    }

    pub fn handshake(&self) -> Option<Handshake> {
        self.tracker.handshake()
    }

    /// Kind of the active transport
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.tracker.transport()
    }

    pub fn stats(&self) -> ChannelStats {
        self.tracker.stats()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProbePhase {
    Opening,
    AwaitingPong,
    Pausing,
}

/// Candidate transport under test.
struct Probe {
    transport: Box<dyn Transport>,
    kind: TransportKind,
    phase: ProbePhase,
    /// Probe timeout until the PONG, pause timeout afterwards
    deadline: Instant,
    /// Candidate events that arrived while the active transport was pausing
    held: Vec<TransportEvent>,
}

struct Engine {
    config: ChannelConfig,
    prefs: TransportPreferences,
    connector: Arc<dyn TransportConnector>,
    tracker: Arc<ConnectionTracker>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: ReadyState,
    transport: Box<dyn Transport>,
    handshake: Option<Handshake>,
    buffer: VecDeque<(Packet, Option<Completion>)>,
    in_flight: Vec<Completion>,
    in_flight_packets: usize,
    upgrading: bool,
    probe: Option<Probe>,
    ping_at: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_probe_event(probe: &mut Option<Probe>) -> Option<TransportEvent> {
    match probe {
        Some(probe) => probe.transport.next_event().await,
        None => std::future::pending().await,
    }
}

fn describe(packet: &Packet) -> String {
    match packet.text() {
        Some(text) => format!("{} {:?}", packet.kind, text),
        None => packet.kind.to_string(),
    }
}

impl Engine {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::info!(transport = %self.transport.kind(), "opening channel");
        self.transport.open();

        while self.state != ReadyState::Closed {
            let ping_at = self.ping_at;
            let heartbeat_deadline = self.heartbeat_deadline;
            let probe_deadline = self.probe.as_ref().map(|p| p.deadline);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(packet, completion)) => self.enqueue(packet, Some(completion)),
                    Some(Command::Close(ack)) => {
                        self.close(CloseReason::Forced);
                        let _ = ack.send(());
                    }
                    None => self.close(CloseReason::Forced),
                },
                event = self.transport.next_event() => self.on_transport_event(event),
                event = next_probe_event(&mut self.probe) => self.on_probe_event(event),
                _ = sleep_until_opt(ping_at) => self.on_ping_timer(),
                _ = sleep_until_opt(heartbeat_deadline) => self.on_heartbeat_timeout(),
                _ = sleep_until_opt(probe_deadline) => self.on_probe_deadline(),
            }
        }

        // commands that raced the close
        while let Ok(command) = commands.try_recv() {
            if let Command::Close(ack) = command {
                let _ = ack.send(());
            }
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ReadyState) {
        self.state = state;
        self.tracker.transition(state);
    }

    fn enqueue(&mut self, packet: Packet, completion: Option<Completion>) {
        if self.state == ReadyState::Closed {
            return;
        }
        self.buffer.push_back((packet, completion));
        self.flush();
    }

    /// Hand the whole buffer to the active transport if it can take it.
    fn flush(&mut self) {
        if self.state == ReadyState::Closed
            || self.upgrading
            || self.buffer.is_empty()
            || !self.transport.is_writable()
        {
            return;
        }

        let (packets, completions): (Vec<Packet>, Vec<Option<Completion>>) =
            self.buffer.drain(..).unzip();
        let count = packets.len();
        tracing::debug!(count, transport = %self.transport.kind(), "flushing");
        self.tracker.record_sent(&packets);

        match self.transport.send(packets) {
            Ok(()) => {
                self.in_flight.extend(completions.into_iter().flatten());
                self.in_flight_packets = count;
            }
            Err(e) => {
                tracing::warn!("transport rejected write: {e}");
                for completion in completions.into_iter().flatten() {
                    completion.complete(Err(ChannelError::Transport(e.clone())));
                }
                self.emit(ChannelEvent::Error(ChannelError::Transport(e)));
                self.close(CloseReason::TransportError);
            }
        }
    }

    fn on_drain(&mut self) {
        let count = std::mem::take(&mut self.in_flight_packets);
        for completion in std::mem::take(&mut self.in_flight) {
            completion.complete(Ok(()));
        }
        if count > 0 {
            self.emit(ChannelEvent::Flushed(count));
        }
        self.flush();
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => {
                tracing::debug!(transport = %self.transport.kind(), "transport open");
                self.flush();
            }
            Some(TransportEvent::Packet(packet)) => self.on_packet(packet),
            Some(TransportEvent::Drained) => self.on_drain(),
            Some(TransportEvent::Paused) => {
                if self
                    .probe
                    .as_ref()
                    .is_some_and(|p| p.phase == ProbePhase::Pausing)
                {
                    self.swap();
                } else {
                    // pause completed after its upgrade was abandoned
                    self.transport.resume();
                    self.flush();
                }
            }
            Some(TransportEvent::Error(e)) => {
                tracing::warn!(transport = %self.transport.kind(), "transport error: {e}");
                self.emit(ChannelEvent::Error(ChannelError::Transport(e)));
                self.close(CloseReason::TransportError);
            }
            Some(TransportEvent::Closed(reason)) => {
                tracing::debug!(%reason, "transport closed");
                self.close(CloseReason::TransportClose);
            }
            None => self.close(CloseReason::TransportClose),
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        if self.state == ReadyState::Closed {
            return;
        }
        tracing::debug!(kind = %packet.kind, "packet received");

        if packet.is_error() {
            let diagnostic = packet.text().unwrap_or_default().to_string();
            self.emit(ChannelEvent::Error(ChannelError::Decode(diagnostic)));
            self.close(CloseReason::ParseError);
            return;
        }

        self.tracker.record_received(&packet);
        self.emit(ChannelEvent::Packet(packet.clone()));

        match packet.kind {
            PacketKind::Open => self.on_open(&packet),
            PacketKind::Pong => {
                if let Some(handshake) = &self.handshake {
                    self.heartbeat_deadline = Some(Instant::now() + handshake.heartbeat_window());
                }
            }
            PacketKind::Ping => self.enqueue(Packet::new(PacketKind::Pong, packet.data), None),
            PacketKind::Message => {
                let data = packet.data.unwrap_or(PacketData::Text(String::new()));
                self.emit(ChannelEvent::Message(data));
            }
            PacketKind::Close => self.close(CloseReason::ServerClose),
            PacketKind::Upgrade | PacketKind::Noop | PacketKind::Error => {}
        }
    }

    fn on_open(&mut self, packet: &Packet) {
        if self.handshake.is_some() {
            tracing::debug!("ignoring repeated OPEN");
            return;
        }

        let parsed = packet
            .text()
            .ok_or_else(|| ChannelError::Handshake("missing handshake payload".to_string()))
            .and_then(Handshake::parse);
        let handshake = match parsed {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!("{e}");
                self.emit(ChannelEvent::Error(e));
                self.close(CloseReason::ParseError);
                return;
            }
        };

        tracing::info!(
            sid = %handshake.sid,
            transport = %self.transport.kind(),
            ping_interval = handshake.ping_interval,
            ping_timeout = handshake.ping_timeout,
            "channel open"
        );
        let now = Instant::now();
        self.heartbeat_deadline = Some(now + handshake.heartbeat_window());
        if !handshake.ping_interval().is_zero() {
            self.ping_at = Some(now + handshake.ping_interval());
        }
        self.tracker.set_handshake(handshake.clone());
        self.handshake = Some(handshake.clone());
        self.set_state(ReadyState::Open);
        self.emit(ChannelEvent::Opened(handshake.clone()));
        self.flush();

        if self.state != ReadyState::Open {
            return;
        }
        if let Some(target) = self.prefs.upgrade_target(self.transport.kind(), &handshake) {
            self.start_probe(target, &handshake.sid);
        }
    }

    fn on_ping_timer(&mut self) {
        let Some(interval) = self.handshake.as_ref().map(Handshake::ping_interval) else {
            self.ping_at = None;
            return;
        };
        self.ping_at = Some(Instant::now() + interval);
        self.enqueue(Packet::ping(), None);
    }

    fn on_heartbeat_timeout(&mut self) {
        let window = self
            .handshake
            .as_ref()
            .map(Handshake::heartbeat_window)
            .unwrap_or_default();
        tracing::warn!(?window, "no heartbeat from server");
        self.emit(ChannelEvent::Error(ChannelError::HeartbeatTimeout(window)));
        self.close(CloseReason::PingTimeout);
    }

    fn start_probe(&mut self, kind: TransportKind, sid: &str) {
        tracing::info!(from = %self.transport.kind(), to = %kind, "probing upgrade");
        let mut transport = self.connector.connect(kind, &self.config.transport, Some(sid));
        transport.open();
        self.probe = Some(Probe {
            transport,
            kind,
            phase: ProbePhase::Opening,
            deadline: Instant::now() + self.config.probe_timeout(),
            held: Vec::new(),
        });
    }

    fn on_probe_event(&mut self, event: Option<TransportEvent>) {
        let Some(probe) = self.probe.as_mut() else {
            return;
        };

        match (probe.phase, event) {
            (_, None) => {
                self.fail_probe(ProbeError::TransportClosed("transport finished".to_string()))
            }
            (_, Some(TransportEvent::Error(e))) => self.fail_probe(ProbeError::Transport(e)),
            (_, Some(TransportEvent::Closed(reason))) => {
                self.fail_probe(ProbeError::TransportClosed(reason))
            }
            (ProbePhase::Opening, Some(TransportEvent::Opened)) => {
                tracing::debug!(transport = %probe.kind, "probe transport open");
                let ping = Packet::new(PacketKind::Ping, Some(PROBE.into()));
                match probe.transport.send(vec![ping]) {
                    Ok(()) => probe.phase = ProbePhase::AwaitingPong,
                    Err(e) => self.fail_probe(ProbeError::Transport(e)),
                }
            }
            (ProbePhase::Opening | ProbePhase::AwaitingPong, Some(TransportEvent::Packet(packet))) => {
                if packet.kind == PacketKind::Pong && packet.text() == Some(PROBE) {
                    self.commit_probe();
                } else {
                    self.fail_probe(ProbeError::UnexpectedResponse(describe(&packet)));
                }
            }
            (ProbePhase::Pausing, Some(event)) => probe.held.push(event),
            // the probe PING draining
            (_, Some(_)) => {}
        }
    }

    fn commit_probe(&mut self) {
        let pause_deadline = Instant::now() + self.config.pause_timeout();
        let Some(probe) = self.probe.as_mut() else {
            return;
        };
        probe.phase = ProbePhase::Pausing;
        probe.deadline = pause_deadline;
        let kind = probe.kind;

        tracing::info!(to = %kind, "probe answered, pausing {}", self.transport.kind());
        self.upgrading = true;
        self.emit(ChannelEvent::Upgrading(kind));
        self.transport.pause();
    }

    fn on_probe_deadline(&mut self) {
        match self.probe.as_ref().map(|p| p.phase) {
            Some(ProbePhase::Pausing) => {
                tracing::warn!("transport did not pause in time, upgrading anyway");
                self.swap();
            }
            Some(_) => self.fail_probe(ProbeError::Timeout(self.config.probe_timeout())),
            None => {}
        }
    }

    /// Make the candidate the active transport.
    fn swap(&mut self) {
        let Some(Probe {
            transport, kind, held, ..
        }) = self.probe.take()
        else {
            return;
        };

        let mut old = std::mem::replace(&mut self.transport, transport);
        // whatever the old transport delivered before it went quiet
        while let Some(event) = old.try_next_event() {
            match event {
                TransportEvent::Packet(packet) => self.on_packet(packet),
                TransportEvent::Drained => self.on_drain(),
                _ => {}
            }
            if self.state == ReadyState::Closed {
                break;
            }
        }
        old.close();
        if self.state == ReadyState::Closed {
            return;
        }

        // writes the old transport never confirmed
        self.in_flight.clear();
        self.in_flight_packets = 0;

        self.tracker.set_transport(kind);
        self.tracker.record_upgrade();
        self.buffer.push_front((Packet::upgrade(), None));
        self.upgrading = false;
        tracing::info!(transport = %kind, "upgraded");
        self.emit(ChannelEvent::Upgraded(kind));

        for event in held {
            self.on_transport_event(Some(event));
            if self.state == ReadyState::Closed {
                return;
            }
        }
        self.flush();
    }

    fn fail_probe(&mut self, error: ProbeError) {
        let Some(mut probe) = self.probe.take() else {
            return;
        };
        probe.transport.close();
        tracing::warn!(transport = %probe.kind, "upgrade failed: {error}");
        self.emit(ChannelEvent::UpgradeFailed(error));

        if probe.phase == ProbePhase::Pausing {
            self.upgrading = false;
            self.transport.resume();
            self.flush();
        }
    }

    fn close(&mut self, reason: CloseReason) {
        if self.state == ReadyState::Closed {
            return;
        }

        if let Some(mut probe) = self.probe.take() {
            probe.transport.close();
            self.emit(ChannelEvent::UpgradeFailed(ProbeError::ChannelClosed));
        }
        self.upgrading = false;
        self.set_state(ReadyState::Closing);

        if reason == CloseReason::Forced && self.transport.is_writable() {
            if let Err(e) = self.transport.send(vec![Packet::close()]) {
                tracing::debug!("CLOSE not sent: {e}");
            }
        }
        self.transport.close();

        self.ping_at = None;
        self.heartbeat_deadline = None;
        self.buffer.clear();
        self.in_flight.clear();
        self.in_flight_packets = 0;
        self.handshake = None;
        self.set_state(ReadyState::Closed);

        tracing::info!(%reason, "channel closed");
        self.emit(ChannelEvent::Closed(reason));
    }
}
