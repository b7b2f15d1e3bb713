//! Full-duplex websocket transport over `tokio-tungstenite`.
//!
//! One packet per websocket message. A single task owns the socket and
//! serves both directions; the transport talks to it through a command
//! channel so writes, pauses and the final close stay ordered.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use crate::config::TransportConfig;
use crate::lifecycle::{EventSink, Lifecycle};
use crate::packet::{decode_packet, encode_packet, Frame, Packet};
use crate::traits::{Transport, TransportError, TransportEvent, TransportKind, TransportState};

enum Command {
    Write(Vec<Frame>),
    Pause,
}

/// Websocket transport.
pub struct WebSocketTransport {
    config: TransportConfig,
    session_id: Option<String>,
    lifecycle: Lifecycle,
    sink: EventSink,
    commands: Option<mpsc::UnboundedSender<Command>>,
    paused: bool,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig, session_id: Option<String>) -> Self {
        let (lifecycle, sink) = Lifecycle::new();
        Self {
            config,
            session_id,
            lifecycle,
            sink,
            commands: None,
            paused: false,
        }
    }

    fn request(&self) -> Result<Request, TransportError> {
        let url = self
            .config
            .url(TransportKind::WebSocket, self.session_id.as_deref())?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        for (name, value) in self.config.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| TransportError::Connect(format!("header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    fn fail(&self, error: TransportError) {
        let _ = self.sink.send(TransportEvent::Error(error));
        let _ = self.sink.send(TransportEvent::Closed("transport error".to_string()));
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn supports_binary(&self) -> bool {
        !self.config.force_base64
    }

    fn is_writable(&self) -> bool {
        self.lifecycle.is_writable()
    }

    fn open(&mut self) {
        if self.lifecycle.state() != TransportState::Closed || self.commands.is_some() {
            return;
        }
        self.lifecycle.transition(TransportState::Opening);

        let request = match self.request() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("websocket request rejected: {e}");
                self.fail(e);
                return;
            }
        };
        tracing::debug!(uri = %request.uri(), "opening websocket transport");

        let (tx, rx) = mpsc::unbounded_channel();
        self.commands = Some(tx);
        tokio::spawn(run_socket(request, self.sink.clone(), rx));
    }

    fn send(&mut self, packets: Vec<Packet>) -> Result<(), TransportError> {
        if !self.lifecycle.is_writable() {
            return Err(TransportError::NotWritable);
        }
        let frames = packets
            .iter()
            .map(|p| encode_packet(p, self.supports_binary()))
            .collect::<Result<Vec<_>, _>>()?;
        let commands = self.commands.as_ref().ok_or(TransportError::Closed)?;
        commands
            .send(Command::Write(frames))
            .map_err(|_| TransportError::Closed)?;
        self.lifecycle.mark_sending();
        Ok(())
    }

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        match &self.commands {
            Some(commands) if commands.send(Command::Pause).is_ok() => {}
            _ => {
                let _ = self.sink.send(TransportEvent::Paused);
            }
        }
    }

    fn resume(&mut self) {
        self.paused = false;
        self.lifecycle.resume();
    }

    fn close(&mut self) {
        if matches!(
            self.lifecycle.state(),
            TransportState::Closed | TransportState::Closing
        ) && self.commands.is_none()
        {
            return;
        }
        self.lifecycle.transition(TransportState::Closing);
        // the socket task flushes queued writes and sends a close frame
        self.commands = None;
        let _ = self.sink.send(TransportEvent::Closed("forced close".to_string()));
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.lifecycle.next().await
    }

    fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.lifecycle.try_next()
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::text(text),
        Frame::Binary(bytes) => Message::binary(bytes),
    }
}

async fn run_socket(
    request: Request,
    sink: EventSink,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let stream = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::warn!("websocket connect failed: {e}");
            let _ = sink.send(TransportEvent::Error(TransportError::Connect(e.to_string())));
            let _ = sink.send(TransportEvent::Closed("transport error".to_string()));
            return;
        }
    };
    let _ = sink.send(TransportEvent::Opened);
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            message = read.next() => {
                let frame = match message {
                    Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => Frame::Binary(bytes),
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = sink.send(TransportEvent::Closed("transport close".to_string()));
                        return;
                    }
                    // control frames are answered by tungstenite
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!("websocket read failed: {e}");
                        let _ = sink.send(TransportEvent::Error(TransportError::WebSocket(e.to_string())));
                        let _ = sink.send(TransportEvent::Closed("transport error".to_string()));
                        return;
                    }
                };
                let _ = sink.send(TransportEvent::Packet(decode_packet(&frame)));
            }
            command = commands.recv() => match command {
                Some(Command::Write(frames)) => {
                    for frame in frames {
                        if let Err(e) = write.send(to_message(frame)).await {
                            tracing::warn!("websocket write failed: {e}");
                            let _ = sink.send(TransportEvent::Error(TransportError::WebSocket(e.to_string())));
                            let _ = sink.send(TransportEvent::Closed("transport error".to_string()));
                            return;
                        }
                    }
                    let _ = sink.send(TransportEvent::Drained);
                }
                Some(Command::Pause) => {
                    let _ = sink.send(TransportEvent::Paused);
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    return;
                }
            }
        }
    }
}
