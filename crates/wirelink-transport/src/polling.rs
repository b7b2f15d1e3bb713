//! HTTP long-polling transport.
//!
//! Reads run as a loop of GET requests, each response carrying a payload of
//! packets. Writes are POST requests with an encoded payload body. Pausing
//! lets the in-flight GET and any outstanding POST finish, then reports
//! `Paused` exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::lifecycle::{EventSink, Lifecycle};
use crate::packet::{Frame, Packet, PacketKind};
use crate::payload::{decode_payload, encode_payload};
use crate::traits::{Transport, TransportError, TransportEvent, TransportKind, TransportState};

const TEXT_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";
const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Request target shared by the poll and write tasks.
#[derive(Clone)]
struct Endpoint {
    client: Client,
    config: Arc<TransportConfig>,
    session_id: Arc<Mutex<Option<String>>>,
}

impl Endpoint {
    fn request(&self, method: Method) -> Result<RequestBuilder, TransportError> {
        let sid = self.session_id.lock().clone();
        let url = self.config.url(TransportKind::Polling, sid.as_deref())?;
        let mut request = self
            .client
            .request(method, url)
            .timeout(self.config.request_timeout());
        for (name, value) in self.config.headers() {
            request = request.header(name, value);
        }
        Ok(request)
    }

    async fn poll(&self) -> Result<Frame, TransportError> {
        let response = self
            .request(Method::GET)?
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let binary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with(BINARY_CONTENT_TYPE));

        if binary {
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?;
            Ok(Frame::Binary(body))
        } else {
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?;
            Ok(Frame::Text(body))
        }
    }

    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        let request = self.request(Method::POST)?;
        let request = match frame {
            Frame::Text(body) => request.header(CONTENT_TYPE, TEXT_CONTENT_TYPE).body(body),
            Frame::Binary(body) => request.header(CONTENT_TYPE, BINARY_CONTENT_TYPE).body(body),
        };
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }

    fn learn_session(&self, open: &Packet) {
        let sid = open
            .text()
            .and_then(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .and_then(|v| v.get("sid")?.as_str().map(str::to_owned));
        if let Some(sid) = sid {
            *self.session_id.lock() = Some(sid);
        }
    }
}

/// Activity flags consulted to decide when a pause has completed.
#[derive(Default)]
struct PauseGate {
    paused: AtomicBool,
    polling: AtomicBool,
    writing: AtomicBool,
    reported: AtomicBool,
    resumed: Notify,
}

impl PauseGate {
    fn check(&self, sink: &EventSink) {
        if self.paused.load(Ordering::SeqCst)
            && !self.polling.load(Ordering::SeqCst)
            && !self.writing.load(Ordering::SeqCst)
            && !self.reported.swap(true, Ordering::SeqCst)
        {
            tracing::debug!("polling transport paused");
            let _ = sink.send(TransportEvent::Paused);
        }
    }
}

/// Long-polling transport over `reqwest`.
pub struct PollingTransport {
    endpoint: Endpoint,
    lifecycle: Lifecycle,
    sink: EventSink,
    gate: Arc<PauseGate>,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    poll_task: Option<JoinHandle<()>>,
}

impl PollingTransport {
    pub fn new(client: Client, config: TransportConfig, session_id: Option<String>) -> Self {
        let (lifecycle, sink) = Lifecycle::new();
        Self {
            endpoint: Endpoint {
                client,
                config: Arc::new(config),
                session_id: Arc::new(Mutex::new(session_id)),
            },
            lifecycle,
            sink,
            gate: Arc::new(PauseGate::default()),
            writer: None,
            poll_task: None,
        }
    }

    /// Session id learned from the handshake, or given at construction.
    pub fn session_id(&self) -> Option<String> {
        self.endpoint.session_id.lock().clone()
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn supports_binary(&self) -> bool {
        !self.endpoint.config.force_base64
    }

    fn is_writable(&self) -> bool {
        self.lifecycle.is_writable()
    }

    fn open(&mut self) {
        if self.lifecycle.state() != TransportState::Closed || self.poll_task.is_some() {
            return;
        }
        self.lifecycle.transition(TransportState::Opening);
        tracing::debug!("opening polling transport");

        let (tx, rx) = mpsc::unbounded_channel();
        self.writer = Some(tx);
        tokio::spawn(write_loop(
            self.endpoint.clone(),
            self.gate.clone(),
            self.sink.clone(),
            rx,
        ));
        self.poll_task = Some(tokio::spawn(poll_loop(
            self.endpoint.clone(),
            self.gate.clone(),
            self.sink.clone(),
        )));
    }

    fn send(&mut self, packets: Vec<Packet>) -> Result<(), TransportError> {
        if !self.lifecycle.is_writable() {
            return Err(TransportError::NotWritable);
        }
        let frame = encode_payload(&packets, self.supports_binary())?;
        let writer = self.writer.as_ref().ok_or(TransportError::Closed)?;

        self.gate.writing.store(true, Ordering::SeqCst);
        if writer.send(frame).is_err() {
            self.gate.writing.store(false, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }
        self.lifecycle.mark_sending();
        tracing::debug!(count = packets.len(), "polling write queued");
        Ok(())
    }

    fn pause(&mut self) {
        if self.gate.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        self.gate.check(&self.sink);
    }

    fn resume(&mut self) {
        self.lifecycle.resume();
        if !self.gate.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        self.gate.reported.store(false, Ordering::SeqCst);
        self.gate.resumed.notify_one();
        tracing::debug!("polling transport resumed");
    }

    fn close(&mut self) {
        if matches!(
            self.lifecycle.state(),
            TransportState::Closed | TransportState::Closing
        ) && self.poll_task.is_none()
        {
            return;
        }
        self.lifecycle.transition(TransportState::Closing);
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        // the write task drains whatever is queued, then exits
        self.writer = None;
        let _ = self.sink.send(TransportEvent::Closed("forced close".to_string()));
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.lifecycle.next().await
    }

    fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.lifecycle.try_next()
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

async fn poll_loop(endpoint: Endpoint, gate: Arc<PauseGate>, sink: EventSink) {
    let mut opened = false;
    loop {
        gate.polling.store(true, Ordering::SeqCst);
        if gate.paused.load(Ordering::SeqCst) {
            gate.polling.store(false, Ordering::SeqCst);
            gate.check(&sink);
            gate.resumed.notified().await;
            continue;
        }

        let frame = match endpoint.poll().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("poll request failed: {e}");
                gate.polling.store(false, Ordering::SeqCst);
                let _ = sink.send(TransportEvent::Error(e));
                let _ = sink.send(TransportEvent::Closed("transport error".to_string()));
                return;
            }
        };

        let mut closed = false;
        decode_payload(&frame, |packet, _, _| {
            if !opened && !packet.is_error() {
                if packet.kind == PacketKind::Open {
                    endpoint.learn_session(&packet);
                }
                opened = true;
                let _ = sink.send(TransportEvent::Opened);
            }
            closed = packet.kind == PacketKind::Close;
            let _ = sink.send(TransportEvent::Packet(packet));
            !closed
        });
        gate.polling.store(false, Ordering::SeqCst);

        if closed {
            let _ = sink.send(TransportEvent::Closed("transport close".to_string()));
            return;
        }
        gate.check(&sink);
    }
}

async fn write_loop(
    endpoint: Endpoint,
    gate: Arc<PauseGate>,
    sink: EventSink,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = frames.recv().await {
        let event = match endpoint.write(frame).await {
            Ok(()) => TransportEvent::Drained,
            Err(e) => {
                tracing::warn!("poll write failed: {e}");
                TransportEvent::Error(e)
            }
        };
        let _ = sink.send(event);
        gate.writing.store(false, Ordering::SeqCst);
        gate.check(&sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    async fn reply(stream: &mut TcpStream, body: &str) {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=UTF-8\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
    }

    /// Answer one GET per body, in order, then stop accepting.
    async fn serve(bodies: Vec<String>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for body in bodies {
                let (mut stream, _) = listener.accept().await.unwrap();
                reply(&mut stream, &body).await;
            }
        });
        port
    }

    fn framed(packet: &str) -> String {
        format!("{}:{}", packet.encode_utf16().count(), packet)
    }

    fn transport(port: u16) -> PollingTransport {
        let config = TransportConfig {
            host: "127.0.0.1".into(),
            port: Some(port),
            ..Default::default()
        };
        PollingTransport::new(Client::new(), config, None)
    }

    #[tokio::test]
    async fn test_handshake_then_server_close() {
        let open = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#;
        let first = format!("{}:{}", open.encode_utf16().count(), open);
        let port = serve(vec![first, "1:1".to_string()]).await;

        let mut transport = transport(port);
        transport.open();
        assert_eq!(transport.state(), TransportState::Opening);

        assert_eq!(transport.next_event().await, Some(TransportEvent::Opened));
        assert!(transport.is_writable());
        match transport.next_event().await {
            Some(TransportEvent::Packet(p)) => assert_eq!(p.kind, PacketKind::Open),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.session_id().as_deref(), Some("abc"));

        assert_eq!(
            transport.next_event().await,
            Some(TransportEvent::Packet(Packet::close()))
        );
        assert!(matches!(transport.next_event().await, Some(TransportEvent::Closed(_))));
        assert_eq!(transport.state(), TransportState::Closed);
        assert_eq!(transport.next_event().await, None);
    }

    #[tokio::test]
    async fn test_pause_holds_polls_until_resume() {
        const OPEN: &str = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let (polled_tx, polled_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let counter = requests.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            reply(&mut stream, &framed(OPEN)).await;

            // held open until the transport has been asked to pause
            let (mut stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            polled_tx.send(()).unwrap();
            release_rx.await.unwrap();
            reply(&mut stream, &framed("4hey")).await;

            let (mut stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            reply(&mut stream, &framed("1")).await;
        });

        let mut transport = transport(port);
        transport.open();
        assert_eq!(transport.next_event().await, Some(TransportEvent::Opened));
        assert!(matches!(transport.next_event().await, Some(TransportEvent::Packet(_))));

        polled_rx.await.unwrap();
        transport.pause();
        release_tx.send(()).unwrap();
        assert_eq!(
            transport.next_event().await,
            Some(TransportEvent::Packet(Packet::message("hey")))
        );
        assert_eq!(transport.next_event().await, Some(TransportEvent::Paused));
        assert_eq!(transport.state(), TransportState::Paused);

        let idle = tokio::time::timeout(Duration::from_millis(200), transport.next_event()).await;
        assert!(idle.is_err());
        assert_eq!(requests.load(Ordering::SeqCst), 2);

        transport.resume();
        assert_eq!(transport.state(), TransportState::Open);
        assert!(transport.is_writable());
        assert_eq!(
            transport.next_event().await,
            Some(TransportEvent::Packet(Packet::close()))
        );
        assert_eq!(requests.load(Ordering::SeqCst), 3);
        assert!(matches!(transport.next_event().await, Some(TransportEvent::Closed(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_then_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = transport(port);
        transport.open();
        assert!(matches!(transport.next_event().await, Some(TransportEvent::Error(_))));
        assert!(matches!(transport.next_event().await, Some(TransportEvent::Closed(_))));
    }

    #[test]
    fn test_send_requires_writable() {
        let mut transport = transport(1);
        assert_eq!(
            transport.send(vec![Packet::message("x")]),
            Err(TransportError::NotWritable)
        );
    }

    #[test]
    fn test_pause_gate_reports_once() {
        let (mut lifecycle, sink) = Lifecycle::new();
        let gate = PauseGate::default();

        gate.writing.store(true, Ordering::SeqCst);
        gate.paused.store(true, Ordering::SeqCst);
        gate.check(&sink);
        assert_eq!(lifecycle.try_next(), None);

        gate.writing.store(false, Ordering::SeqCst);
        gate.check(&sink);
        gate.check(&sink);
        assert_eq!(lifecycle.try_next(), Some(TransportEvent::Paused));
        assert_eq!(lifecycle.try_next(), None);
    }

    #[test]
    fn test_learn_session_from_open_packet() {
        let endpoint = transport(1).endpoint.clone();
        endpoint.learn_session(&Packet::new(
            PacketKind::Open,
            Some(r#"{"sid":"xyz","upgrades":["websocket"]}"#.into()),
        ));
        assert_eq!(endpoint.session_id.lock().as_deref(), Some("xyz"));
    }
}
