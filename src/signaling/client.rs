//! WebSocket Transport für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung eines Calls:
//! - Automatische Reconnection mit Backoff
//! - Keep-Alive Pings
//! - Event-basierte Kommunikation

use super::messages::{CallId, SignalingMessage};
use super::reconnect::ReconnectPolicy;
use super::transport::{SignalingError, SignalingTransport, TransportEvent, EVENT_CHANNEL_CAPACITY};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Ping-Intervall, damit Proxies die Verbindung nicht als idle schließen
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    /// Einmal gesetzt, wird nie mehr zurückgesetzt
    closed: bool,
}

/// Wie eine Verbindung geendet hat
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionEnd {
    /// Lokal über `close()` beendet
    Requested,
    /// Server hat mit 1000/1001 geschlossen
    Normal,
    /// Alles andere, löst Reconnect aus
    Abnormal(String),
}

/// Geteilter Zustand zwischen Transport und Supervisor-Task
#[derive(Clone)]
struct Link {
    endpoint: Url,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ClientState>>,
    tx: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    event_tx: broadcast::Sender<TransportEvent>,
}

// ============================================================================
// WEBSOCKET TRANSPORT
// ============================================================================

/// WebSocket Client für einen Call-Kanal
pub struct WebSocketTransport {
    link: Link,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Erstellt einen neuen Transport für `endpoint`
    pub fn new(endpoint: Url, policy: ReconnectPolicy) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            link: Link {
                endpoint,
                policy,
                state: Arc::new(RwLock::new(ClientState::default())),
                tx: Arc::new(RwLock::new(None)),
                event_tx,
            },
            supervisor: Mutex::new(None),
        }
    }

    /// Baut die Endpoint-URL für einen Call
    ///
    /// `http(s)://` wird zu `ws(s)://`, der Token wird als Query-Parameter
    /// angehängt.
    pub fn endpoint_for(
        base_url: &str,
        call_id: &CallId,
        token: Option<&str>,
    ) -> Result<Url, SignalingError> {
        let base = if base_url.starts_with("http") {
            base_url.replacen("http", "ws", 1)
        } else {
            base_url.to_string()
        };

        let mut url = Url::parse(&format!(
            "{}/ws/call/{}/",
            base.trim_end_matches('/'),
            call_id
        ))
        .map_err(|e| SignalingError::InvalidEndpoint(e.to_string()))?;

        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    pub fn endpoint(&self) -> &Url {
        &self.link.endpoint
    }

    /// Event-Sender, den sich andere Transporte teilen können
    pub(crate) fn event_sender(&self) -> broadcast::Sender<TransportEvent> {
        self.link.event_tx.clone()
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        if self.link.state.read().closed {
            return Err(SignalingError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }

        tracing::info!("Connecting to signaling server: {}", self.link.endpoint);

        let (ws_stream, _) = connect_async(self.link.endpoint.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        // close() während des Handshakes verwirft die Verbindung
        let Some(parts) = self.link.attach(ws_stream) else {
            tracing::info!("Signaling closed during handshake, dropping connection");
            return Err(SignalingError::Closed);
        };

        let link = self.link.clone();
        let handle = tokio::spawn(link.supervise(parts));
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> bool {
        let tx = self.link.tx.read();
        let Some(tx) = tx.as_ref() else {
            tracing::debug!("Dropping {} message: not connected", message.kind());
            return false;
        };

        match serde_json::to_string(message) {
            Ok(text) => tx.send(Message::Text(text)).is_ok(),
            Err(e) => {
                tracing::error!("Failed to serialize {} message: {}", message.kind(), e);
                false
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.link.event_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.link.state.read().is_connected
    }

    fn close(&self) {
        // Ohne Sender beendet sich die Write-Schleife mit einem Close-Frame
        let had_connection = {
            let mut state = self.link.state.write();
            state.closed = true;
            state.is_connected = false;
            self.link.tx.write().take().is_some()
        };
        if !had_connection {
            if let Some(handle) = self.supervisor.lock().take() {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("endpoint", &self.link.endpoint.as_str())
            .field("state", &*self.link.state.read())
            .finish()
    }
}

// ============================================================================
// CONNECTION SUPERVISOR
// ============================================================================

impl Link {
    /// Übernimmt eine frisch aufgebaute Verbindung
    ///
    /// `None` wenn der Transport inzwischen geschlossen wurde. Prüfung und
    /// Übernahme passieren unter demselben Lock wie in `close()`.
    fn attach(
        &self,
        ws_stream: WsStream,
    ) -> Option<(WsWrite, WsRead, mpsc::UnboundedReceiver<Message>)> {
        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel::<Message>();

        {
            let mut state = self.state.write();
            if state.closed {
                return None;
            }
            *self.tx.write() = Some(tx);
            state.is_connected = true;
        }
        let _ = self.event_tx.send(TransportEvent::Connected);

        Some((write, read, rx))
    }

    fn detach(&self) {
        *self.tx.write() = None;
        self.state.write().is_connected = false;
        let _ = self.event_tx.send(TransportEvent::Disconnected);
    }

    /// Hält die Verbindung und verbindet nach abnormalem Ende neu
    async fn supervise(self, mut parts: (WsWrite, WsRead, mpsc::UnboundedReceiver<Message>)) {
        loop {
            let (write, read, rx) = parts;
            let end = self.pump(write, read, rx).await;
            self.detach();

            match end {
                ConnectionEnd::Requested => {
                    tracing::info!("Signaling connection closed");
                    return;
                }
                ConnectionEnd::Normal => {
                    tracing::info!("Signaling server closed the connection");
                    return;
                }
                ConnectionEnd::Abnormal(reason) => {
                    tracing::warn!("Signaling connection lost: {}", reason);
                }
            }

            match self.reconnect().await.and_then(|ws_stream| self.attach(ws_stream)) {
                Some(next) => parts = next,
                None => return,
            }
        }
    }

    async fn reconnect(&self) -> Option<WsStream> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                tracing::error!(
                    "Signaling unavailable after {} reconnect attempt(s)",
                    attempt - 1
                );
                let _ = self.event_tx.send(TransportEvent::Unavailable);
                return None;
            };

            tracing::info!(
                "Reconnecting to signaling server in {:?} (attempt {}/{})",
                delay,
                attempt,
                self.policy.max_attempts
            );
            tokio::time::sleep(delay).await;

            if self.state.read().closed {
                return None;
            }

            match connect_async(self.endpoint.as_str()).await {
                Ok((ws_stream, _)) => {
                    if self.state.read().closed {
                        return None;
                    }
                    tracing::info!("Reconnected to signaling server");
                    return Some(ws_stream);
                }
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    /// Liest und schreibt bis die Verbindung endet
    async fn pump(
        &self,
        mut write: WsWrite,
        mut read: WsRead,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) -> ConnectionEnd {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(frame))) => return classify_close(frame),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return ConnectionEnd::Abnormal(e.to_string()),
                    None => return ConnectionEnd::Abnormal("stream ended".to_string()),
                },
                outgoing = rx.recv() => match outgoing {
                    Some(msg) => {
                        if let Err(e) = write.send(msg).await {
                            return ConnectionEnd::Abnormal(e.to_string());
                        }
                    }
                    None => {
                        let _ = write
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "".into(),
                            })))
                            .await;
                        return ConnectionEnd::Requested;
                    }
                },
                _ = keepalive.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return ConnectionEnd::Abnormal(e.to_string());
                    }
                }
            }
        }
    }

    /// Parst eine eingehende Nachricht und leitet sie weiter
    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<SignalingMessage>(text) {
            Ok(message) => {
                tracing::debug!("Received {} message", message.kind());
                let _ = self.event_tx.send(TransportEvent::Message(message));
            }
            Err(e) => tracing::warn!("Dropping unparseable signaling message: {}", e),
        }
    }
}

fn classify_close(frame: Option<CloseFrame<'static>>) -> ConnectionEnd {
    match frame {
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
            ConnectionEnd::Normal
        }
        Some(frame) => ConnectionEnd::Abnormal(format!("close code {}", u16::from(frame.code))),
        None => ConnectionEnd::Abnormal("close without status".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn local_endpoint() -> (TcpListener, Url) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = Url::parse(&format!("ws://{}/ws/call/1/", addr)).unwrap();
        (listener, url)
    }

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .unwrap()
    }

    fn chat(content: &str) -> SignalingMessage {
        SignalingMessage::Chat {
            call: CallId::from(1u64),
            content: content.to_string(),
            sender_name: Some("Bob".to_string()),
            sender: Some("bob".to_string()),
        }
    }

    #[test]
    fn test_endpoint_for_http_base() {
        let url = WebSocketTransport::endpoint_for(
            "https://calls.example.com/",
            &CallId::from(42u64),
            Some("abc"),
        )
        .unwrap();
        assert_eq!(url.as_str(), "wss://calls.example.com/ws/call/42/?token=abc");
    }

    #[test]
    fn test_endpoint_for_ws_base() {
        let url =
            WebSocketTransport::endpoint_for("ws://localhost:8000", &CallId::from("x1"), None)
                .unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/call/x1/");
    }

    #[test]
    fn test_classify_close_codes() {
        let normal = Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        });
        let away = Some(CloseFrame {
            code: CloseCode::Away,
            reason: "".into(),
        });
        let error = Some(CloseFrame {
            code: CloseCode::Error,
            reason: "".into(),
        });

        assert_eq!(classify_close(normal), ConnectionEnd::Normal);
        assert_eq!(classify_close(away), ConnectionEnd::Normal);
        assert!(matches!(classify_close(error), ConnectionEnd::Abnormal(_)));
        assert!(matches!(classify_close(None), ConnectionEnd::Abnormal(_)));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let (listener, url) = local_endpoint().await;
        drop(listener);

        let transport = WebSocketTransport::new(url, ReconnectPolicy::default());
        let result = transport.connect().await;
        assert!(matches!(result, Err(SignalingError::ConnectionFailed(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_reaches_server() {
        let (listener, url) = local_endpoint().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str::<SignalingMessage>(&text).unwrap()
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected server read: {:?}", other),
                }
            }
        });

        let transport = WebSocketTransport::new(url, ReconnectPolicy::default());
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert!(transport.send(&chat("hello")));

        let received = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, chat("hello"));
        transport.close();
    }

    #[tokio::test]
    async fn test_reconnects_after_abnormal_close() {
        let (listener, url) = local_endpoint().await;
        let server = tokio::spawn(async move {
            // Erste Verbindung ohne Close-Handshake abbrechen
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let text = serde_json::to_string(&chat("after reconnect")).unwrap();
            ws.send(Message::Text(text)).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let transport = WebSocketTransport::new(
            url,
            ReconnectPolicy::fixed(Duration::from_millis(50), 3),
        );
        let mut events = transport.subscribe();
        transport.connect().await.unwrap();

        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Disconnected));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected));
        match next_event(&mut events).await {
            TransportEvent::Message(msg) => assert_eq!(msg, chat("after reconnect")),
            other => panic!("unexpected event: {:?}", other),
        }

        transport.close();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_after_budget_exhausted() {
        let (listener, url) = local_endpoint().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);
            drop(listener);
        });

        let transport = WebSocketTransport::new(
            url,
            ReconnectPolicy::fixed(Duration::from_millis(50), 3),
        );
        let mut events = transport.subscribe();
        transport.connect().await.unwrap();

        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Disconnected));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Unavailable));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_normal_close_does_not_reconnect() {
        let (listener, url) = local_endpoint().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "call over".into(),
                }))
                .await;
            // Listener offen lassen, ein Reconnect würde hier landen
            let _ = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        });

        let transport = WebSocketTransport::new(
            url,
            ReconnectPolicy::fixed(Duration::from_millis(50), 3),
        );
        let mut events = transport.subscribe();
        transport.connect().await.unwrap();

        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Disconnected));

        let more = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
        assert!(more.is_err(), "no further events expected");
    }
}
