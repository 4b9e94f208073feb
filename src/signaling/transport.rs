//! Signaling Transport Abstraktion
//!
//! Die CallSession kennt nur `SignalingTransport` und beobachtet
//! `TransportEvent`s. Ob darunter ein WebSocket oder das Polling-Fallback
//! läuft, ist für sie unsichtbar.

use super::client::WebSocketTransport;
use super::messages::SignalingMessage;
use super::polling::PollingTransport;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;

/// Kapazität des Event-Kanals pro Transport
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Signaling connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Signaling transport was closed")]
    Closed,
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events die ein Transport auslöst
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Kanal (wieder) offen
    Connected,

    /// Eingehende Nachricht in Empfangsreihenfolge
    Message(SignalingMessage),

    /// Kanal getrennt, Reconnect kann folgen
    Disconnected,

    /// Reconnect-Budget erschöpft, es kommt nichts mehr
    Unavailable,
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Öffnet den Kanal
    async fn connect(&self) -> Result<(), SignalingError>;

    /// Sendet eine Nachricht
    ///
    /// `false` wenn der Kanal nicht offen ist. Zustellung ist auch bei
    /// `true` nicht garantiert.
    fn send(&self, message: &SignalingMessage) -> bool;

    /// Event-Receiver für eingehende Nachrichten und Statuswechsel
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn is_connected(&self) -> bool;

    /// Schließt den Kanal ohne Reconnect
    fn close(&self);
}

// ============================================================================
// FALLBACK TRANSPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveTransport {
    WebSocket,
    Polling,
}

/// WebSocket mit Polling als Fallback
///
/// Beide Transporte teilen sich einen Event-Kanal, damit Subscriber vor
/// `connect()` nichts verpassen.
pub struct FallbackTransport {
    primary: WebSocketTransport,
    fallback: PollingTransport,
    active: RwLock<Option<ActiveTransport>>,
    closed: AtomicBool,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl FallbackTransport {
    pub fn new(primary: WebSocketTransport, fallback: PollingTransport) -> Self {
        let event_tx = primary.event_sender();
        Self {
            primary,
            fallback: fallback.with_events(event_tx.clone()),
            active: RwLock::new(None),
            closed: AtomicBool::new(false),
            event_tx,
        }
    }

    pub fn primary(&self) -> &WebSocketTransport {
        &self.primary
    }

    /// Läuft gerade das Polling-Fallback?
    pub fn is_degraded(&self) -> bool {
        *self.active.read() == Some(ActiveTransport::Polling)
    }
}

#[async_trait]
impl SignalingTransport for FallbackTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }

        let selected = match self.primary.connect().await {
            Ok(()) => ActiveTransport::WebSocket,
            Err(SignalingError::Closed) => return Err(SignalingError::Closed),
            Err(e) => {
                tracing::warn!("WebSocket signaling unavailable ({}), falling back to polling", e);
                self.fallback.connect().await?;
                ActiveTransport::Polling
            }
        };

        let mut active = self.active.write();
        if self.closed.load(Ordering::SeqCst) {
            drop(active);
            self.primary.close();
            self.fallback.close();
            return Err(SignalingError::Closed);
        }
        *active = Some(selected);
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> bool {
        match *self.active.read() {
            Some(ActiveTransport::WebSocket) => self.primary.send(message),
            Some(ActiveTransport::Polling) => self.fallback.send(message),
            None => false,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        match *self.active.read() {
            Some(ActiveTransport::WebSocket) => self.primary.is_connected(),
            Some(ActiveTransport::Polling) => self.fallback.is_connected(),
            None => false,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        match self.active.write().take() {
            Some(ActiveTransport::WebSocket) => self.primary.close(),
            Some(ActiveTransport::Polling) => self.fallback.close(),
            // connect() läuft noch oder ist gescheitert
            None => {
                self.primary.close();
                self.fallback.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{CallId, ReconnectPolicy};
    use crate::testing::FakeCallApi;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use url::Url;

    #[tokio::test]
    async fn test_falls_back_to_polling_when_websocket_fails() {
        // Port 9 (discard) ist lokal praktisch nie offen
        let endpoint = Url::parse("ws://127.0.0.1:9/ws/call/1/").unwrap();
        let primary = WebSocketTransport::new(endpoint, ReconnectPolicy::default());

        let api = Arc::new(FakeCallApi::new());
        let fallback = PollingTransport::new(
            CallId::from(1u64),
            api.clone(),
            Duration::from_millis(20),
            3,
        );

        let transport = FallbackTransport::new(primary, fallback);
        let mut events = transport.subscribe();

        transport.connect().await.unwrap();
        assert!(transport.is_degraded());
        assert!(transport.is_connected());

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransportEvent::Connected));

        transport.close();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let endpoint = Url::parse("ws://127.0.0.1:9/ws/call/1/").unwrap();
        let primary = WebSocketTransport::new(endpoint, ReconnectPolicy::default());
        let fallback = PollingTransport::new(
            CallId::from(1u64),
            Arc::new(FakeCallApi::new()),
            Duration::from_millis(20),
            3,
        );
        let transport = FallbackTransport::new(primary, fallback);

        let msg = SignalingMessage::Chat {
            call: CallId::from(1u64),
            content: "hi".to_string(),
            sender_name: None,
            sender: None,
        };
        assert!(!transport.send(&msg));
    }

    #[tokio::test]
    async fn test_close_during_handshake_discards_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/ws/call/1/", listener.local_addr().unwrap())).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Handshake erst beantworten, nachdem der Client close() aufgerufen hat
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut ws = accept_async(stream).await.unwrap();
            let ended = tokio::time::timeout(Duration::from_secs(2), async {
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
            })
            .await
            .is_ok();

            let reconnected =
                tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
            (ended, reconnected.is_ok())
        });

        let api = Arc::new(FakeCallApi::new());
        let transport = Arc::new(FallbackTransport::new(
            WebSocketTransport::new(url, ReconnectPolicy::fixed(Duration::from_millis(20), 3)),
            PollingTransport::new(CallId::from(1u64), api.clone(), Duration::from_millis(20), 3),
        ));

        let connecting = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(SignalingError::Closed)));
        assert!(!transport.is_connected());
        assert!(!transport.is_degraded());

        let (ended, reconnected) = server.await.unwrap();
        assert!(ended, "server connection should be dropped");
        assert!(!reconnected, "no reconnect after close");
        assert!(api.calls().is_empty());

        // Einmal geschlossen, bleibt geschlossen
        assert!(matches!(transport.connect().await, Err(SignalingError::Closed)));
    }
}
