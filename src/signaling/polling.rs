//! Polling Fallback
//!
//! Holt wartende Signaling-Nachrichten in festen Abständen über die REST-API
//! ab, wenn kein WebSocket aufgebaut werden kann. Gesendet wird per POST.

use super::messages::{CallId, SignalingMessage};
use super::transport::{SignalingError, SignalingTransport, TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::backend::CallApi;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Request/Response Transport für einen Call
pub struct PollingTransport {
    call_id: CallId,
    api: Arc<dyn CallApi>,
    interval: Duration,
    max_failures: u32,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
    event_tx: broadcast::Sender<TransportEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingTransport {
    /// `max_failures` aufeinanderfolgende Fehlschläge machen den Transport
    /// unbrauchbar
    pub fn new(
        call_id: CallId,
        api: Arc<dyn CallApi>,
        interval: Duration,
        max_failures: u32,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            call_id,
            api,
            interval,
            max_failures: max_failures.max(1),
            running: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            event_tx,
            task: Mutex::new(None),
        }
    }

    /// Verwendet einen fremden Event-Kanal
    pub(crate) fn with_events(mut self, event_tx: broadcast::Sender<TransportEvent>) -> Self {
        self.event_tx = event_tx;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn publish(event_tx: &broadcast::Sender<TransportEvent>, messages: Vec<SignalingMessage>) {
        for message in messages {
            tracing::debug!("Polled {} message", message.kind());
            let _ = event_tx.send(TransportEvent::Message(message));
        }
    }
}

#[async_trait]
impl SignalingTransport for PollingTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }

        let initial = self
            .api
            .pending_signals(&self.call_id)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        // Gleicher Lock wie in close(), damit ein close() während des ersten
        // Polls gewinnt
        let mut task = self.task.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }

        tracing::info!(
            "Polling signaling for call {} every {:?}",
            self.call_id,
            self.interval
        );
        self.running.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(TransportEvent::Connected);
        Self::publish(&self.event_tx, initial);

        let api = Arc::clone(&self.api);
        let call_id = self.call_id.clone();
        let running = Arc::clone(&self.running);
        let event_tx = self.event_tx.clone();
        let interval = self.interval;
        let max_failures = self.max_failures;

        let handle = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                if !running.load(Ordering::SeqCst) {
                    return;
                }

                match api.pending_signals(&call_id).await {
                    Ok(messages) => {
                        failures = 0;
                        Self::publish(&event_tx, messages);
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(
                            "Polling failed ({}/{}): {}",
                            failures,
                            max_failures,
                            e
                        );
                        if failures >= max_failures {
                            running.store(false, Ordering::SeqCst);
                            tracing::error!("Polling signaling unavailable for call {}", call_id);
                            let _ = event_tx.send(TransportEvent::Unavailable);
                            return;
                        }
                    }
                }
            }
        });

        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> bool {
        if !self.is_connected() {
            return false;
        }

        let api = Arc::clone(&self.api);
        let call_id = self.call_id.clone();
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(e) = api.send_signal(&call_id, &message).await {
                tracing::warn!("Failed to post {} message: {}", message.kind(), e);
            }
        });
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let was_running = {
            let mut task = self.task.lock();
            self.closed.store(true, Ordering::SeqCst);
            if let Some(handle) = task.take() {
                handle.abort();
            }
            self.running.swap(false, Ordering::SeqCst)
        };
        if was_running {
            tracing::info!("Polling stopped for call {}", self.call_id);
            let _ = self.event_tx.send(TransportEvent::Disconnected);
        }
    }
}
