//! Test-Doubles für alle Schnittstellen der Session

use crate::backend::{ApiError, CallApi, CallRecord};
use crate::call_engine::{ConnectionState, NegotiationError, PeerConnection, PeerEvent, PeerFactory};
use crate::config::IceServerConfig;
use crate::media::{LocalTrack, MediaAccessError, MediaDevices, MediaRequest, TrackKind, TrackSource};
use crate::session::CallKind;
use crate::signaling::{
    CallId, IceCandidate, SdpKind, SessionDescription, SignalingError, SignalingMessage,
    SignalingTransport, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};

// ============================================================================
// MEDIA
// ============================================================================

#[derive(Default)]
pub(crate) struct FakeTrackSource {
    stops: Arc<AtomicUsize>,
}

impl TrackSource for FakeTrackSource {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn fake_track(kind: TrackKind) -> LocalTrack {
    LocalTrack::new(kind, Arc::new(FakeTrackSource::default()))
}

/// MediaDevices, das Tracks ohne Hardware liefert
#[derive(Default)]
pub(crate) struct FakeMediaDevices {
    opened: Mutex<Vec<LocalTrack>>,
    open_count: AtomicUsize,
    stops: Arc<AtomicUsize>,
    failure: Mutex<Option<MediaAccessError>>,
    hold: AtomicBool,
    requested: Notify,
    released: Notify,
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: MediaAccessError) {
        *self.failure.lock() = Some(error);
    }

    /// `open` blockiert bis `release_open`
    pub fn hold_open(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_open(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.released.notify_one();
    }

    /// Wartet bis `open` aufgerufen wurde
    pub async fn wait_requested(&self) {
        self.requested.notified().await;
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn all_stopped(&self) -> bool {
        self.opened.lock().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn open(&self, request: MediaRequest) -> Result<Vec<LocalTrack>, MediaAccessError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        self.requested.notify_one();
        if self.hold.load(Ordering::SeqCst) {
            self.released.notified().await;
        }

        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        let mut tracks = Vec::new();
        for (wanted, kind) in [(request.audio, TrackKind::Audio), (request.video, TrackKind::Video)] {
            if wanted {
                let source = FakeTrackSource {
                    stops: Arc::clone(&self.stops),
                };
                tracks.push(LocalTrack::new(kind, Arc::new(source)));
            }
        }
        self.opened.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }
}

// ============================================================================
// PEER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PeerCall {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(IceCandidate),
    Close,
}

/// Peer Connection, die nur Aufrufe protokolliert
///
/// Mit `auto_connect` meldet sie `connecting`/`connected`, sobald lokale
/// und Remote Description gesetzt sind.
#[derive(Default)]
pub(crate) struct FakePeer {
    calls: Mutex<Vec<PeerCall>>,
    applied: Mutex<Vec<IceCandidate>>,
    rejected: Mutex<HashSet<String>>,
    events: Option<mpsc::UnboundedSender<PeerEvent>>,
    auto_connect: bool,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    connected: AtomicBool,
}

impl FakePeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: mpsc::UnboundedSender<PeerEvent>, auto_connect: bool) -> Self {
        Self {
            events: Some(events),
            auto_connect,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.rejected.lock().insert(candidate.to_string());
    }

    pub fn emit(&self, event: PeerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().push(call);
    }

    fn maybe_connect(&self) {
        if self.auto_connect
            && self.has_local.load(Ordering::SeqCst)
            && self.has_remote.load(Ordering::SeqCst)
            && !self.connected.swap(true, Ordering::SeqCst)
        {
            self.emit(PeerEvent::StateChanged(ConnectionState::Connecting));
            self.emit(PeerEvent::StateChanged(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.record(PeerCall::AddTrack(track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(PeerCall::SetLocal(description.kind));
        self.has_local.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(PeerCall::SetRemote(description.kind));
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(PeerCall::AddCandidate(candidate.clone()));
        if self.rejected.lock().contains(&candidate.candidate) {
            return Err(NegotiationError::Candidate("rejected".to_string()));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.record(PeerCall::Close);
        Ok(())
    }
}

pub(crate) struct FakePeerFactory {
    auto_connect: AtomicBool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self {
            auto_connect: AtomicBool::new(true),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let peer = Arc::new(FakePeer::with_events(
            events,
            self.auto_connect.load(Ordering::SeqCst),
        ));
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer as Arc<dyn PeerConnection>)
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Transport im Speicher, Events werden von Hand eingespeist
pub(crate) struct FakeTransport {
    connected: AtomicBool,
    accept_sends: AtomicBool,
    sent: Mutex<Vec<SignalingMessage>>,
    event_tx: broadcast::Sender<TransportEvent>,
    connect_count: AtomicUsize,
    close_count: AtomicUsize,
    closed: AtomicBool,
    hold: AtomicBool,
    connect_requested: Notify,
    connect_released: Notify,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            connected: AtomicBool::new(false),
            accept_sends: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            event_tx,
            connect_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            connect_requested: Notify::new(),
            connect_released: Notify::new(),
        }
    }

    /// `connect` blockiert bis `release_connect`
    pub fn hold_connect(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_connect(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.connect_released.notify_one();
    }

    /// Wartet bis `connect` aufgerufen wurde
    pub async fn wait_connect_requested(&self) {
        self.connect_requested.notified().await;
    }

    pub fn inject(&self, message: SignalingMessage) {
        self.inject_event(TransportEvent::Message(message));
    }

    pub fn inject_event(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn set_accept_sends(&self, accept: bool) {
        self.accept_sends.store(accept, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.connect_requested.notify_one();
        if self.hold.load(Ordering::SeqCst) {
            self.connect_released.notified().await;
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        self.connected.store(true, Ordering::SeqCst);
        self.inject_event(TransportEvent::Connected);
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> bool {
        if !self.connected.load(Ordering::SeqCst) || !self.accept_sends.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().push(message.clone());
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// CallApi, das Aufrufe als `"aktion:id"` protokolliert
#[derive(Default)]
pub(crate) struct FakeCallApi {
    calls: Mutex<Vec<String>>,
    pending: Mutex<VecDeque<Result<Vec<SignalingMessage>, ApiError>>>,
    sent: Mutex<Vec<SignalingMessage>>,
    fail_lifecycle: AtomicBool,
}

impl FakeCallApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nächstes Ergebnis für `pending_signals` (sonst leer)
    pub fn queue_pending(&self, result: Result<Vec<SignalingMessage>, ApiError>) {
        self.pending.lock().push_back(result);
    }

    pub fn fail_lifecycle(&self, fail: bool) {
        self.fail_lifecycle.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn sent_signals(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    fn lifecycle(&self, action: &str, call_id: &CallId) -> Result<(), ApiError> {
        self.calls.lock().push(format!("{}:{}", action, call_id));
        if self.fail_lifecycle.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CallApi for FakeCallApi {
    async fn create_call(&self, receiver: &str, kind: CallKind) -> Result<CallRecord, ApiError> {
        self.calls.lock().push(format!("create:{}", receiver));
        Ok(CallRecord {
            id: CallId::from(1u64),
            caller: None,
            receiver: Some(receiver.to_string()),
            call_type: kind,
            status: Some("pending".to_string()),
            created_at: None,
        })
    }

    async fn start_call(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.lifecycle("start", call_id)
    }

    async fn join_call(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.lifecycle("join", call_id)
    }

    async fn leave_call(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.lifecycle("leave", call_id)
    }

    async fn end_call(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.lifecycle("end", call_id)
    }

    async fn pending_signals(&self, _call_id: &CallId) -> Result<Vec<SignalingMessage>, ApiError> {
        self.pending.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send_signal(
        &self,
        _call_id: &CallId,
        message: &SignalingMessage,
    ) -> Result<(), ApiError> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}
