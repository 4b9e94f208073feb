//! Call Orchestrator
//!
//! `CallSession` führt einen Call von `Idle` bis `Ended`/`Failed`:
//! Media anfordern, Engine bauen, Offer/Answer austauschen und auf
//! `connected` warten. Eingehende Signaling- und Peer-Events laufen über
//! einen einzigen Pump-Task, damit sie in Ankunftsreihenfolge verarbeitet
//! werden.

use super::chat::{ChatLog, ChatMessage};
use super::events::{CallPhase, SessionEvent};
use super::{CallDescriptor, CallError, CallKind, Role};
use crate::backend::CallApi;
use crate::call_engine::{
    ConnectionState, NegotiationEngine, NegotiationError, NegotiationSnapshot, PeerEvent,
    PeerFactory,
};
use crate::config::CallConfig;
use crate::media::{MediaDevices, MediaManager, MediaSnapshot};
use crate::signaling::{
    CallId, IceCandidate, SessionDescription, SignalingMessage, SignalingTransport,
    TransportEvent,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Kapazität des UI-Event-Kanals
const SESSION_EVENT_CAPACITY: usize = 100;

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Externe Kollaborateure einer Session
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerFactory>,
    pub transport: Arc<dyn SignalingTransport>,
    pub api: Arc<dyn CallApi>,
}

// ============================================================================
// SESSION STATE
// ============================================================================

#[derive(Default)]
struct SessionState {
    phase: CallPhase,
    role: Option<Role>,
    engine: Option<Arc<NegotiationEngine>>,

    /// Beim Responder aus dem Offer gelernt
    remote_user: Option<String>,

    /// Offer, das vor der Engine eingetroffen ist (SDP, Absender)
    pending_offer: Option<(SessionDescription, String)>,

    /// Remote Candidates vor der Engine
    early_candidates: Vec<IceCandidate>,

    /// Signaling war seit dem Offer weg oder das Offer ging nicht raus
    signaling_lost: bool,

    connected_once: bool,
    torn_down: bool,
}

struct SessionInner {
    config: CallConfig,
    descriptor: CallDescriptor,
    media: MediaManager,
    peers: Arc<dyn PeerFactory>,
    transport: Arc<dyn SignalingTransport>,
    api: Arc<dyn CallApi>,
    state: Mutex<SessionState>,
    chat: ChatLog,
    event_tx: broadcast::Sender<SessionEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    transport_rx: Mutex<Option<broadcast::Receiver<TransportEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    establish_timer: Mutex<Option<JoinHandle<()>>>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for slot in [&self.establish_timer, &self.grace_timer, &self.pump] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Call mit genau einem Remote-Peer
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    /// Erstellt eine Session im Zustand `Idle`
    ///
    /// Der Transport wird sofort abonniert, damit Nachrichten vor
    /// `initialize_call` nicht verloren gehen.
    pub fn new(config: CallConfig, descriptor: CallDescriptor, deps: SessionDeps) -> Self {
        let (event_tx, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let transport_rx = deps.transport.subscribe();

        let state = SessionState {
            remote_user: descriptor.remote_user.clone(),
            ..SessionState::default()
        };

        Self {
            inner: Arc::new(SessionInner {
                config,
                descriptor,
                media: MediaManager::new(deps.devices),
                peers: deps.peers,
                transport: deps.transport,
                api: deps.api,
                state: Mutex::new(state),
                chat: ChatLog::new(),
                event_tx,
                peer_tx,
                peer_rx: Mutex::new(Some(peer_rx)),
                transport_rx: Mutex::new(Some(transport_rx)),
                shutdown_tx,
                establish_timer: Mutex::new(None),
                grace_timer: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }

    fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn call_id(&self) -> &CallId {
        &self.inner.descriptor.call_id
    }

    pub fn descriptor(&self) -> &CallDescriptor {
        &self.inner.descriptor
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.state.lock().phase
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.state.lock().role
    }

    pub fn remote_user(&self) -> Option<String> {
        self.inner.state.lock().remote_user.clone()
    }

    pub fn media(&self) -> MediaSnapshot {
        self.inner.media.snapshot()
    }

    pub fn negotiation(&self) -> Option<NegotiationSnapshot> {
        self.engine().map(|engine| engine.snapshot())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine()
            .map(|engine| engine.connection_state())
            .unwrap_or_default()
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.inner.chat.messages()
    }

    fn engine(&self) -> Option<Arc<NegotiationEngine>> {
        self.inner.state.lock().engine.clone()
    }

    fn local_user(&self) -> &str {
        &self.inner.descriptor.local_user
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn set_phase(&self, phase: CallPhase) {
        self.inner.state.lock().phase = phase;
        self.emit_phase(phase);
    }

    fn emit_phase(&self, phase: CallPhase) {
        tracing::info!("Call {} -> {:?}", self.call_id(), phase);
        self.emit(SessionEvent::StateChanged(phase));
    }

    // ========================================================================
    // PUBLIC CONTROL SURFACE
    // ========================================================================

    /// Startet den Call in der angegebenen Rolle
    ///
    /// Kehrt zurück, sobald das Offer (Initiator) bzw. das Answer
    /// (Responder, falls das Offer schon da ist) gesendet wurde. Der Rest
    /// der Verhandlung läuft über Events.
    pub async fn initialize_call(&self, is_initiator: bool) -> Result<(), CallError> {
        let role = if is_initiator {
            Role::Initiator
        } else {
            Role::Responder
        };

        {
            let mut state = self.inner.state.lock();
            if state.phase != CallPhase::Idle {
                tracing::warn!(
                    "initialize_call ignored for call {}: already {:?}",
                    self.call_id(),
                    state.phase
                );
                return Err(CallError::InvalidState(state.phase));
            }
            state.phase = CallPhase::AcquiringMedia;
            state.role = Some(role);
        }
        self.emit_phase(CallPhase::AcquiringMedia);

        self.start_pump();
        self.arm_establishment_timer();

        let video = self.inner.descriptor.kind == CallKind::Video;
        let (signaling, media) =
            tokio::join!(self.ensure_signaling(), self.inner.media.acquire(video, true));

        if let Err(e) = media {
            let error = CallError::MediaAccess(e);
            self.fail(error.clone()).await;
            return Err(error);
        }
        if self.is_superseded(CallPhase::AcquiringMedia) {
            // Call wurde währenddessen beendet
            self.inner.media.release();
            self.inner.transport.close();
            return Ok(());
        }
        self.emit(SessionEvent::MediaChanged(self.inner.media.snapshot()));

        if let Err(error) = signaling {
            self.fail(error.clone()).await;
            return Err(error);
        }

        let engine = match self.build_engine().await {
            Ok(engine) => engine,
            Err(e) => {
                let error = CallError::NegotiationFailure(e.to_string());
                self.fail(error.clone()).await;
                return Err(error);
            }
        };

        let attached = {
            let mut state = self.inner.state.lock();
            if state.phase != CallPhase::AcquiringMedia {
                None
            } else {
                engine.buffer_early_candidates(std::mem::take(&mut state.early_candidates));
                state.engine = Some(Arc::clone(&engine));

                Some(match role {
                    Role::Initiator => {
                        state.phase = CallPhase::Offering;
                        (CallPhase::Offering, None)
                    }
                    Role::Responder => match state.pending_offer.take() {
                        Some((sdp, sender)) => {
                            state.phase = CallPhase::Negotiating;
                            state.remote_user = Some(sender);
                            (CallPhase::Negotiating, Some(sdp))
                        }
                        None => {
                            state.phase = CallPhase::AwaitingRemote;
                            (CallPhase::AwaitingRemote, None)
                        }
                    },
                })
            }
        };
        let Some((phase, stashed_offer)) = attached else {
            engine.close().await;
            self.inner.media.release();
            self.inner.transport.close();
            return Ok(());
        };
        self.emit_phase(phase);

        match (role, stashed_offer) {
            (Role::Initiator, _) => self.send_offer(&engine).await,
            (Role::Responder, Some(offer)) => self.answer_offer(&engine, offer).await,
            (Role::Responder, None) => Ok(()),
        }
    }

    /// Mikrofon an/aus, ohne neu zu verhandeln
    pub fn toggle_microphone(&self) -> bool {
        let enabled = self.inner.media.toggle_microphone();
        self.emit(SessionEvent::MediaChanged(self.inner.media.snapshot()));
        enabled
    }

    /// Kamera an/aus, ohne neu zu verhandeln
    pub fn toggle_video(&self) -> bool {
        let enabled = self.inner.media.toggle_video();
        self.emit(SessionEvent::MediaChanged(self.inner.media.snapshot()));
        enabled
    }

    /// Hängt die Nachricht sofort lokal an und sendet sie
    ///
    /// Die Zustellung ist nicht garantiert (at-most-once).
    pub fn send_chat_message(&self, content: impl Into<String>) -> Result<ChatMessage, CallError> {
        let phase = self.phase();
        if phase.is_finishing() {
            return Err(CallError::InvalidState(phase));
        }

        let message = ChatMessage::local(content);
        self.inner.chat.push(message.clone());

        let delivered = self.inner.transport.send(&SignalingMessage::Chat {
            call: self.call_id().clone(),
            content: message.content.clone(),
            sender_name: self.inner.descriptor.local_name.clone(),
            sender: Some(self.local_user().to_string()),
        });
        if !delivered {
            tracing::warn!("Chat message for call {} not sent", self.call_id());
        }
        Ok(message)
    }

    /// Beendet den Call (idempotent)
    pub async fn end_call(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.phase.is_finishing() {
                tracing::debug!("end_call ignored: already {:?}", state.phase);
                return;
            }
            state.phase = CallPhase::Ending;
        }
        self.emit_phase(CallPhase::Ending);

        self.teardown().await;

        if let Err(e) = self.inner.api.end_call(self.call_id()).await {
            tracing::warn!("Failed to notify backend about call end: {}", e);
        }
        self.inner.chat.clear();

        self.set_phase(CallPhase::Ended);
        self.emit(SessionEvent::Ended);
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    async fn ensure_signaling(&self) -> Result<(), CallError> {
        if self.inner.transport.is_connected() {
            return Ok(());
        }
        self.inner.transport.connect().await.map_err(|e| {
            tracing::error!("Signaling connect failed for call {}: {}", self.call_id(), e);
            CallError::SignalingUnavailable
        })
    }

    /// Baut Peer Connection und Engine und hängt die lokalen Tracks an
    async fn build_engine(&self) -> Result<Arc<NegotiationEngine>, NegotiationError> {
        let peer = self
            .inner
            .peers
            .create(&self.inner.config.ice_servers, self.inner.peer_tx.clone())
            .await?;
        let engine = Arc::new(NegotiationEngine::new(peer));

        if let Err(e) = engine.add_local_tracks(&self.inner.media.tracks()).await {
            engine.close().await;
            return Err(e);
        }
        Ok(engine)
    }

    async fn send_offer(&self, engine: &NegotiationEngine) -> Result<(), CallError> {
        let offer = match engine.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return self.negotiation_failed(e).await,
        };

        let message = SignalingMessage::Offer {
            call: self.call_id().clone(),
            sender: self.local_user().to_string(),
            receiver: self.remote_user(),
            sdp: offer,
        };
        if !self.inner.transport.send(&message) {
            tracing::warn!("Offer not sent, will retry after signaling reconnect");
            self.inner.state.lock().signaling_lost = true;
        }

        let advanced = {
            let mut state = self.inner.state.lock();
            if state.phase == CallPhase::Offering {
                state.phase = CallPhase::Negotiating;
                true
            } else {
                false
            }
        };
        if advanced {
            self.emit_phase(CallPhase::Negotiating);
        }
        Ok(())
    }

    async fn answer_offer(
        &self,
        engine: &NegotiationEngine,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        if let Err(e) = engine.accept_offer(offer).await {
            return self.negotiation_failed(e).await;
        }
        let answer = match engine.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return self.negotiation_failed(e).await,
        };

        let message = SignalingMessage::Answer {
            call: self.call_id().clone(),
            sender: self.local_user().to_string(),
            receiver: self.remote_user(),
            sdp: answer,
        };
        if !self.inner.transport.send(&message) {
            tracing::warn!("Answer for call {} not sent", self.call_id());
        }
        Ok(())
    }

    async fn negotiation_failed(&self, error: NegotiationError) -> Result<(), CallError> {
        if error == NegotiationError::Closed {
            // Engine wurde durch Teardown geschlossen
            return Ok(());
        }
        let error = CallError::NegotiationFailure(error.to_string());
        self.fail(error.clone()).await;
        Err(error)
    }

    /// Phase hat sich während einer Suspension geändert
    fn is_superseded(&self, expected: CallPhase) -> bool {
        self.inner.state.lock().phase != expected
    }

    // ========================================================================
    // EVENT PUMP
    // ========================================================================

    fn start_pump(&self) {
        let Some(mut transport_rx) = self.inner.transport_rx.lock().take() else {
            return;
        };
        let Some(mut peer_rx) = self.inner.peer_rx.lock().take() else {
            return;
        };
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    event = transport_rx.recv() => {
                        let Some(session) = Self::upgrade(&weak) else { break };
                        match event {
                            Ok(event) => session.handle_transport_event(event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!("Signaling events lagged, {} dropped", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    event = peer_rx.recv() => {
                        let Some(session) = Self::upgrade(&weak) else { break };
                        match event {
                            Some(event) => session.handle_peer_event(event).await,
                            None => break,
                        }
                    }
                }
            }
            tracing::debug!("Session event pump stopped");
        });
        *self.inner.pump.lock() = Some(handle);
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.emit(SessionEvent::SignalingConnected);
                let reconnected = std::mem::take(&mut self.inner.state.lock().signaling_lost);
                if reconnected {
                    self.resend_pending_offer();
                }
            }
            TransportEvent::Disconnected => {
                tracing::warn!("Signaling disconnected for call {}", self.call_id());
                self.inner.state.lock().signaling_lost = true;
                self.emit(SessionEvent::SignalingDisconnected);
            }
            TransportEvent::Unavailable => {
                self.fail(CallError::SignalingUnavailable).await;
            }
            TransportEvent::Message(message) => self.handle_message(message).await,
        }
    }

    /// Offer nach Reconnect erneut senden, solange kein Answer da ist
    fn resend_pending_offer(&self) {
        let (role, phase, engine) = {
            let state = self.inner.state.lock();
            (state.role, state.phase, state.engine.clone())
        };
        if role != Some(Role::Initiator) || phase != CallPhase::Negotiating {
            return;
        }
        let Some(engine) = engine else { return };
        if engine.has_remote_description() {
            return;
        }
        let Some(offer) = engine.local_description() else {
            return;
        };

        tracing::info!("Re-sending offer for call {} after reconnect", self.call_id());
        self.inner.transport.send(&SignalingMessage::Offer {
            call: self.call_id().clone(),
            sender: self.local_user().to_string(),
            receiver: self.remote_user(),
            sdp: offer,
        });
    }

    async fn handle_message(&self, message: SignalingMessage) {
        if message.call() != self.call_id() {
            tracing::debug!(
                "Ignoring {} for foreign call {}",
                message.kind(),
                message.call()
            );
            return;
        }
        if message.sender() == Some(self.local_user()) {
            tracing::debug!("Ignoring echoed {} message", message.kind());
            return;
        }
        if let Some(receiver) = message.receiver() {
            if receiver != self.local_user() {
                tracing::debug!("Ignoring {} addressed to {}", message.kind(), receiver);
                return;
            }
        }

        match message {
            SignalingMessage::Offer { sender, sdp, .. } => self.on_remote_offer(sdp, sender).await,
            SignalingMessage::Answer { sdp, .. } => self.on_remote_answer(sdp).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await
            }
            SignalingMessage::Chat {
                content,
                sender_name,
                ..
            } => {
                if self.phase().is_finishing() {
                    return;
                }
                let message = ChatMessage::remote(content, sender_name);
                self.inner.chat.push(message.clone());
                self.emit(SessionEvent::ChatReceived(message));
            }
        }
    }

    async fn on_remote_offer(&self, sdp: SessionDescription, sender: String) {
        let engine = {
            let mut state = self.inner.state.lock();
            if state.phase.is_finishing() {
                return;
            }
            if state.role == Some(Role::Initiator) {
                tracing::warn!("Ignoring offer from {}: we are the initiator", sender);
                return;
            }

            match state.engine.clone() {
                None => {
                    if state.pending_offer.is_some() {
                        tracing::warn!("Replacing stashed offer with a newer one");
                    }
                    tracing::debug!("Offer from {} stashed until media is ready", sender);
                    state.pending_offer = Some((sdp, sender));
                    return;
                }
                Some(engine) => {
                    if state.phase != CallPhase::AwaitingRemote {
                        tracing::warn!(
                            "Rejecting offer from {} while {:?}",
                            sender,
                            state.phase
                        );
                        return;
                    }
                    state.phase = CallPhase::Negotiating;
                    state.remote_user = Some(sender);
                    engine
                }
            }
        };
        self.emit_phase(CallPhase::Negotiating);

        let _ = self.answer_offer(&engine, sdp).await;
    }

    async fn on_remote_answer(&self, sdp: SessionDescription) {
        let engine = {
            let state = self.inner.state.lock();
            if state.role != Some(Role::Initiator) {
                tracing::warn!("Ignoring answer: we are not the initiator");
                return;
            }
            if !matches!(state.phase, CallPhase::Offering | CallPhase::Negotiating) {
                tracing::warn!("Ignoring answer while {:?}", state.phase);
                return;
            }
            match state.engine.clone() {
                Some(engine) => engine,
                None => return,
            }
        };

        match engine.accept_answer(sdp).await {
            Ok(()) => tracing::info!("Remote answer applied for call {}", self.call_id()),
            Err(NegotiationError::AlreadyNegotiating) => {
                tracing::warn!("Ignoring duplicate answer for call {}", self.call_id());
            }
            Err(e) => {
                let _ = self.negotiation_failed(e).await;
            }
        }
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) {
        let engine = {
            let mut state = self.inner.state.lock();
            if state.phase.is_finishing() {
                return;
            }
            match state.engine.clone() {
                Some(engine) => engine,
                None => {
                    state.early_candidates.push(candidate);
                    return;
                }
            }
        };

        if let Err(e) = engine.add_remote_candidate(candidate).await {
            tracing::warn!("Failed to apply remote candidate: {}", e);
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            PeerEvent::StateChanged(state) => self.on_connection_state(state).await,
            PeerEvent::RemoteTrack { kind } => {
                tracing::info!("Remote {} track arrived", kind);
                self.emit(SessionEvent::RemoteTrack { kind });
            }
        }
    }

    fn on_local_candidate(&self, candidate: IceCandidate) {
        let Some(engine) = self.engine() else {
            tracing::debug!("Dropping local candidate without engine");
            return;
        };
        let Some(candidate) = engine.local_candidate(candidate) else {
            return;
        };

        let sent = self.inner.transport.send(&SignalingMessage::IceCandidate {
            call: self.call_id().clone(),
            sender: self.local_user().to_string(),
            receiver: self.remote_user(),
            candidate,
        });
        if !sent {
            tracing::warn!("Local candidate for call {} not sent", self.call_id());
        }
    }

    async fn on_connection_state(&self, new_state: ConnectionState) {
        let Some(engine) = self.engine() else { return };
        if !engine.observe_state(new_state) {
            return;
        }
        self.emit(SessionEvent::ConnectionStateChanged(new_state));

        match new_state {
            ConnectionState::Connected => {
                self.cancel_grace_timer();
                self.on_connected();
            }
            ConnectionState::Disconnected => {
                // Vor `Connected` greift nur das Establishment-Timeout
                if self.phase() == CallPhase::Connected {
                    self.arm_grace_timer();
                }
            }
            ConnectionState::Failed => {
                self.fail(CallError::NegotiationFailure(
                    "peer connection failed".to_string(),
                ))
                .await;
            }
            ConnectionState::Closed => {
                self.fail(CallError::NegotiationFailure(
                    "peer connection closed unexpectedly".to_string(),
                ))
                .await;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    /// `connected` wirkt genau einmal
    fn on_connected(&self) {
        let role = {
            let mut state = self.inner.state.lock();
            if state.connected_once || state.phase.is_finishing() {
                return;
            }
            state.connected_once = true;
            state.phase = CallPhase::Connected;
            state.role
        };
        self.cancel_establishment_timer();
        self.emit_phase(CallPhase::Connected);

        if role == Some(Role::Initiator) {
            let api = Arc::clone(&self.inner.api);
            let call_id = self.call_id().clone();
            tokio::spawn(async move {
                if let Err(e) = api.start_call(&call_id).await {
                    tracing::warn!("Failed to notify backend about call start: {}", e);
                }
            });
        }
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    fn arm_establishment_timer(&self) {
        let timeout = self.inner.config.establishment_timeout();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = Self::upgrade(&weak) else { return };
            // Eigenen Handle entfernen, damit der Teardown uns nicht abbricht
            session.inner.establish_timer.lock().take();

            let phase = session.phase();
            if phase == CallPhase::Connected || phase.is_finishing() {
                return;
            }
            tracing::warn!(
                "Call {} not connected within {:?}",
                session.call_id(),
                timeout
            );
            session.fail(CallError::EstablishmentTimeout(timeout)).await;
        });

        if let Some(previous) = self.inner.establish_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    #[cfg(test)]
    fn has_establishment_timer(&self) -> bool {
        self.inner.establish_timer.lock().is_some()
    }

    fn cancel_establishment_timer(&self) {
        if let Some(handle) = self.inner.establish_timer.lock().take() {
            handle.abort();
            tracing::debug!("Establishment timeout cancelled");
        }
    }

    fn arm_grace_timer(&self) {
        let mut slot = self.inner.grace_timer.lock();
        if slot.is_some() {
            return;
        }

        let grace = self.inner.config.disconnect_grace();
        let weak = Arc::downgrade(&self.inner);
        tracing::info!("Peer disconnected, waiting {:?} for recovery", grace);

        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(session) = Self::upgrade(&weak) else { return };
            session.inner.grace_timer.lock().take();

            if session.connection_state() == ConnectionState::Disconnected {
                session
                    .fail(CallError::NegotiationFailure(format!(
                        "peer disconnected for more than {:?}",
                        grace
                    )))
                    .await;
            }
        }));
    }

    fn cancel_grace_timer(&self) {
        if let Some(handle) = self.inner.grace_timer.lock().take() {
            handle.abort();
            tracing::info!("Peer connection recovered");
        }
    }

    // ========================================================================
    // FAILURE & TEARDOWN
    // ========================================================================

    /// Übergang nach `Failed` (nur einmal wirksam)
    async fn fail(&self, error: CallError) {
        {
            let mut state = self.inner.state.lock();
            if state.phase.is_finishing() {
                tracing::debug!("Ignoring error after teardown: {}", error);
                return;
            }
            state.phase = CallPhase::Failed;
        }
        tracing::error!("Call {} failed: {}", self.call_id(), error);
        self.emit_phase(CallPhase::Failed);
        self.emit(SessionEvent::Error(error));

        self.teardown().await;

        if let Err(e) = self.inner.api.leave_call(self.call_id()).await {
            tracing::warn!("Failed to notify backend about leaving: {}", e);
        }
    }

    /// Gibt Media, Engine und Transport genau einmal frei
    async fn teardown(&self) {
        let engine = {
            let mut state = self.inner.state.lock();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            state.pending_offer = None;
            state.early_candidates.clear();
            state.engine.take()
        };

        self.cancel_establishment_timer();
        if let Some(handle) = self.inner.grace_timer.lock().take() {
            handle.abort();
        }

        self.inner.media.release();
        if let Some(engine) = engine {
            engine.close().await;
        }
        self.inner.transport.close();
        let _ = self.inner.shutdown_tx.send(true);

        tracing::info!("Call {} torn down", self.call_id());
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", self.call_id())
            .field("phase", &self.phase())
            .field("media", &self.media())
            .finish()
    }
}
