//! Peer Negotiation Engine
//!
//! Übersetzt lokale/remote Media und Signaling-Events in Offer/Answer und
//! Candidate-Austausch. Remote Candidates werden gepuffert, bis eine Remote
//! Description gesetzt ist, und dann in Ankunftsreihenfolge genau einmal
//! angewendet. Lokale Candidates werden dedupliziert.

use super::peer::PeerConnection;
use crate::media::LocalTrack;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Failed to apply ICE candidate: {0}")]
    Candidate(String),

    #[error("Negotiation already in progress")]
    AlreadyNegotiating,

    #[error("Invalid negotiation state: {0}")]
    InvalidState(&'static str),

    #[error("Negotiation engine is closed")]
    Closed,
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Zustand der Peer Connection (beobachtet, nicht kommandiert)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Was mit einem Remote Candidate passiert ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Gepuffert bis die Remote Description gesetzt ist
    Buffered,
    /// Sofort angewendet
    Applied,
    /// Engine geschlossen, verworfen
    Dropped,
}

// ============================================================================
// NEGOTIATION STATE
// ============================================================================

#[derive(Debug, Default)]
struct NegotiationState {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    connection_state: ConnectionState,

    /// Remote Candidates vor der Remote Description (FIFO)
    pending_candidates: VecDeque<IceCandidate>,

    /// Remote Description gesetzt und Puffer geleert
    remote_ready: bool,

    /// Bereits emittierte lokale Candidates
    sent_candidates: HashSet<IceCandidate>,

    offer_started: bool,
    answer_started: bool,
    remote_started: bool,
    closed: bool,
}

/// Read-only Sicht auf den Verhandlungsstand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationSnapshot {
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub connection_state: ConnectionState,
    pub pending_candidates: usize,
}

// ============================================================================
// NEGOTIATION ENGINE
// ============================================================================

pub struct NegotiationEngine {
    peer: Arc<dyn PeerConnection>,
    state: Mutex<NegotiationState>,
}

impl NegotiationEngine {
    pub fn new(peer: Arc<dyn PeerConnection>) -> Self {
        Self {
            peer,
            state: Mutex::new(NegotiationState::default()),
        }
    }

    /// Übernimmt Candidates, die vor der Engine eingetroffen sind
    ///
    /// Sie landen vor allen später gepufferten Candidates in der Queue.
    pub fn buffer_early_candidates(&self, candidates: impl IntoIterator<Item = IceCandidate>) {
        let mut state = self.state.lock();
        if state.closed || state.remote_ready {
            return;
        }
        let later = std::mem::take(&mut state.pending_candidates);
        state.pending_candidates.extend(candidates);
        state.pending_candidates.extend(later);
    }

    /// Fügt die lokalen Tracks zur Peer Connection hinzu
    pub async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), NegotiationError> {
        for track in tracks {
            self.peer.add_local_track(track).await?;
            tracing::debug!("Added local {} track {}", track.kind(), track.id());
        }
        Ok(())
    }

    /// Initiator: erstellt das Offer und setzt es lokal
    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            if state.offer_started || state.answer_started || state.remote_started {
                return Err(NegotiationError::AlreadyNegotiating);
            }
            state.offer_started = true;
        }

        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.state.lock().local_description = Some(offer.clone());

        tracing::info!("Local offer created");
        Ok(offer)
    }

    /// Responder: setzt das Remote Offer
    pub async fn accept_offer(&self, remote: SessionDescription) -> Result<(), NegotiationError> {
        if remote.kind != SdpKind::Offer {
            return Err(NegotiationError::InvalidSdp("expected an offer".to_string()));
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            if state.offer_started || state.remote_started {
                return Err(NegotiationError::AlreadyNegotiating);
            }
            state.remote_started = true;
        }

        self.apply_remote_description(remote).await
    }

    /// Responder: erstellt das Answer und setzt es lokal
    pub async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            if state.remote_description.is_none() {
                return Err(NegotiationError::InvalidState(
                    "answer requires a remote offer",
                ));
            }
            if state.answer_started || state.offer_started {
                return Err(NegotiationError::AlreadyNegotiating);
            }
            state.answer_started = true;
        }

        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        self.state.lock().local_description = Some(answer.clone());

        tracing::info!("Local answer created");
        Ok(answer)
    }

    /// Initiator: setzt das Remote Answer und schließt die Verhandlung ab
    pub async fn accept_answer(&self, remote: SessionDescription) -> Result<(), NegotiationError> {
        if remote.kind != SdpKind::Answer {
            return Err(NegotiationError::InvalidSdp("expected an answer".to_string()));
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            if !state.offer_started || state.local_description.is_none() {
                return Err(NegotiationError::InvalidState(
                    "answer received without a local offer",
                ));
            }
            if state.remote_started {
                return Err(NegotiationError::AlreadyNegotiating);
            }
            state.remote_started = true;
        }

        self.apply_remote_description(remote).await
    }

    /// Wendet einen Remote Candidate an oder puffert ihn
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, NegotiationError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(CandidateDisposition::Dropped);
            }
            if !state.remote_ready {
                state.pending_candidates.push_back(candidate);
                tracing::debug!(
                    "Buffered remote candidate ({} pending)",
                    state.pending_candidates.len()
                );
                return Ok(CandidateDisposition::Buffered);
            }
        }

        self.peer.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    /// Registriert einen lokalen Candidate
    ///
    /// Gibt den Candidate nur beim ersten Auftreten zurück.
    pub fn local_candidate(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        let mut state = self.state.lock();
        if state.closed || !state.sent_candidates.insert(candidate.clone()) {
            return None;
        }
        Some(candidate)
    }

    /// Übernimmt einen beobachteten Connection-State
    ///
    /// Gibt `true` zurück wenn sich der State geändert hat.
    pub fn observe_state(&self, new_state: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if state.connection_state == new_state {
            return false;
        }
        tracing::debug!(
            "Connection state {:?} -> {:?}",
            state.connection_state,
            new_state
        );
        state.connection_state = new_state;
        true
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description.is_some()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    pub fn snapshot(&self) -> NegotiationSnapshot {
        let state = self.state.lock();
        NegotiationSnapshot {
            local_description: state.local_description.clone(),
            remote_description: state.remote_description.clone(),
            connection_state: state.connection_state,
            pending_candidates: state.pending_candidates.len(),
        }
    }

    /// Schließt die Peer Connection (idempotent)
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending_candidates.clear();
        }

        if let Err(e) = self.peer.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
        self.state.lock().connection_state = ConnectionState::Closed;
        tracing::info!("Negotiation engine closed");
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn apply_remote_description(
        &self,
        remote: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer.set_remote_description(remote.clone()).await?;
        self.state.lock().remote_description = Some(remote);
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Wendet gepufferte Candidates in Ankunftsreihenfolge an
    ///
    /// Candidates, die währenddessen eintreffen, landen weiter im Puffer und
    /// werden in derselben Schleife abgearbeitet. Erst wenn der Puffer leer
    /// ist, gilt die Remote-Seite als bereit.
    async fn flush_pending_candidates(&self) {
        let mut applied = 0usize;
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    return;
                }
                match state.pending_candidates.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        state.remote_ready = true;
                        break;
                    }
                }
            };

            match self.peer.add_ice_candidate(next).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!("Dropping buffered candidate: {}", e),
            }
        }

        if applied > 0 {
            tracing::debug!("Flushed {} buffered remote candidate(s)", applied);
        }
    }
}

impl std::fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("state", &self.snapshot())
            .finish()
    }
}
