//! Call Engine Module - WebRTC Negotiation
//!
//! Dieses Modul verwaltet:
//! - WebRTC Peer Connections
//! - Offer/Answer Austausch
//! - ICE Candidate Puffer und Deduplizierung
//! - Connection-State Beobachtung

mod negotiation;
mod peer;

pub use negotiation::{
    CandidateDisposition, ConnectionState, NegotiationEngine, NegotiationError,
    NegotiationSnapshot,
};
pub use peer::{PeerConnection, PeerEvent, PeerFactory, WebRtcPeer, WebRtcPeerFactory};
