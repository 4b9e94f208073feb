//! Session Module - Call Orchestrator
//!
//! Dieses Modul koordiniert einen Call:
//! - Rolle (Initiator/Responder) und State Machine
//! - Media → Verhandlung → Connected
//! - Timeout, Reconnect-Policy und Teardown
//! - Chat-Relay und eingehende Calls

mod chat;
mod events;
mod incoming;
mod orchestrator;

pub use chat::{ChatLog, ChatMessage, ChatSender};
pub use events::{CallPhase, SessionEvent};
pub use incoming::{CallDecision, IncomingCall, IncomingCallGate};
pub use orchestrator::{CallSession, SessionDeps};

use crate::media::MediaAccessError;
use crate::signaling::CallId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaAccessError),

    #[error("Signaling unavailable")]
    SignalingUnavailable,

    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("Connection not established within {0:?}")]
    EstablishmentTimeout(Duration),

    #[error("Operation not allowed in state {0:?}")]
    InvalidState(CallPhase),
}

// ============================================================================
// CALL IDENTITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Wer mit wem in welchem Call spricht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub call_id: CallId,
    pub local_user: String,
    /// Anzeigename für Chat-Nachrichten
    pub local_name: Option<String>,
    /// Beim Responder erst mit dem Offer bekannt
    pub remote_user: Option<String>,
    pub kind: CallKind,
}

impl CallDescriptor {
    pub fn new(call_id: impl Into<CallId>, local_user: impl Into<String>, kind: CallKind) -> Self {
        Self {
            call_id: call_id.into(),
            local_user: local_user.into(),
            local_name: None,
            remote_user: None,
            kind,
        }
    }

    pub fn with_remote(mut self, remote_user: impl Into<String>) -> Self {
        self.remote_user = Some(remote_user.into());
        self
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }
}
