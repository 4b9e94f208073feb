//! Message Types für Signaling-Protokoll
//!
//! Ein Kanal transportiert die Nachrichten genau eines Calls. Die
//! Strukturen entsprechen dem JSON-Schema des Signaling-Backends.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Call ID wie vom Backend vergeben
///
/// Das Backend verwendet numerische IDs, ältere Pfade schicken Strings.
/// Die ID wird in der Form zurückgeschickt, in der sie empfangen wurde,
/// verglichen wird aber über die Textform: `42` und `"42"` sind derselbe Call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallId {
    Numeric(u64),
    Text(String),
}

impl CallId {
    fn canonical(&self) -> Cow<'_, str> {
        match self {
            CallId::Numeric(id) => Cow::Owned(id.to_string()),
            CallId::Text(id) => Cow::Borrowed(id),
        }
    }
}

impl PartialEq for CallId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CallId::Numeric(a), CallId::Numeric(b)) => a == b,
            _ => self.canonical() == other.canonical(),
        }
    }
}

impl Eq for CallId {}

impl Hash for CallId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallId::Numeric(id) => write!(f, "{}", id),
            CallId::Text(id) => f.write_str(id),
        }
    }
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        CallId::Numeric(id)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        CallId::Text(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        CallId::Text(id)
    }
}

// ============================================================================
// SESSION DESCRIPTION / ICE CANDIDATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP wie es der Browser als `RTCSessionDescriptionInit` schickt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate wie `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNALING MESSAGES
// ============================================================================

/// Alle Nachrichten auf dem Signaling-Kanal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// SDP Offer vom Initiator
    Offer {
        call: CallId,
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver: Option<String>,
        sdp: SessionDescription,
    },

    /// SDP Answer vom Responder
    Answer {
        call: CallId,
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver: Option<String>,
        sdp: SessionDescription,
    },

    /// ICE Candidate (beide Richtungen)
    IceCandidate {
        call: CallId,
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver: Option<String>,
        candidate: IceCandidate,
    },

    /// Chat-Nachricht innerhalb des Calls
    Chat {
        call: CallId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
}

impl SignalingMessage {
    /// Call ID der Nachricht
    pub fn call(&self) -> &CallId {
        match self {
            SignalingMessage::Offer { call, .. }
            | SignalingMessage::Answer { call, .. }
            | SignalingMessage::IceCandidate { call, .. }
            | SignalingMessage::Chat { call, .. } => call,
        }
    }

    /// Absender-ID (bei Chat optional)
    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { sender, .. }
            | SignalingMessage::Answer { sender, .. }
            | SignalingMessage::IceCandidate { sender, .. } => Some(sender),
            SignalingMessage::Chat { sender, .. } => sender.as_deref(),
        }
    }

    /// Empfänger-ID bei Punkt-zu-Punkt Nachrichten
    pub fn receiver(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { receiver, .. }
            | SignalingMessage::Answer { receiver, .. }
            | SignalingMessage::IceCandidate { receiver, .. } => receiver.as_deref(),
            SignalingMessage::Chat { .. } => None,
        }
    }

    /// Name des Nachrichtentyps für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Chat { .. } => "chat",
        }
    }
}
