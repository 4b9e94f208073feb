//! Call-Phasen und Events für die UI

use super::chat::ChatMessage;
use super::CallError;
use crate::call_engine::ConnectionState;
use crate::media::{MediaSnapshot, TrackKind};

/// Phase der CallSession
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    /// Noch nicht gestartet
    #[default]
    Idle,
    /// Kamera/Mikrofon werden angefordert
    AcquiringMedia,
    /// Responder wartet auf das Offer
    AwaitingRemote,
    /// Initiator erstellt und sendet das Offer
    Offering,
    /// Offer/Answer ausgetauscht, ICE läuft
    Negotiating,
    /// Peer Connection steht
    Connected,
    /// Teardown nach endCall läuft
    Ending,
    /// Regulär beendet
    Ended,
    /// Abgebrochen
    Failed,
}

impl CallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Ended | CallPhase::Failed)
    }

    /// Ended, Failed oder gerade beim Beenden
    pub fn is_finishing(&self) -> bool {
        self.is_terminal() || *self == CallPhase::Ending
    }
}

/// Events die von der CallSession ausgelöst werden
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(CallPhase),
    MediaChanged(MediaSnapshot),
    ConnectionStateChanged(ConnectionState),
    RemoteTrack { kind: TrackKind },
    ChatReceived(ChatMessage),
    SignalingConnected,
    SignalingDisconnected,
    Error(CallError),
    Ended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(CallPhase::Ended.is_terminal());
        assert!(CallPhase::Failed.is_terminal());
        assert!(!CallPhase::Ending.is_terminal());
        assert!(CallPhase::Ending.is_finishing());
        assert!(!CallPhase::Connected.is_finishing());
        assert_eq!(CallPhase::default(), CallPhase::Idle);
    }
}
