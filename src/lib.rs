//! Call Session - P2P Audio/Video Call Engine
//!
//! Verhandelt einen Call mit genau einem Remote-Peer:
//! - Lokale Media (Mikrofon über cpal, Kamera vom Host)
//! - Signaling über WebSocket mit Reconnect und Polling-Fallback
//! - WebRTC Offer/Answer mit gepufferten ICE Candidates
//! - State Machine von `Idle` bis `Ended`/`Failed`
//!
//! Die UI spricht nur mit [`CallSession`] und beobachtet [`SessionEvent`]s.

pub mod backend;
pub mod call_engine;
pub mod config;
pub mod media;
pub mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{ApiError, CallApi, HttpCallApi};
pub use call_engine::{ConnectionState, NegotiationEngine, WebRtcPeerFactory};
pub use config::{CallConfig, ConfigError};
pub use media::{CpalMediaDevices, MediaAccessError, MediaManager};
pub use session::{
    CallDescriptor, CallError, CallKind, CallPhase, CallSession, IncomingCall, IncomingCallGate,
    SessionDeps, SessionEvent,
};
pub use signaling::{connect_signaling, CallId, SignalingMessage, SignalingTransport};

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging
///
/// `RUST_LOG` wird respektiert. Ein zweiter Aufruf (oder ein bereits
/// gesetzter Subscriber des Hosts) wird ignoriert.
pub fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["call_session=debug", "webrtc=warn"] {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Invalid log directive {}: {}", directive, e),
        }
    }

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::info!("Call session logging initialized");
    }
}
