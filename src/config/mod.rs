//! Config Module - Laufzeit-Konfiguration
//!
//! Dieses Modul verwaltet:
//! - Signaling- und Backend-URLs
//! - STUN/TURN Server für die Peer Connection
//! - Timeouts und Reconnect-Policy
//!

mod settings;

pub use settings::{CallConfig, ConfigError, IceServerConfig};
