//! Call Konfiguration
//!
//! Default-Werte sind für lokale Entwicklung gedacht und können über
//! Umgebungsvariablen überschrieben werden.

use crate::signaling::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8000";
const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
const DEFAULT_ESTABLISHMENT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DISCONNECT_GRACE_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN Server ohne Credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN Server mit Credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: None,
            credential: None,
        },
    ]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Konfiguration für eine CallSession und ihre Kollaborateure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Basis-URL des Signaling-Servers (ws:// oder wss://)
    pub signaling_url: String,

    /// Basis-URL der Backend REST API
    pub api_base_url: String,

    /// Bearer Token für Backend und Signaling
    pub auth_token: Option<String>,

    /// STUN/TURN Server für die Peer Connection
    pub ice_servers: Vec<IceServerConfig>,

    /// Maximale Zeit bis zum Zustand `Connected`
    pub establishment_timeout_secs: u64,

    /// Wie lange `disconnected` toleriert wird
    pub disconnect_grace_secs: u64,

    /// Poll-Intervall des Fallback-Transports
    pub poll_interval_ms: u64,

    pub reconnect: ReconnectPolicy,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_token: None,
            ice_servers: default_ice_servers(),
            establishment_timeout_secs: DEFAULT_ESTABLISHMENT_TIMEOUT_SECS,
            disconnect_grace_secs: DEFAULT_DISCONNECT_GRACE_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CallConfig {
    /// Lädt die Default-Konfiguration und überschreibt sie mit
    /// Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Wie `from_env`, aber mit beliebiger Quelle für die Variablen
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(url) = get("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Some(url) = get("CALL_API_URL") {
            config.api_base_url = url;
        }
        if let Some(token) = get("CALL_API_TOKEN") {
            config.auth_token = Some(token);
        }
        if let Some(raw) = get("CALL_ICE_SERVERS") {
            config.ice_servers =
                serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                    key: "CALL_ICE_SERVERS",
                    reason: e.to_string(),
                })?;
        }
        if let Some(raw) = get("CALL_ESTABLISH_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidValue {
                    key: "CALL_ESTABLISH_TIMEOUT_SECS",
                    reason: e.to_string(),
                }
            })?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "CALL_ESTABLISH_TIMEOUT_SECS",
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.establishment_timeout_secs = secs;
        }

        Ok(config)
    }

    pub fn establishment_timeout(&self) -> Duration {
        Duration::from_secs(self.establishment_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
