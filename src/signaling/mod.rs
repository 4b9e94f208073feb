//! Signaling Module - Transport für den Call-Kanal
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung pro Call aufbauen und halten
//! - Reconnect mit begrenztem Backoff
//! - Polling über die REST-API als Fallback
//! - Eingehende Nachrichten parsen und weiterleiten
//!

mod client;
mod messages;
mod polling;
mod reconnect;
mod transport;

pub use client::WebSocketTransport;
pub use messages::*;
pub use polling::PollingTransport;
pub use reconnect::ReconnectPolicy;
pub use transport::{FallbackTransport, SignalingError, SignalingTransport, TransportEvent};

use crate::backend::CallApi;
use crate::config::CallConfig;
use std::sync::Arc;

/// Baut den Transport für einen Call und verbindet ihn
///
/// Versucht zuerst den WebSocket und fällt auf Polling zurück, wenn der
/// Handshake scheitert.
pub async fn connect_signaling(
    config: &CallConfig,
    call_id: &CallId,
    api: Arc<dyn CallApi>,
) -> Result<Arc<FallbackTransport>, SignalingError> {
    let transport = Arc::new(build_transport(config, call_id, api)?);
    transport.connect().await?;
    Ok(transport)
}

/// Baut den Transport ohne zu verbinden
pub fn build_transport(
    config: &CallConfig,
    call_id: &CallId,
    api: Arc<dyn CallApi>,
) -> Result<FallbackTransport, SignalingError> {
    let endpoint = WebSocketTransport::endpoint_for(
        &config.signaling_url,
        call_id,
        config.auth_token.as_deref(),
    )?;
    let primary = WebSocketTransport::new(endpoint, config.reconnect.clone());
    let fallback = PollingTransport::new(
        call_id.clone(),
        api,
        config.poll_interval(),
        config.reconnect.max_attempts,
    );
    Ok(FallbackTransport::new(primary, fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCallApi;

    #[test]
    fn test_build_transport_uses_call_endpoint() {
        let config = CallConfig {
            signaling_url: "https://signal.example.com".to_string(),
            auth_token: Some("secret".to_string()),
            ..CallConfig::default()
        };
        let transport =
            build_transport(&config, &CallId::from(9u64), Arc::new(FakeCallApi::new())).unwrap();
        assert_eq!(
            transport.primary().endpoint().as_str(),
            "wss://signal.example.com/ws/call/9/?token=secret"
        );
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_build_transport_rejects_bad_url() {
        let config = CallConfig {
            signaling_url: "not a url".to_string(),
            ..CallConfig::default()
        };
        let result = build_transport(&config, &CallId::from(9u64), Arc::new(FakeCallApi::new()));
        assert!(matches!(result, Err(SignalingError::InvalidEndpoint(_))));
    }
}
