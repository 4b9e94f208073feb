//! REST Client für die Call-Lifecycle Endpoints

use crate::config::CallConfig;
use crate::session::CallKind;
use crate::signaling::{CallId, SignalingMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

// ============================================================================
// TYPES
// ============================================================================

/// Call wie ihn das Backend speichert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    #[serde(default)]
    pub caller: Option<String>,
    #[serde(default)]
    pub receiver: Option<String>,
    pub call_type: CallKind,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CreateCallRequest<'a> {
    receiver: &'a str,
    call_type: CallKind,
}

// ============================================================================
// CALL API TRAIT
// ============================================================================

/// Call-Lifecycle Endpoints des Backends
#[async_trait]
pub trait CallApi: Send + Sync {
    async fn create_call(&self, receiver: &str, kind: CallKind) -> Result<CallRecord, ApiError>;

    async fn start_call(&self, call_id: &CallId) -> Result<(), ApiError>;

    async fn join_call(&self, call_id: &CallId) -> Result<(), ApiError>;

    async fn leave_call(&self, call_id: &CallId) -> Result<(), ApiError>;

    async fn end_call(&self, call_id: &CallId) -> Result<(), ApiError>;

    /// Wartende Signaling-Nachrichten (Polling-Fallback)
    async fn pending_signals(&self, call_id: &CallId) -> Result<Vec<SignalingMessage>, ApiError>;

    async fn send_signal(&self, call_id: &CallId, message: &SignalingMessage)
        -> Result<(), ApiError>;
}

// ============================================================================
// HTTP IMPLEMENTATION
// ============================================================================

/// CallApi über reqwest
#[derive(Debug, Clone)]
pub struct HttpCallApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCallApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token,
        }
    }

    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(config.api_base_url.clone(), config.auth_token.clone())
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn call_url(&self, call_id: &CallId, action: &str) -> String {
        self.url(&format!("calls/{}/{}/", call_id, action))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let resp = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
        resp.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn post_action(&self, call_id: &CallId, action: &str) -> Result<(), ApiError> {
        let url = self.call_url(call_id, action);
        tracing::debug!("POST {}", url);
        self.execute(self.client.post(&url)).await?;
        Ok(())
    }
}

#[async_trait]
impl CallApi for HttpCallApi {
    async fn create_call(&self, receiver: &str, kind: CallKind) -> Result<CallRecord, ApiError> {
        let body = CreateCallRequest {
            receiver,
            call_type: kind,
        };
        let resp = self
            .execute(self.client.post(self.url("calls/")).json(&body))
            .await?;
        let record: CallRecord = Self::decode(resp).await?;
        tracing::info!("Created {:?} call {} to {}", kind, record.id, receiver);
        Ok(record)
    }

    async fn start_call(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.post_action(call_id, "start").await
    }

    async fn join_call(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.post_action(call_id, "join").await
    }

    async fn leave_call(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.post_action(call_id, "leave").await
    }

    async fn end_call(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.post_action(call_id, "end").await
    }

    async fn pending_signals(&self, call_id: &CallId) -> Result<Vec<SignalingMessage>, ApiError> {
        let url = self.url(&format!("calls/{}/signaling/pending/", call_id));
        let resp = self.execute(self.client.get(&url)).await?;
        Self::decode(resp).await
    }

    async fn send_signal(
        &self,
        call_id: &CallId,
        message: &SignalingMessage,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!("calls/{}/signaling/", call_id));
        self.execute(self.client.post(&url).json(message)).await?;
        Ok(())
    }
}
