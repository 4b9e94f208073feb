//! Backend Module - Call-Lifecycle REST API
//!
//! Create/Start/Join/Leave/End sowie Polling der Signaling-Nachrichten,
//! wenn kein WebSocket verfügbar ist.

mod api;

pub use api::{ApiError, CallApi, CallRecord, HttpCallApi};
