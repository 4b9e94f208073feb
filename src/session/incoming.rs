//! Eingehende Calls
//!
//! Die Benachrichtigung selbst (Push, Toast) lebt außerhalb. Hier wird nur
//! ein bekannter Call angenommen oder abgelehnt.

use super::{CallDescriptor, CallKind, Role};
use crate::backend::CallApi;
use crate::signaling::CallId;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Ein Call, von dem die Anwendung erfahren hat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub role: Role,
    pub kind: CallKind,
    pub caller: Option<String>,
}

impl IncomingCall {
    pub fn new(call_id: impl Into<CallId>, is_initiator: bool, kind: CallKind) -> Self {
        Self {
            call_id: call_id.into(),
            role: if is_initiator {
                Role::Initiator
            } else {
                Role::Responder
            },
            kind,
            caller: None,
        }
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn is_initiator(&self) -> bool {
        self.role == Role::Initiator
    }

    /// Descriptor für die CallSession
    pub fn descriptor(&self, local_user: impl Into<String>) -> CallDescriptor {
        let descriptor = CallDescriptor::new(self.call_id.clone(), local_user, self.kind);
        match &self.caller {
            Some(caller) => descriptor.with_remote(caller.clone()),
            None => descriptor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallDecision {
    Accepted(CallId),
    Rejected(CallId),
}

/// Nimmt Calls an oder lehnt sie ab
pub struct IncomingCallGate {
    api: Arc<dyn CallApi>,
    decision_tx: broadcast::Sender<CallDecision>,
}

impl IncomingCallGate {
    pub fn new(api: Arc<dyn CallApi>) -> Self {
        let (decision_tx, _) = broadcast::channel(16);
        Self { api, decision_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallDecision> {
        self.decision_tx.subscribe()
    }

    /// Meldet den Beitritt beim Backend (best-effort)
    pub async fn accept(&self, call: &IncomingCall) {
        tracing::info!("Accepting call {}", call.call_id);
        if let Err(e) = self.api.join_call(&call.call_id).await {
            tracing::warn!("Failed to notify join for call {}: {}", call.call_id, e);
        }
        let _ = self
            .decision_tx
            .send(CallDecision::Accepted(call.call_id.clone()));
    }

    /// Meldet die Ablehnung beim Backend (best-effort)
    pub async fn reject(&self, call: &IncomingCall) {
        tracing::info!("Rejecting call {}", call.call_id);
        if let Err(e) = self.api.leave_call(&call.call_id).await {
            tracing::warn!("Failed to notify leave for call {}: {}", call.call_id, e);
        }
        let _ = self
            .decision_tx
            .send(CallDecision::Rejected(call.call_id.clone()));
    }
}
