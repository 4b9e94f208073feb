//! Chat-Verlauf eines Calls
//!
//! Lebt nur so lange wie die Session und wird beim Beenden geleert.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatSender {
    Local,
    Remote { name: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: ChatSender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn local(content: impl Into<String>) -> Self {
        Self {
            sender: ChatSender::Local,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn remote(content: impl Into<String>, name: Option<String>) -> Self {
        Self {
            sender: ChatSender::Remote { name },
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.sender == ChatSender::Local
    }
}

/// Append-only Chat-Verlauf
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Mutex<Vec<ChatMessage>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: ChatMessage) {
        self.messages.lock().push(message);
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}
