//! Reconnect-Policy für den Signaling-Kanal
//!
//! Capped-exponential Backoff mit begrenzter Anzahl Versuche.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff-Parameter für Reconnects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Policy mit festem Intervall
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
            max_attempts,
        }
    }

    /// Wartezeit vor Versuch `attempt` (1-basiert)
    ///
    /// Gibt `None` zurück wenn das Budget erschöpft ist.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 1);
        let delay = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Some(Duration::from_millis(delay as u64))
    }
}
