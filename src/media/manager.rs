//! Media Acquisition Manager
//!
//! Besitzt die lokalen Tracks einer CallSession. Mute und Kamera-Toggle
//! setzen nur das `enabled` Flag der bestehenden Tracks, es wird weder
//! neue Media angefordert noch neu verhandelt.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Permission to access {0} was denied")]
    PermissionDenied(TrackKind),

    #[error("No {0} device found")]
    DeviceAbsent(TrackKind),

    #[error("{kind} device is busy: {reason}")]
    DeviceBusy { kind: TrackKind, reason: String },

    #[error("Media backend error: {0}")]
    Backend(String),
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("microphone"),
            TrackKind::Video => f.write_str("camera"),
        }
    }
}

/// Quelle hinter einem lokalen Track (Capture-Thread, Kamera, ...)
pub trait TrackSource: Send + Sync {
    /// Stoppt die Quelle und gibt das Gerät frei
    fn stop(&self);
}

/// Lokaler Media-Track
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    source: Arc<dyn TrackSource>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: Arc<dyn TrackSource>) -> Self {
        Self::with_enabled_flag(kind, Arc::new(AtomicBool::new(true)), source)
    }

    /// Track mit einem Flag, das die Quelle selbst auch liest
    pub fn with_enabled_flag(
        kind: TrackKind,
        enabled: Arc<AtomicBool>,
        source: Arc<dyn TrackSource>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            enabled,
            stopped: Arc::new(AtomicBool::new(false)),
            source,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stoppt den Track (idempotent)
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.source.stop();
        }
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// DEVICES
// ============================================================================

/// Welche Tracks angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub video: bool,
    pub audio: bool,
}

/// Zugriff auf Kamera und Mikrofon
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, request: MediaRequest) -> Result<Vec<LocalTrack>, MediaAccessError>;
}

// ============================================================================
// MEDIA STATE
// ============================================================================

/// Lokale Tracks und ihre Flags
#[derive(Debug, Clone)]
pub struct MediaState {
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub tracks: Vec<LocalTrack>,
}

impl MediaState {
    fn from_tracks(tracks: Vec<LocalTrack>) -> Self {
        let enabled = |kind| tracks.iter().any(|t| t.kind() == kind && t.is_enabled());
        Self {
            mic_enabled: enabled(TrackKind::Audio),
            camera_enabled: enabled(TrackKind::Video),
            tracks,
        }
    }

    fn set_kind_enabled(&mut self, kind: TrackKind, enabled: bool) -> bool {
        let mut found = false;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            found = true;
        }
        found
    }
}

/// Snapshot der Flags für die UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaSnapshot {
    pub acquired: bool,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
}

// ============================================================================
// MEDIA MANAGER
// ============================================================================

pub struct MediaManager {
    devices: Arc<dyn MediaDevices>,
    state: Mutex<Option<MediaState>>,
}

impl MediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: Mutex::new(None),
        }
    }

    /// Fordert lokale Media an
    ///
    /// Sind bereits Tracks vorhanden, wird der bestehende State
    /// zurückgegeben und nichts neu angefordert.
    pub async fn acquire(
        &self,
        video_requested: bool,
        audio_requested: bool,
    ) -> Result<MediaState, MediaAccessError> {
        if let Some(state) = self.state.lock().as_ref() {
            return Ok(state.clone());
        }

        let tracks = self
            .devices
            .open(MediaRequest {
                video: video_requested,
                audio: audio_requested,
            })
            .await?;

        let mut guard = self.state.lock();
        if let Some(existing) = guard.as_ref() {
            // Paralleles acquire hat gewonnen
            for track in &tracks {
                track.stop();
            }
            return Ok(existing.clone());
        }

        let state = MediaState::from_tracks(tracks);
        tracing::info!(
            "Local media acquired: {} track(s), mic={}, camera={}",
            state.tracks.len(),
            state.mic_enabled,
            state.camera_enabled
        );
        *guard = Some(state.clone());
        Ok(state)
    }

    /// Schaltet das Mikrofon um und gibt den neuen Status zurück
    pub fn toggle_microphone(&self) -> bool {
        self.toggle(TrackKind::Audio)
    }

    /// Schaltet die Kamera um und gibt den neuen Status zurück
    pub fn toggle_video(&self) -> bool {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> bool {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            tracing::debug!("Toggle {} ignored: no local media", kind);
            return false;
        };

        let current = match kind {
            TrackKind::Audio => state.mic_enabled,
            TrackKind::Video => state.camera_enabled,
        };
        if !state.set_kind_enabled(kind, !current) {
            tracing::debug!("Toggle {} ignored: no such track", kind);
            return false;
        }

        match kind {
            TrackKind::Audio => state.mic_enabled = !current,
            TrackKind::Video => state.camera_enabled = !current,
        }
        tracing::debug!("{} enabled: {}", kind, !current);
        !current
    }

    /// Lokale Tracks (leer wenn nicht angefordert)
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.tracks.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MediaSnapshot {
        match self.state.lock().as_ref() {
            Some(state) => MediaSnapshot {
                acquired: true,
                mic_enabled: state.mic_enabled,
                camera_enabled: state.camera_enabled,
            },
            None => MediaSnapshot::default(),
        }
    }

    /// Stoppt alle Tracks (idempotent)
    pub fn release(&self) {
        if let Some(state) = self.state.lock().take() {
            for track in &state.tracks {
                track.stop();
            }
            tracing::info!("Local media released");
        }
    }
}

impl std::fmt::Debug for MediaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaManager")
            .field("state", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMediaDevices;

    #[tokio::test]
    async fn test_acquire_audio_and_video() {
        let devices = Arc::new(FakeMediaDevices::new());
        let manager = MediaManager::new(devices.clone());

        let state = manager.acquire(true, true).await.unwrap();
        assert_eq!(state.tracks.len(), 2);
        assert!(state.mic_enabled);
        assert!(state.camera_enabled);
        assert_eq!(devices.open_count(), 1);
    }

    #[tokio::test]
    async fn test_second_acquire_reuses_tracks() {
        let devices = Arc::new(FakeMediaDevices::new());
        let manager = MediaManager::new(devices.clone());

        manager.acquire(false, true).await.unwrap();
        manager.acquire(false, true).await.unwrap();
        assert_eq!(devices.open_count(), 1);
    }

    #[tokio::test]
    async fn test_toggles_flip_existing_tracks() {
        let devices = Arc::new(FakeMediaDevices::new());
        let manager = MediaManager::new(devices);
        manager.acquire(true, true).await.unwrap();

        assert!(!manager.toggle_microphone());
        assert!(!manager.toggle_video());
        assert!(manager
            .tracks()
            .iter()
            .all(|t| !t.is_enabled() && !t.is_stopped()));

        assert!(manager.toggle_microphone());
        let snapshot = manager.snapshot();
        assert!(snapshot.mic_enabled);
        assert!(!snapshot.camera_enabled);
    }

    #[tokio::test]
    async fn test_toggle_video_without_camera_track() {
        let devices = Arc::new(FakeMediaDevices::new());
        let manager = MediaManager::new(devices);
        manager.acquire(false, true).await.unwrap();

        assert!(!manager.toggle_video());
        assert!(!manager.snapshot().camera_enabled);
    }

    #[tokio::test]
    async fn test_acquire_error_is_surfaced() {
        let devices = Arc::new(FakeMediaDevices::new());
        devices.fail_with(MediaAccessError::PermissionDenied(TrackKind::Video));
        let manager = MediaManager::new(devices);

        let result = manager.acquire(true, true).await;
        assert_eq!(
            result.unwrap_err(),
            MediaAccessError::PermissionDenied(TrackKind::Video)
        );
        assert!(!manager.snapshot().acquired);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let devices = Arc::new(FakeMediaDevices::new());
        let manager = MediaManager::new(devices.clone());

        // Release ohne acquire
        manager.release();

        manager.acquire(true, true).await.unwrap();
        manager.release();
        manager.release();

        assert_eq!(devices.stop_count(), 2);
        assert!(manager.tracks().is_empty());
    }
}
