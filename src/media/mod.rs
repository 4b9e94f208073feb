//! Media Module - Lokale Kamera/Mikrofon Tracks
//!
//! Dieses Modul verwaltet:
//! - Anfordern der lokalen Media-Tracks
//! - Mute/Unmute und Kamera an/aus ohne Renegotiation
//! - Mikrofon-Capture über cpal
//!

mod capture;
mod manager;

pub use capture::{CpalMediaDevices, MicrophoneCapture, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use manager::{
    LocalTrack, MediaAccessError, MediaDevices, MediaManager, MediaRequest, MediaSnapshot,
    MediaState, TrackKind, TrackSource,
};
