//! Mikrofon Capture
//!
//! Verwendet cpal für Cross-Platform Audio Input. Der cpal-Stream ist nicht
//! Send und lebt daher in einem eigenen Thread, bis der Track gestoppt wird.

use super::manager::{
    LocalTrack, MediaAccessError, MediaDevices, MediaRequest, TrackKind, TrackSource,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Capture-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

/// Geteilter Zustand zwischen cpal-Callback und Leser
///
/// Samples landen nur im Ring-Buffer solange der zugehörige Track
/// `enabled` ist. Der Pegel wird auch im Mute-Zustand gemessen.
struct CaptureSink {
    buffer: Mutex<HeapRb<f32>>,
    level: Mutex<f32>,
    enabled: Arc<AtomicBool>,
}

impl CaptureSink {
    fn new(enabled: Arc<AtomicBool>) -> Self {
        Self {
            buffer: Mutex::new(HeapRb::new(RING_BUFFER_SIZE)),
            level: Mutex::new(0.0),
            enabled,
        }
    }

    /// Verarbeitet einen Callback-Block in der Sample Rate des Devices
    fn push(&self, data: &[f32], source_rate: u32) {
        if data.is_empty() {
            return;
        }

        // Audio Level berechnen (RMS)
        let rms: f32 = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
        *self.level.lock() = rms.min(1.0);

        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }

        let samples = resample_linear(data, source_rate, SAMPLE_RATE);
        let mut buffer = self.buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(sample);
        }
    }

    fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }
}

/// Laufende Mikrofon-Aufnahme
///
/// Der Host zieht Frames über `read_frame` ab, bei vollem Buffer werden
/// neue Samples verworfen.
pub struct MicrophoneCapture {
    sink: Arc<CaptureSink>,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl MicrophoneCapture {
    /// Öffnet das Default-Input-Device und startet die Aufnahme
    pub async fn start(enabled: Arc<AtomicBool>) -> Result<Arc<Self>, MediaAccessError> {
        let sink = Arc::new(CaptureSink::new(enabled));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let stream_sink = Arc::clone(&sink);
        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match Self::open_stream(stream_sink) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Blockiert bis stop() aufgerufen oder der Sender gedroppt wird
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Audio capture stopped");
            })
            .map_err(|e| MediaAccessError::Backend(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| MediaAccessError::Backend("capture thread exited".to_string()))??;

        Ok(Arc::new(Self {
            sink,
            stop_tx: Mutex::new(Some(stop_tx)),
        }))
    }

    fn open_stream(sink: Arc<CaptureSink>) -> Result<cpal::Stream, MediaAccessError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(MediaAccessError::DeviceAbsent(TrackKind::Audio))?;

        let config = find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    sink.push(data, source_sample_rate);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| MediaAccessError::Backend(e.to_string()))?;

        Ok(stream)
    }

    /// Liest einen Frame (FRAME_SIZE Samples @ 48kHz) aus dem Buffer
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        self.sink.read_frame()
    }

    /// Eingangspegel (0.0 - 1.0) für Visualisierung
    pub fn input_level(&self) -> f32 {
        *self.sink.level.lock()
    }
}

impl TrackSource for MicrophoneCapture {
    fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// DEVICES
// ============================================================================

/// MediaDevices mit cpal Mikrofon
///
/// Kamera-Capture liefert die Host-Anwendung über eine eigene
/// `MediaDevices` Implementierung.
#[derive(Default)]
pub struct CpalMediaDevices {
    microphone: Mutex<Option<Arc<MicrophoneCapture>>>,
}

impl CpalMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zuletzt geöffnete Aufnahme, für Pegelanzeige und Frames
    pub fn microphone(&self) -> Option<Arc<MicrophoneCapture>> {
        self.microphone.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for CpalMediaDevices {
    async fn open(&self, request: MediaRequest) -> Result<Vec<LocalTrack>, MediaAccessError> {
        if request.video {
            return Err(MediaAccessError::DeviceAbsent(TrackKind::Video));
        }

        let mut tracks = Vec::new();
        if request.audio {
            let enabled = Arc::new(AtomicBool::new(true));
            let capture = MicrophoneCapture::start(Arc::clone(&enabled)).await?;
            *self.microphone.lock() = Some(Arc::clone(&capture));
            tracks.push(LocalTrack::with_enabled_flag(
                TrackKind::Audio,
                enabled,
                capture,
            ));
        }
        Ok(tracks)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn map_build_error(err: BuildStreamError) -> MediaAccessError {
    match &err {
        BuildStreamError::DeviceNotAvailable => MediaAccessError::DeviceBusy {
            kind: TrackKind::Audio,
            reason: err.to_string(),
        },
        other => MediaAccessError::Backend(other.to_string()),
    }
}

/// Einfaches Linear-Resampling
fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaAccessError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaAccessError::Backend(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Priorität: 48kHz > andere, F32 > andere
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, MediaAccessError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.with_max_sample_rate().into());
        }
    }

    Err(MediaAccessError::Backend(
        "No f32 input configuration available".to_string(),
    ))
}
