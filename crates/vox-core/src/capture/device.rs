//! Device seams and the cpal-backed audio implementation.
//!
//! The engine never touches OS handles directly: producers and sinks are
//! opened through `DeviceBackend`, so tests inject synthetic devices and
//! embedders can supply platform capture (camera, screen) the engine treats
//! as opaque chunk producers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;

use crate::config::{AUDIO_CHUNK_SAMPLES, RECEIVE_SAMPLE_RATE, SEND_SAMPLE_RATE, VideoMode};
use crate::session::events::SessionError;

/// Which audio device to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDeviceKind {
    Microphone,
    /// System-audio loopback (what the computer is playing).
    Loopback,
}

/// A mono PCM input producing fixed-size chunks at the send sample rate.
#[async_trait]
pub trait AudioInput: Send {
    /// Reads the next chunk of `AUDIO_CHUNK_SAMPLES` samples.
    async fn read_chunk(&mut self) -> Result<Vec<i16>, SessionError>;
}

/// A video source producing encoded (JPEG) frames on demand.
#[async_trait]
pub trait VideoInput: Send {
    async fn capture_frame(&mut self) -> Result<Bytes, SessionError>;
}

/// Plays raw little-endian PCM at the receive sample rate.
#[async_trait]
pub trait PlaybackSink: Send {
    async fn play(&mut self, pcm: &[u8]) -> Result<(), SessionError>;
}

/// Opens capture producers and playback sinks.
///
/// Opening must fail fast with a device error before any chunk is produced;
/// a returned producer owns its OS handle until dropped.
pub trait DeviceBackend: Send + Sync {
    fn open_audio(&self, kind: AudioDeviceKind) -> Result<Box<dyn AudioInput>, SessionError>;
    fn open_video(&self, mode: VideoMode) -> Result<Box<dyn VideoInput>, SessionError>;
    fn open_playback(&self) -> Result<Box<dyn PlaybackSink>, SessionError>;
}

/// cpal-backed audio devices.
///
/// Video capture is platform-specific and not provided by this backend;
/// embedders wanting camera/screen input supply their own `DeviceBackend`.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl DeviceBackend for CpalBackend {
    fn open_audio(&self, kind: AudioDeviceKind) -> Result<Box<dyn AudioInput>, SessionError> {
        CpalAudioInput::open(kind).map(|input| Box::new(input) as Box<dyn AudioInput>)
    }

    fn open_video(&self, mode: VideoMode) -> Result<Box<dyn VideoInput>, SessionError> {
        Err(SessionError::device(format!(
            "no {mode:?} capture available in the cpal backend; \
             supply a platform DeviceBackend for video input"
        )))
    }

    fn open_playback(&self) -> Result<Box<dyn PlaybackSink>, SessionError> {
        CpalPlaybackSink::open().map(|sink| Box::new(sink) as Box<dyn PlaybackSink>)
    }
}

/// cpal input stream bridged to async through a chunk channel.
///
/// The `cpal::Stream` is not `Send`, so a dedicated thread owns it; dropping
/// this input signals the thread, which drops the stream and releases the
/// device handle.
struct CpalAudioInput {
    chunks: mpsc::Receiver<Vec<i16>>,
    // Held only so the capture thread observes disconnect on drop.
    _stop: std::sync::mpsc::Sender<()>,
}

impl CpalAudioInput {
    fn open(kind: AudioDeviceKind) -> Result<Self, SessionError> {
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<i16>>(32);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), SessionError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name(format!("vox-capture-{kind:?}").to_lowercase())
            .spawn(move || {
                let stream = match build_input_stream(kind, chunk_tx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                // Park until the input is dropped, then release the device.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| {
                SessionError::device("failed to spawn capture thread").with_details(e.to_string())
            })?;

        ready_rx
            .recv()
            .map_err(|_| SessionError::device("capture thread exited before reporting"))??;

        Ok(Self {
            chunks: chunk_rx,
            _stop: stop_tx,
        })
    }
}

fn build_input_stream(
    kind: AudioDeviceKind,
    chunk_tx: mpsc::Sender<Vec<i16>>,
) -> Result<cpal::Stream, SessionError> {
    let host = cpal::default_host();
    let device = match kind {
        AudioDeviceKind::Microphone => host.default_input_device().ok_or_else(|| {
            SessionError::device("no default input device available")
        })?,
        AudioDeviceKind::Loopback => find_loopback_device(&host)?,
    };
    let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
    tracing::info!(device = %name, ?kind, "opening audio input");

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SEND_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: Vec<i16> = Vec::with_capacity(AUDIO_CHUNK_SAMPLES * 2);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[i16], _info| {
                pending.extend_from_slice(data);
                while pending.len() >= AUDIO_CHUNK_SAMPLES {
                    let chunk: Vec<i16> = pending.drain(..AUDIO_CHUNK_SAMPLES).collect();
                    // Drop the chunk when the consumer lags; the device
                    // callback must never block.
                    let _ = chunk_tx.try_send(chunk);
                }
            },
            |err| tracing::warn!(error = %err, "audio input stream error"),
            None,
        )
        .map_err(|e| {
            SessionError::device(format!("failed to open audio input '{name}'"))
                .with_details(e.to_string())
        })?;
    stream.play().map_err(|e| {
        SessionError::device(format!("failed to start audio input '{name}'"))
            .with_details(e.to_string())
    })?;
    Ok(stream)
}

/// Finds a loopback/monitor input device by name.
fn find_loopback_device(host: &cpal::Host) -> Result<cpal::Device, SessionError> {
    let devices = host.input_devices().map_err(|e| {
        SessionError::device("failed to enumerate input devices").with_details(e.to_string())
    })?;
    for device in devices {
        let Ok(name) = device.name() else { continue };
        let lowered = name.to_lowercase();
        if lowered.contains("monitor")
            || lowered.contains("loopback")
            || lowered.contains("stereo mix")
        {
            return Ok(device);
        }
    }
    Err(SessionError::device(
        "no system-audio loopback device found; enable a monitor/loopback \
         input (e.g. Stereo Mix, a PulseAudio monitor, or a virtual cable)",
    ))
}

#[async_trait]
impl AudioInput for CpalAudioInput {
    async fn read_chunk(&mut self) -> Result<Vec<i16>, SessionError> {
        self.chunks
            .recv()
            .await
            .ok_or_else(|| SessionError::device("audio input stream ended"))
    }
}

/// cpal output stream fed from a shared sample ring.
struct CpalPlaybackSink {
    ring: Arc<Mutex<VecDeque<i16>>>,
    _stop: std::sync::mpsc::Sender<()>,
}

impl CpalPlaybackSink {
    fn open() -> Result<Self, SessionError> {
        let ring: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), SessionError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let callback_ring = Arc::clone(&ring);
        std::thread::Builder::new()
            .name("vox-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(callback_ring) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| {
                SessionError::device("failed to spawn playback thread").with_details(e.to_string())
            })?;

        ready_rx
            .recv()
            .map_err(|_| SessionError::device("playback thread exited before reporting"))??;

        Ok(Self {
            ring,
            _stop: stop_tx,
        })
    }
}

fn build_output_stream(ring: Arc<Mutex<VecDeque<i16>>>) -> Result<cpal::Stream, SessionError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SessionError::device("no default output device available"))?;
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(RECEIVE_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [i16], _info| {
                let mut ring = ring.lock().expect("playback ring poisoned");
                for sample in data.iter_mut() {
                    *sample = ring.pop_front().unwrap_or(0);
                }
            },
            |err| tracing::warn!(error = %err, "audio output stream error"),
            None,
        )
        .map_err(|e| {
            SessionError::device("failed to open audio output").with_details(e.to_string())
        })?;
    stream.play().map_err(|e| {
        SessionError::device("failed to start audio output").with_details(e.to_string())
    })?;
    Ok(stream)
}

#[async_trait]
impl PlaybackSink for CpalPlaybackSink {
    async fn play(&mut self, pcm: &[u8]) -> Result<(), SessionError> {
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let backlog = {
            let mut ring = self.ring.lock().expect("playback ring poisoned");
            ring.extend(samples.iter().copied());
            ring.len()
        };
        // Pace submissions so the ring stays a few chunks deep instead of
        // growing without bound while the device drains in real time.
        if backlog > AUDIO_CHUNK_SAMPLES * 8 {
            let excess = backlog - AUDIO_CHUNK_SAMPLES * 8;
            let millis = (excess as u64 * 1_000) / u64::from(RECEIVE_SAMPLE_RATE);
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
        }
        Ok(())
    }
}
