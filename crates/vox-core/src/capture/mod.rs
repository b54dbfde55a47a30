//! Capture pipeline: owns input producers for the active session.
//!
//! All requested devices are opened before any producer task is spawned, so
//! an unavailable device fails the start synchronously with a device error
//! and nothing is ever captured. Each producer pushes fixed-size chunks into
//! the shared outbound queue; ordering within one source kind is the queue's
//! FIFO order.

pub mod device;
pub mod recorder;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::device::{AudioDeviceKind, AudioInput, DeviceBackend, VideoInput};
use crate::capture::recorder::Recorder;
use crate::config::{VIDEO_FRAME_INTERVAL, ValidatedConfig, VideoMode};
use crate::session::events::{Chunk, SessionError};

/// Producer tasks for one session. Dropped handles keep running; the
/// controller joins (or aborts) them through `into_tasks` during teardown.
#[derive(Debug)]
pub struct CaptureHandles {
    tasks: Vec<JoinHandle<()>>,
}

impl CaptureHandles {
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        self.tasks
    }
}

pub struct CaptureManager;

impl CaptureManager {
    /// Opens every device the config requests and spawns the producers.
    ///
    /// # Errors
    /// Returns a device error before any chunk is produced if a requested
    /// device is unavailable. Not retried.
    pub fn start(
        config: &ValidatedConfig,
        backend: &Arc<dyn DeviceBackend>,
        chunk_tx: mpsc::Sender<Chunk>,
        recorder: Option<Arc<Recorder>>,
        cancel: CancellationToken,
    ) -> Result<CaptureHandles, SessionError> {
        // Open devices first: fail fast, produce nothing on failure.
        let mut audio_inputs: Vec<Box<dyn AudioInput>> = Vec::new();
        if config.audio_source.uses_microphone() {
            audio_inputs.push(backend.open_audio(AudioDeviceKind::Microphone)?);
        }
        if config.audio_source.uses_loopback() {
            audio_inputs.push(backend.open_audio(AudioDeviceKind::Loopback)?);
        }
        let video_input = match config.video_mode {
            VideoMode::None => None,
            mode => Some(backend.open_video(mode)?),
        };

        let mut tasks = Vec::new();
        if !audio_inputs.is_empty() {
            tasks.push(tokio::spawn(run_audio_producer(
                audio_inputs,
                chunk_tx.clone(),
                recorder,
                cancel.clone(),
            )));
        }
        if let Some(input) = video_input {
            tasks.push(tokio::spawn(run_video_producer(
                input,
                chunk_tx,
                cancel,
            )));
        }

        Ok(CaptureHandles { tasks })
    }
}

/// Reads audio chunks (mixing when two inputs are open) until cancelled or
/// the device fails.
async fn run_audio_producer(
    mut inputs: Vec<Box<dyn AudioInput>>,
    chunk_tx: mpsc::Sender<Chunk>,
    recorder: Option<Arc<Recorder>>,
    cancel: CancellationToken,
) {
    let mut sequence = 0u64;
    loop {
        let samples = tokio::select! {
            () = cancel.cancelled() => break,
            samples = read_next(&mut inputs) => match samples {
                Ok(samples) => samples,
                Err(err) => {
                    tracing::warn!(error = %err, "audio producer stopped");
                    break;
                }
            },
        };

        if let Some(recorder) = &recorder {
            recorder.write_outbound(&samples);
        }

        let chunk = Chunk::audio(samples_to_bytes(&samples), sequence);
        sequence += 1;
        if chunk_tx.send(chunk).await.is_err() {
            break; // session send loop is gone
        }
    }
    tracing::debug!("audio producer exited");
}

async fn read_next(inputs: &mut [Box<dyn AudioInput>]) -> Result<Vec<i16>, SessionError> {
    match inputs {
        [single] => single.read_chunk().await,
        [mic, system] => {
            let mic_samples = mic.read_chunk().await?;
            let system_samples = system.read_chunk().await?;
            Ok(mix_audio(&mic_samples, &system_samples))
        }
        _ => Err(SessionError::device("unexpected audio input arrangement")),
    }
}

/// Mixes two mono streams with equal weighting, clamped to the i16 range.
fn mix_audio(mic: &[i16], system: &[i16]) -> Vec<i16> {
    if mic.is_empty() {
        return system.to_vec();
    }
    if system.is_empty() {
        return mic.to_vec();
    }
    let length = mic.len().min(system.len());
    (0..length)
        .map(|i| {
            let mixed = (i32::from(mic[i]) + i32::from(system[i])) / 2;
            mixed.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
        })
        .collect()
}

fn samples_to_bytes(samples: &[i16]) -> Bytes {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(bytes)
}

/// Captures one frame per interval, independent of encode/send latency.
async fn run_video_producer(
    mut input: Box<dyn VideoInput>,
    chunk_tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(VIDEO_FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = input.capture_frame() => match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "video producer stopped");
                    break;
                }
            },
        };
        let chunk = Chunk::video(frame, sequence);
        sequence += 1;
        if chunk_tx.send(chunk).await.is_err() {
            break;
        }
    }
    tracing::debug!("video producer exited");
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic devices for engine tests.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::device::{
        AudioDeviceKind, AudioInput, DeviceBackend, PlaybackSink, VideoInput,
    };
    use crate::config::VideoMode;
    use crate::session::events::SessionError;

    /// Backend producing deterministic numbered chunks.
    pub struct FakeBackend {
        /// When set, `open_audio` fails with a device error.
        pub audio_unavailable: bool,
        /// Chunks each audio input yields before hanging.
        pub audio_chunks: usize,
        /// When set, audio inputs hang forever after their chunks run out
        /// instead of ending the stream.
        pub hang_after: bool,
    }

    impl Default for FakeBackend {
        fn default() -> Self {
            Self {
                audio_unavailable: false,
                audio_chunks: 3,
                hang_after: true,
            }
        }
    }

    impl DeviceBackend for FakeBackend {
        fn open_audio(
            &self,
            kind: AudioDeviceKind,
        ) -> Result<Box<dyn AudioInput>, SessionError> {
            if self.audio_unavailable {
                return Err(SessionError::device("no such device"));
            }
            let base = match kind {
                AudioDeviceKind::Microphone => 100,
                AudioDeviceKind::Loopback => 200,
            };
            Ok(Box::new(FakeAudioInput {
                base,
                remaining: self.audio_chunks,
                hang_after: self.hang_after,
                counter: AtomicUsize::new(0),
            }))
        }

        fn open_video(&self, _mode: VideoMode) -> Result<Box<dyn VideoInput>, SessionError> {
            Ok(Box::new(FakeVideoInput))
        }

        fn open_playback(&self) -> Result<Box<dyn PlaybackSink>, SessionError> {
            Ok(Box::new(NullPlayback))
        }
    }

    pub struct FakeAudioInput {
        base: i16,
        remaining: usize,
        hang_after: bool,
        counter: AtomicUsize,
    }

    #[async_trait]
    impl AudioInput for FakeAudioInput {
        async fn read_chunk(&mut self) -> Result<Vec<i16>, SessionError> {
            if self.remaining == 0 {
                if self.hang_after {
                    std::future::pending::<()>().await;
                }
                return Err(SessionError::device("stream ended"));
            }
            self.remaining -= 1;
            let n = self.counter.fetch_add(1, Ordering::Relaxed) as i16;
            Ok(vec![self.base + n; 4])
        }
    }

    pub struct FakeVideoInput;

    #[async_trait]
    impl VideoInput for FakeVideoInput {
        async fn capture_frame(&mut self) -> Result<Bytes, SessionError> {
            Ok(Bytes::from_static(b"\xff\xd8jpeg"))
        }
    }

    pub struct NullPlayback;

    #[async_trait]
    impl PlaybackSink for NullPlayback {
        async fn play(&mut self, _pcm: &[u8]) -> Result<(), SessionError> {
            Ok(())
        }
    }

    pub fn backend(backend: FakeBackend) -> Arc<dyn DeviceBackend> {
        Arc::new(backend)
    }
}
