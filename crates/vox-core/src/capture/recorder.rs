//! Optional WAV recording of both sides of a conversation.
//!
//! Outbound capture audio and inbound assistant audio are appended to one
//! mono 16 kHz file under `${VOX_HOME}/recordings`; inbound audio is
//! resampled down from the receive rate first.

use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use hound::{SampleFormat, WavSpec, WavWriter};

use crate::config::{RECEIVE_SAMPLE_RATE, SEND_SAMPLE_RATE, vox_home};

pub struct Recorder {
    writer: Mutex<Option<WavWriter<BufWriter<fs::File>>>>,
    path: PathBuf,
}

impl Recorder {
    /// Creates a timestamped recording file.
    ///
    /// # Errors
    /// Returns an error if the recordings directory or file cannot be
    /// created.
    pub fn create() -> Result<Self> {
        let dir = vox_home().join("recordings");
        fs::create_dir_all(&dir)
            .with_context(|| format!("create recordings dir {}", dir.display()))?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("conversation_{stamp}.wav"));
        let spec = WavSpec {
            channels: 1,
            sample_rate: SEND_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)
            .with_context(|| format!("create recording file {}", path.display()))?;
        tracing::info!(path = %path.display(), "recording conversation");
        Ok(Self {
            writer: Mutex::new(Some(writer)),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Appends captured (already 16 kHz) samples.
    pub fn write_outbound(&self, samples: &[i16]) {
        let mut guard = self.writer.lock().expect("recorder poisoned");
        if let Some(writer) = guard.as_mut() {
            for sample in samples {
                if writer.write_sample(*sample).is_err() {
                    tracing::warn!("recording write failed, disabling recorder");
                    *guard = None;
                    return;
                }
            }
        }
    }

    /// Appends assistant audio (little-endian PCM at the receive rate),
    /// resampling down to the file rate.
    pub fn write_inbound(&self, pcm: &[u8]) {
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let resampled = resample(&samples, RECEIVE_SAMPLE_RATE, SEND_SAMPLE_RATE);
        self.write_outbound(&resampled);
    }

    /// Flushes and closes the file. Further writes are ignored.
    ///
    /// # Errors
    /// Returns an error if finalizing the WAV header fails.
    pub fn finalize(&self) -> Result<PathBuf> {
        let writer = self.writer.lock().expect("recorder poisoned").take();
        if let Some(writer) = writer {
            writer.finalize().context("finalize recording")?;
            tracing::info!(path = %self.path.display(), "recording saved");
        }
        Ok(self.path.clone())
    }
}

/// Nearest-sample rate conversion. Good enough for conversation logs.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize;
    (0..out_len)
        .map(|i| {
            let src = (i as u64 * u64::from(from_rate) / u64::from(to_rate)) as usize;
            samples[src.min(samples.len() - 1)]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let samples = vec![1, 2, 3, 4];
        assert_eq!(resample(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<i16> = (0..100).collect();
        let out = resample(&samples, 32_000, 16_000);
        assert_eq!(out.len(), 50);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 2);
    }

    #[test]
    fn test_resample_24k_to_16k() {
        let samples: Vec<i16> = (0..24_000).map(|i| (i % 1000) as i16).collect();
        let out = resample(&samples, 24_000, 16_000);
        assert_eq!(out.len(), 16_000);
    }

    #[test]
    fn test_recorder_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: test process owns its environment.
        unsafe { std::env::set_var("VOX_HOME", dir.path()) };
        let recorder = Recorder::create().unwrap();
        recorder.write_outbound(&[1, 2, 3, 4]);
        let path = recorder.finalize().unwrap();

        let reader = hound::WavReader::open(path).unwrap();
        assert_eq!(reader.spec().sample_rate, SEND_SAMPLE_RATE);
        let read: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert_eq!(read, vec![1, 2, 3, 4]);
        unsafe { std::env::remove_var("VOX_HOME") };
    }
}
