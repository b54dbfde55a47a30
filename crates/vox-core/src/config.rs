//! Configuration for the engine and per-session settings.
//!
//! Engine-level settings load from `${VOX_HOME}/config.toml` with sensible
//! defaults. Per-session settings arrive over the bridge as a `SessionConfig`
//! record and are validated into a `ValidatedConfig` before a session starts;
//! a validated config is immutable for the session's lifetime.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::resources::{language_code, model_id, voice_id};
use crate::session::events::SessionError;

/// Outbound audio: 16 kHz mono signed-16-bit PCM.
pub const SEND_SAMPLE_RATE: u32 = 16_000;
/// Inbound assistant audio plays at 24 kHz.
pub const RECEIVE_SAMPLE_RATE: u32 = 24_000;
/// Samples per outbound audio chunk.
pub const AUDIO_CHUNK_SAMPLES: usize = 1_024;
/// Interval between captured video frames, independent of encode latency.
pub const VIDEO_FRAME_INTERVAL: Duration = Duration::from_secs(1);

/// Outbound multiplex queue depth (capture -> send loop).
pub const OUTBOUND_QUEUE_DEPTH: usize = 16;
/// Playback queue depth; overflow drops the oldest chunk.
pub const PLAYBACK_QUEUE_DEPTH: usize = 64;

/// Fixed delay between reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
/// Total retry window after an unexpected close before one terminal error.
pub const RECONNECT_WINDOW: Duration = Duration::from_secs(30);
/// Bound on joining all session tasks during stop; stragglers are aborted.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Cap on a single tool invocation.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);
/// Concurrent tool invocations.
pub const TOOL_WORKERS: usize = 4;

/// Default initial message announcing the call to the model.
pub const DEFAULT_INITIAL_MESSAGE: &str = "[CALL_START]";

/// Video input selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    #[default]
    None,
    Camera,
    Screen,
}

/// Audio input selection. `Both` mixes microphone and loopback into one
/// outbound audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
    None,
    #[default]
    Microphone,
    Computer,
    Both,
}

impl AudioSource {
    pub fn uses_microphone(self) -> bool {
        matches!(self, AudioSource::Microphone | AudioSource::Both)
    }

    pub fn uses_loopback(self) -> bool {
        matches!(self, AudioSource::Computer | AudioSource::Both)
    }
}

/// What the model answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

/// Per-session settings as received from a UI over the bridge.
///
/// Display names (language, voice, model) are resolved to wire identifiers
/// during validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub video_mode: VideoMode,
    pub audio_source: AudioSource,
    pub language: String,
    pub voice: String,
    pub response_modality: ResponseModality,
    pub system_prompt: String,
    pub model: String,
    pub initial_message: Option<String>,
    /// Record both sides of the conversation to a WAV file.
    pub record_conversation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            video_mode: VideoMode::None,
            audio_source: AudioSource::Microphone,
            language: "English (US)".to_string(),
            voice: "Leda (Female)".to_string(),
            response_modality: ResponseModality::Audio,
            system_prompt: String::new(),
            model: "Gemini 2.0 Flash Live".to_string(),
            initial_message: None,
            record_conversation: false,
        }
    }
}

/// A `SessionConfig` after validation, with display names resolved.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub video_mode: VideoMode,
    pub audio_source: AudioSource,
    pub language_code: String,
    pub voice_id: String,
    pub response_modality: ResponseModality,
    pub system_prompt: String,
    pub model_id: String,
    pub initial_message: Option<String>,
    pub record_conversation: bool,
}

impl SessionConfig {
    /// Validates settings and resolves display names to wire identifiers.
    ///
    /// # Errors
    /// Returns a config error for conflicting settings; unknown display
    /// names fall back to catalog defaults rather than failing.
    pub fn validate(&self) -> Result<ValidatedConfig, SessionError> {
        // Computer loopback would re-capture the assistant's own speech.
        if self.audio_source.uses_loopback()
            && self.response_modality == ResponseModality::Audio
        {
            return Err(SessionError::config(
                "computer audio input cannot be combined with audio output: \
                 this would create an audio feedback loop",
            ));
        }

        if self.audio_source == AudioSource::None && self.video_mode == VideoMode::None {
            tracing::debug!("session has no capture sources; text-only input");
        }

        let initial_message = match &self.initial_message {
            Some(msg) if msg.trim().is_empty() => None,
            Some(msg) => Some(msg.clone()),
            None => Some(DEFAULT_INITIAL_MESSAGE.to_string()),
        };

        Ok(ValidatedConfig {
            video_mode: self.video_mode,
            audio_source: self.audio_source,
            language_code: language_code(&self.language).to_string(),
            voice_id: voice_id(&self.voice).to_string(),
            response_modality: self.response_modality,
            system_prompt: self.system_prompt.clone(),
            model_id: model_id(&self.model).to_string(),
            initial_message,
            record_conversation: self.record_conversation,
        })
    }
}

/// Engine-level settings from `${VOX_HOME}/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bridge server bind address.
    pub bind_addr: String,
    /// Remote live endpoint base URL (WebSocket).
    pub endpoint: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads config from `${VOX_HOME}/config.toml`, defaulting when absent.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = vox_home().join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
    }

    /// Resolves the API key from the configured environment variable.
    ///
    /// # Errors
    /// Returns an error if the variable is unset or empty.
    pub fn api_key(&self) -> Result<String> {
        let key = std::env::var(&self.api_key_env)
            .with_context(|| format!("No API key available. Set {}.", self.api_key_env))?;
        let trimmed = key.trim();
        anyhow::ensure!(!trimmed.is_empty(), "{} is set but empty", self.api_key_env);
        Ok(trimmed.to_string())
    }
}

/// Root directory for engine state (config, recordings).
pub fn vox_home() -> PathBuf {
    if let Ok(home) = std::env::var("VOX_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vox")
}
