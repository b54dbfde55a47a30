//! Static catalogs and the `get_resources` snapshot.
//!
//! Display names are what UIs show and send back in a start command; the
//! lookup helpers here resolve them to wire identifiers with catalog
//! defaults for unknown names.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Display name -> BCP-47 language code.
pub const LANGUAGES: &[(&str, &str)] = &[
    ("English (US)", "en-US"),
    ("English (UK)", "en-GB"),
    ("German (DE)", "de-DE"),
    ("French (FR)", "fr-FR"),
    ("Spanish (ES)", "es-ES"),
    ("Italian (IT)", "it-IT"),
    ("Japanese (JP)", "ja-JP"),
    ("Korean (KR)", "ko-KR"),
    ("Chinese (CN)", "cmn-CN"),
];

/// Display name -> prebuilt voice id.
pub const VOICES: &[(&str, &str)] = &[
    ("Leda (Female)", "Leda"),
    ("Kore (Female)", "Kore"),
    ("Zephyr (Female)", "Zephyr"),
    ("Puck (Male)", "Puck"),
    ("Charon (Male)", "Charon"),
    ("Fenrir (Male)", "Fenrir"),
    ("Orus (Male)", "Orus"),
];

/// Display name -> live model id.
pub const MODELS: &[(&str, &str)] = &[
    ("Gemini 2.0 Flash Live", "models/gemini-2.0-flash-live-001"),
    ("Gemini 2.5 Flash Live", "models/gemini-2.5-flash-live-preview"),
];

pub const AUDIO_SOURCES: &[&str] = &["none", "microphone", "computer", "both"];
pub const VIDEO_MODES: &[&str] = &["none", "camera", "screen"];
pub const RESPONSE_MODALITIES: &[&str] = &["TEXT", "AUDIO"];

fn lookup<'a>(table: &'a [(&'a str, &'a str)], display: &str) -> Option<&'a str> {
    table
        .iter()
        .find(|(name, _)| *name == display)
        .map(|(_, id)| *id)
}

/// Resolves a language display name, defaulting to `en-US`.
pub fn language_code(display: &str) -> &str {
    lookup(LANGUAGES, display).unwrap_or("en-US")
}

/// Resolves a voice display name, defaulting to `Leda`.
pub fn voice_id(display: &str) -> &str {
    lookup(VOICES, display).unwrap_or("Leda")
}

/// Resolves a model display name, defaulting to the first catalog entry.
pub fn model_id(display: &str) -> &str {
    lookup(MODELS, display).unwrap_or(MODELS[0].1)
}

/// Supplies the system-prompt catalog. Prompt file discovery lives outside
/// the engine; the bridge only needs identifiers grouped by category.
pub trait PromptSource: Send + Sync {
    /// Category -> prompt identifiers.
    fn catalog(&self) -> BTreeMap<String, Vec<String>>;
}

/// Empty prompt catalog for deployments without prompt assets.
#[derive(Debug, Default)]
pub struct NoPrompts;

impl PromptSource for NoPrompts {
    fn catalog(&self) -> BTreeMap<String, Vec<String>> {
        BTreeMap::new()
    }
}

/// The `resources.resources` record sent to UIs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCatalog {
    pub system_prompts: BTreeMap<String, Vec<String>>,
    pub languages: Vec<String>,
    pub voices: Vec<String>,
    pub audio_sources: Vec<String>,
    pub video_modes: Vec<String>,
    pub response_modalities: Vec<String>,
    pub models: Vec<String>,
    pub available_channels: Vec<String>,
}

impl ResourceCatalog {
    /// Builds one immutable snapshot of everything a UI can select from.
    pub fn snapshot(prompts: &Arc<dyn PromptSource>, channels: Vec<String>) -> Self {
        Self {
            system_prompts: prompts.catalog(),
            languages: LANGUAGES.iter().map(|(name, _)| (*name).to_string()).collect(),
            voices: VOICES.iter().map(|(name, _)| (*name).to_string()).collect(),
            audio_sources: AUDIO_SOURCES.iter().map(|s| (*s).to_string()).collect(),
            video_modes: VIDEO_MODES.iter().map(|s| (*s).to_string()).collect(),
            response_modalities: RESPONSE_MODALITIES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            models: MODELS.iter().map(|(name, _)| (*name).to_string()).collect(),
            available_channels: channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_defaults() {
        assert_eq!(language_code("Japanese (JP)"), "ja-JP");
        assert_eq!(language_code("Klingon"), "en-US");
        assert_eq!(voice_id("Orus (Male)"), "Orus");
        assert_eq!(voice_id("nobody"), "Leda");
        assert_eq!(model_id("not a model"), MODELS[0].1);
    }

    #[test]
    fn test_snapshot_is_stable() {
        let prompts: Arc<dyn PromptSource> = Arc::new(NoPrompts);
        let channels = vec!["conversation".to_string(), "logs".to_string()];
        let a = ResourceCatalog::snapshot(&prompts, channels.clone());
        let b = ResourceCatalog::snapshot(&prompts, channels);
        assert_eq!(a, b);
        assert_eq!(a.languages.len(), LANGUAGES.len());
        assert_eq!(a.voices.len(), VOICES.len());
    }
}
