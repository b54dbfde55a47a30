//! Wire codec for the remote live endpoint.
//!
//! Frames are JSON text messages. Outbound frames are built from chunks and
//! tool results; inbound frames decode into `InboundEvent`s. A malformed
//! inbound frame is a protocol error the caller logs and drops; it never
//! ends the session.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{ResponseModality, ValidatedConfig};
use crate::session::events::{Chunk, ChunkPayload, InboundEvent, SessionError};
use crate::tools::{ToolDeclaration, ToolResult};

/// One outbound frame toward the remote endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ClientFrame {
    Setup {
        setup: Setup,
    },
    Realtime {
        #[serde(rename = "realtimeInput")]
        realtime_input: RealtimeInput,
    },
    Content {
        #[serde(rename = "clientContent")]
        client_content: ClientContent,
    },
    ToolResponse {
        #[serde(rename = "toolResponse")]
        tool_response: ToolResponsePayload,
    },
}

/// Session setup: sent once per (re)connect before any chunk flows.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolsEntry>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
    pub language_code: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolsEntry {
    pub function_declarations: Vec<ToolDeclaration>,
}

/// Streaming media input (audio PCM or encoded video frames).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaBlob>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub mime_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

/// Typed user input, delimiting a turn.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponsePayload {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// Builds the setup frame for a validated config and tool declarations.
pub fn setup_frame(config: &ValidatedConfig, declarations: Vec<ToolDeclaration>) -> ClientFrame {
    let modality = match config.response_modality {
        ResponseModality::Audio => "AUDIO",
        ResponseModality::Text => "TEXT",
    };
    let speech_config = match config.response_modality {
        ResponseModality::Audio => Some(SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: config.voice_id.clone(),
                },
            },
            language_code: config.language_code.clone(),
        }),
        ResponseModality::Text => None,
    };
    let system_instruction = if config.system_prompt.trim().is_empty() {
        None
    } else {
        Some(Content {
            parts: vec![TextPart {
                text: config.system_prompt.clone(),
            }],
        })
    };
    let tools = if declarations.is_empty() {
        Vec::new()
    } else {
        vec![ToolsEntry {
            function_declarations: declarations,
        }]
    };

    ClientFrame::Setup {
        setup: Setup {
            model: config.model_id.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![modality.to_string()],
                speech_config,
            },
            system_instruction,
            tools,
        },
    }
}

/// Converts one outbound chunk to its wire frame.
///
/// Media chunks stream as realtime input; typed text closes a turn.
pub fn chunk_frame(chunk: &Chunk) -> ClientFrame {
    match &chunk.payload {
        ChunkPayload::Text(text) => ClientFrame::Content {
            client_content: ClientContent {
                turns: vec![Turn {
                    role: "user".to_string(),
                    parts: vec![TextPart { text: text.clone() }],
                }],
                turn_complete: true,
            },
        },
        ChunkPayload::Binary(bytes) => ClientFrame::Realtime {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaBlob {
                    mime_type: chunk.mime_type.clone(),
                    data: BASE64.encode(bytes),
                }],
            },
        },
    }
}

/// Wraps tool results in a tool-response frame.
pub fn tool_response_frame(results: &[ToolResult]) -> ClientFrame {
    ClientFrame::ToolResponse {
        tool_response: ToolResponsePayload {
            function_responses: results
                .iter()
                .map(|result| FunctionResponse {
                    id: result.call_id.clone(),
                    name: result.name.clone(),
                    response: result.response_payload(),
                })
                .collect(),
        },
    }
}

/// Serializes one outbound frame.
pub fn encode(frame: &ClientFrame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string())
}

// Inbound frame shapes. The endpoint sends one top-level key per frame.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerFrame {
    setup_complete: Option<Value>,
    server_content: Option<RawServerContent>,
    tool_call: Option<RawToolCall>,
    go_away: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    model_turn: Option<RawTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct RawTurn {
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    text: Option<String>,
    inline_data: Option<RawBlob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlob {
    #[allow(dead_code)]
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolCall {
    #[serde(default)]
    function_calls: Vec<RawFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct RawFunctionCall {
    id: Option<String>,
    name: String,
    args: Option<Value>,
}

/// Decodes one inbound text frame into zero or more events.
///
/// # Errors
/// Returns a protocol error for unparseable or unrecognized frames; the
/// caller logs and drops them.
pub fn decode(text: &str) -> Result<Vec<InboundEvent>, SessionError> {
    let raw: RawServerFrame = serde_json::from_str(text).map_err(|e| {
        SessionError::protocol("malformed inbound frame").with_details(e.to_string())
    })?;

    if raw.setup_complete.is_some() {
        return Ok(Vec::new());
    }

    if let Some(content) = raw.server_content {
        let mut events = Vec::new();
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text {
                    events.push(InboundEvent::TextOut {
                        channel: crate::channels::CONVERSATION_CHANNEL.to_string(),
                        text,
                    });
                }
                if let Some(blob) = part.inline_data {
                    let pcm = BASE64.decode(blob.data.as_bytes()).map_err(|e| {
                        SessionError::protocol("invalid base64 in inline data")
                            .with_details(e.to_string())
                    })?;
                    events.push(InboundEvent::AudioOut {
                        pcm: Bytes::from(pcm),
                    });
                }
            }
        }
        if content.interrupted {
            events.push(InboundEvent::Interruption);
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
        return Ok(events);
    }

    if let Some(tool_call) = raw.tool_call {
        return Ok(tool_call
            .function_calls
            .into_iter()
            .map(|call| InboundEvent::ToolCallRequest {
                call_id: call.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                name: call.name,
                args: call.args.unwrap_or(Value::Null),
            })
            .collect());
    }

    if raw.go_away.is_some() {
        // Advisory: the server will close shortly; the close frame itself
        // drives reconnection.
        tracing::debug!("server announced impending close");
        return Ok(Vec::new());
    }

    Err(SessionError::protocol("unrecognized inbound frame").with_details(text.to_string()))
}
