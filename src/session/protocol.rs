//! Messages exchanged with the remote model
//!
//! Only the subset the client acts on is modelled. Unknown server fields are
//! ignored so that protocol additions do not break parsing.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::audio::AudioChunk;
use crate::config::{InstructionTable, SessionConfig};

/// Close code for a clean shutdown
pub const NORMAL_CLOSURE: u16 = 1000;

/// Why a connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    /// Clean closure with no reason
    #[must_use]
    pub fn normal() -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: String::new(),
        }
    }

    /// Whether this closure was requested and clean
    #[must_use]
    pub const fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// Output modality requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

/// First message on every connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    pub system_instruction: String,
    pub voice: String,
    pub speaking_rate: f32,
    pub language: String,
    pub response_modalities: Vec<Modality>,
}

impl SessionSetup {
    /// Build the setup for a configuration, resolving its instruction
    #[must_use]
    pub fn from_config(config: &SessionConfig, instructions: &InstructionTable) -> Self {
        Self {
            model: config.model.clone(),
            system_instruction: instructions.resolve(&config.language).to_string(),
            voice: config.voice.clone(),
            speaking_rate: config.speaking_rate,
            language: config.language.clone(),
            response_modalities: vec![Modality::Audio],
        }
    }
}

/// Outbound message
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Setup(SessionSetup),
    Audio(AudioChunk),
    Text(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum WireClient<'a> {
    Setup(WireSetup<'a>),
    RealtimeInput(WireRealtimeInput<'a>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireSetup<'a> {
    model: String,
    generation_config: WireGenerationConfig<'a>,
    system_instruction: WireContent<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig<'a> {
    response_modalities: &'a [Modality],
    speech_config: WireSpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireSpeechConfig<'a> {
    voice_config: WireVoiceConfig<'a>,
    language_code: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireVoiceConfig<'a> {
    prebuilt_voice_config: WirePrebuiltVoice<'a>,
    speaking_rate: f32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct WireContent<'a> {
    parts: [WireText<'a>; 1],
}

#[derive(Serialize)]
struct WireText<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum WireRealtimeInput<'a> {
    #[serde(rename = "mediaChunks")]
    Media([WireBlob<'a>; 1]),
    Text(&'a str),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireBlob<'a> {
    mime_type: String,
    data: &'a str,
}

impl ClientMessage {
    /// Serialize to the live API's JSON shape
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails
    pub fn to_json(&self) -> Result<String> {
        let wire = match self {
            Self::Setup(setup) => WireClient::Setup(WireSetup {
                model: if setup.model.starts_with("models/") {
                    setup.model.clone()
                } else {
                    format!("models/{}", setup.model)
                },
                generation_config: WireGenerationConfig {
                    response_modalities: &setup.response_modalities,
                    speech_config: WireSpeechConfig {
                        voice_config: WireVoiceConfig {
                            prebuilt_voice_config: WirePrebuiltVoice {
                                voice_name: &setup.voice,
                            },
                            speaking_rate: setup.speaking_rate,
                        },
                        language_code: &setup.language,
                    },
                },
                system_instruction: WireContent {
                    parts: [WireText {
                        text: &setup.system_instruction,
                    }],
                },
            }),
            Self::Audio(chunk) => WireClient::RealtimeInput(WireRealtimeInput::Media([WireBlob {
                mime_type: chunk.mime_type(),
                data: &chunk.data,
            }])),
            Self::Text(text) => WireClient::RealtimeInput(WireRealtimeInput::Text(text)),
        };

        Ok(serde_json::to_string(&wire)?)
    }
}

/// Inbound message, reduced to what the client acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// A chunk of synthesized speech
    Audio(AudioChunk),
    /// The user barged in; pending speech must stop
    Interrupted,
    TurnComplete,
    SetupComplete,
    /// Valid JSON with nothing the client handles
    Ignored,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServer {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<WireServerContent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServerContent {
    #[serde(default)]
    model_turn: Option<WireModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Deserialize)]
struct WireModelTurn {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default)]
    inline_data: Option<WireInlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    data: String,
    #[serde(default)]
    mime_type: String,
}

impl ServerMessage {
    /// Parse one server frame into the events it carries, in order
    ///
    /// Audio parts come first, then an interruption, then turn completion.
    /// A frame with none of these yields a single [`ServerMessage::Ignored`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed JSON
    pub fn parse(json: &str) -> Result<Vec<Self>> {
        let wire: WireServer = serde_json::from_str(json)?;
        let mut messages = Vec::new();

        if wire.setup_complete.is_some() {
            messages.push(Self::SetupComplete);
        }

        if let Some(content) = wire.server_content {
            if let Some(turn) = content.model_turn {
                messages.extend(turn.parts.into_iter().filter_map(|part| {
                    part.inline_data
                        .map(|d| Self::Audio(AudioChunk::from_mime(d.data, &d.mime_type)))
                }));
            }
            if content.interrupted {
                messages.push(Self::Interrupted);
            }
            if content.turn_complete {
                messages.push(Self::TurnComplete);
            }
        }

        if messages.is_empty() {
            messages.push(Self::Ignored);
        }
        Ok(messages)
    }
}
