//! JSON framing for the live conversational API.
//!
//! ```text
//! client -> server   {"setup": {...}}                      once, first
//! client -> server   {"realtimeInput": {"mediaChunks": [...]}}
//! server -> client   {"setupComplete": {}}
//! server -> client   {"serverContent": {"modelTurn": {...}, "interrupted": bool, ...}}
//! server -> client   {"goAway": {"timeLeft": "..."}}
//! ```

use serde::{Deserialize, Serialize};

use crate::audio::codec::WireFrame;
use crate::error::{ParleyError, Result};

use super::transport::SessionSetup;

/// Audio exactly as the server sent it: a MIME type and base64 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedAudio {
    pub mime_type: String,
    pub data: String,
}

/// What an inbound message means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Setup acknowledged.
    Ready,
    Audio(Vec<EncodedAudio>),
    Interrupted,
    /// The server is about to drop the connection.
    GoAway(String),
}

#[derive(Serialize)]
struct SetupEnvelope<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [Modality; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum Modality {
    Audio,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputEnvelope {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: [EncodedAudio; 1],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<InboundPart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundPart {
    inline_data: Option<EncodedAudio>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// The first message on a new connection.
pub fn setup_message(setup: &SessionSetup) -> Result<String> {
    let system_instruction = (!setup.system_instruction.is_empty()).then(|| Content {
        parts: [TextPart {
            text: &setup.system_instruction,
        }],
    });

    let envelope = SetupEnvelope {
        setup: Setup {
            model: &setup.model,
            generation_config: GenerationConfig {
                response_modalities: [Modality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: &setup.voice,
                        },
                    },
                },
            },
            system_instruction,
        },
    };

    serde_json::to_string(&envelope)
        .map_err(|e| ParleyError::Transport(format!("failed to encode setup message: {e}")))
}

/// Wrap one captured frame as a realtime-input message.
pub fn realtime_input_message(frame: &WireFrame) -> Result<String> {
    let envelope = RealtimeInputEnvelope {
        realtime_input: RealtimeInput {
            media_chunks: [EncodedAudio {
                mime_type: frame.mime_type(),
                data: frame.to_transport(),
            }],
        },
    };

    serde_json::to_string(&envelope)
        .map_err(|e| ParleyError::Transport(format!("failed to encode audio message: {e}")))
}

/// Classify one inbound message. `None` means the message carries nothing the
/// session acts on (turn boundaries, transcripts, usage reports).
pub fn classify(payload: &[u8]) -> Result<Option<ServerEvent>> {
    let message: ServerMessage = serde_json::from_slice(payload)
        .map_err(|e| ParleyError::Transport(format!("undecodable server message: {e}")))?;

    if let Some(content) = message.server_content {
        if content.interrupted {
            return Ok(Some(ServerEvent::Interrupted));
        }

        let audio: Vec<EncodedAudio> = content
            .model_turn
            .map(|turn| turn.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p.inline_data)
            .filter(|d| d.mime_type.starts_with("audio/"))
            .collect();

        if !audio.is_empty() {
            return Ok(Some(ServerEvent::Audio(audio)));
        }

        if content.turn_complete {
            tracing::debug!("model turn complete");
        }
        return Ok(None);
    }

    if message.setup_complete.is_some() {
        return Ok(Some(ServerEvent::Ready));
    }

    if let Some(go_away) = message.go_away {
        let reason = go_away.time_left.map_or_else(
            || "server is going away".to_string(),
            |t| format!("server is going away in {t}"),
        );
        return Ok(Some(ServerEvent::GoAway(reason)));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "models/test".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "Be helpful.".to_string(),
        }
    }

    #[test]
    fn setup_message_shape() {
        let json = setup_message(&setup()).unwrap_or_else(|e| panic!("{e}"));
        let value: serde_json::Value =
            serde_json::from_str(&json).unwrap_or_else(|e| panic!("{e}"));
        let s = &value["setup"];
        assert_eq!(s["model"], "models/test");
        assert_eq!(s["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            s["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(s["systemInstruction"]["parts"][0]["text"], "Be helpful.");
    }

    #[test]
    fn setup_message_omits_empty_instruction() {
        let mut s = setup();
        s.system_instruction.clear();
        let json = setup_message(&s).unwrap_or_else(|e| panic!("{e}"));
        assert!(!json.contains("systemInstruction"));
    }

    #[test]
    fn realtime_input_shape() {
        let frame = WireFrame::new(vec![1, 2, 3, 4], 16000);
        let json = realtime_input_message(&frame).unwrap_or_else(|e| panic!("{e}"));
        let value: serde_json::Value =
            serde_json::from_str(&json).unwrap_or_else(|e| panic!("{e}"));
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AQIDBA==");
    }

    #[test]
    fn classifies_setup_complete() {
        let event = classify(br#"{"setupComplete": {}}"#).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(event, Some(ServerEvent::Ready));
    }

    #[test]
    fn classifies_audio_delta() {
        let msg = br#"{"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}}
        ]}}}"#;
        let event = classify(msg).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            event,
            Some(ServerEvent::Audio(vec![EncodedAudio {
                mime_type: "audio/pcm;rate=24000".to_string(),
                data: "AAA=".to_string(),
            }]))
        );
    }

    #[test]
    fn interruption_takes_precedence() {
        let msg = br#"{"serverContent": {"interrupted": true, "modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}}
        ]}}}"#;
        assert_eq!(
            classify(msg).unwrap_or_else(|e| panic!("{e}")),
            Some(ServerEvent::Interrupted)
        );
    }

    #[test]
    fn text_parts_and_turn_complete_are_ignored() {
        let msg = br#"{"serverContent": {"modelTurn": {"parts": [{"text": "hi"}]}}}"#;
        assert_eq!(classify(msg).unwrap_or_else(|e| panic!("{e}")), None);
        let msg = br#"{"serverContent": {"turnComplete": true}}"#;
        assert_eq!(classify(msg).unwrap_or_else(|e| panic!("{e}")), None);
        let msg = br#"{"usageMetadata": {"totalTokenCount": 12}}"#;
        assert_eq!(classify(msg).unwrap_or_else(|e| panic!("{e}")), None);
    }

    #[test]
    fn classifies_go_away() {
        let msg = br#"{"goAway": {"timeLeft": "10s"}}"#;
        assert_eq!(
            classify(msg).unwrap_or_else(|e| panic!("{e}")),
            Some(ServerEvent::GoAway("server is going away in 10s".to_string()))
        );
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            classify(b"\x00\x01binary"),
            Err(ParleyError::Transport(_))
        ));
    }
}
