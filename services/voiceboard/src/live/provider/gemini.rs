//! Live connection to the Google Gemini Live API.

use super::{CHANNEL_CAPACITY, LiveConnection, LiveConnector};
use crate::audio_utils;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use gemini_realtime::{
    GeminiSink, GeminiSource, Message, parse_frame,
    protocol::{
        Blob, ClientMessage, Content, FunctionDeclaration, FunctionResponse, FunctionResult,
        GenerationConfig, INPUT_AUDIO_MIME_TYPE, Part, PrebuiltVoiceConfig, RealtimeInput,
        ResponseModality, ServerMessage, Setup, SpeechConfig, Tool, ToolResponse, VoiceConfig,
    },
    to_frame,
};
use secrecy::SecretString;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use voiceboard_core::generic_types::{
    ClientEvent, LiveEvent, SessionConfig, Speaker, ToolCallRequest,
};

/// Connects to Gemini Live with a fixed model and optional prebuilt voice.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    endpoint: String,
    model: String,
    voice: Option<String>,
}

impl GeminiConnector {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, voice: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            voice,
        }
    }

    /// Builds the `setup` message: audio responses, the system instruction
    /// and every local tool as a function declaration.
    pub fn build_setup(&self, config: SessionConfig) -> Setup {
        let speech_config = self.voice.as_ref().map(|voice| SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.clone(),
                },
            },
        });
        let system_instruction = (!config.instructions.trim().is_empty()).then(|| Content {
            role: None,
            parts: vec![Part {
                text: config.instructions,
            }],
        });
        let tools = if config.tools.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: config
                    .tools
                    .into_iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name,
                        description: t.description,
                        parameters_json_schema: t.parameters,
                    })
                    .collect(),
            }]
        };

        Setup {
            model: self.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config,
            },
            system_instruction,
            tools,
        }
    }
}

#[async_trait]
impl LiveConnector for GeminiConnector {
    async fn connect(
        &self,
        credential: &SecretString,
        config: SessionConfig,
    ) -> Result<LiveConnection> {
        let setup = self.build_setup(config);
        let (sink, source) = gemini_realtime::connect(&self.endpoint, credential, setup)
            .await
            .context("Gemini Live handshake failed")?;

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            tokio::join!(write_loop(sink, outbound_rx), read_loop(source, inbound_tx));
            info!("Gemini connection task finished.");
        });

        Ok(LiveConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
            handle,
        })
    }
}

/// Maps an outbound session event onto its Gemini client message.
pub fn to_client_message(event: ClientEvent) -> ClientMessage {
    match event {
        ClientEvent::Audio(pcm) => ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                mime_type: INPUT_AUDIO_MIME_TYPE.to_string(),
                data: audio_utils::encode_base64(&pcm),
            },
        }),
        ClientEvent::ToolResponses(responses) => ClientMessage::ToolResponse(ToolResponse {
            function_responses: responses
                .into_iter()
                .map(|r| FunctionResponse {
                    id: r.id,
                    name: r.name,
                    response: FunctionResult { result: r.result },
                })
                .collect(),
        }),
    }
}

/// Splits one server message into session events, in the order the session
/// must apply them.
///
/// An interruption always precedes audio carried by the same message, so
/// stale output is flushed before anything new is scheduled.
pub fn translate(msg: ServerMessage) -> Vec<LiveEvent> {
    let mut events = Vec::new();

    if let Some(content) = msg.server_content {
        if content.interrupted == Some(true) {
            events.push(LiveEvent::Interrupted);
        }
        if let Some(t) = content.input_transcription {
            events.push(LiveEvent::Transcript {
                speaker: Speaker::User,
                text: t.text,
            });
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    match audio_utils::decode_base64(&blob.data) {
                        Ok(pcm) => events.push(LiveEvent::Audio(pcm)),
                        Err(e) => warn!(error = %e, "Dropping undecodable audio part"),
                    }
                } else if let Some(text) = part.text {
                    debug!(%text, "Model text part");
                }
            }
        }
        if let Some(t) = content.output_transcription {
            events.push(LiveEvent::Transcript {
                speaker: Speaker::Assistant,
                text: t.text,
            });
        }
        if content.turn_complete == Some(true) {
            events.push(LiveEvent::TurnComplete);
        }
    }

    if let Some(call) = msg.tool_call.filter(|c| !c.function_calls.is_empty()) {
        events.push(LiveEvent::ToolCalls(
            call.function_calls
                .into_iter()
                .map(|c| ToolCallRequest {
                    id: c.id,
                    name: c.name,
                    args: c.args,
                })
                .collect(),
        ));
    }

    if let Some(cancellation) = msg.tool_call_cancellation {
        events.push(LiveEvent::ToolCallCancellation(cancellation.ids));
    }

    if let Some(go_away) = msg.go_away {
        events.push(LiveEvent::GoAway {
            time_left: go_away.time_left,
        });
    }

    events
}

async fn write_loop(mut sink: GeminiSink, mut outbound: mpsc::Receiver<ClientEvent>) {
    while let Some(event) = outbound.recv().await {
        let frame = match to_frame(&to_client_message(event)) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to serialize client message");
                continue;
            }
        };
        if let Err(e) = sink.send(frame).await {
            error!(error = %e, "Failed to send to Gemini; writer stops");
            return;
        }
    }

    debug!("Outbound channel closed; closing Gemini socket");
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!(error = %e, "Close frame not sent");
    }
}

async fn read_loop(mut source: GeminiSource, inbound: mpsc::Sender<LiveEvent>) {
    let last = loop {
        match source.next().await {
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty());
                info!(?reason, "Gemini closed the connection");
                break LiveEvent::Closed { reason };
            }
            Some(Ok(frame)) => match parse_frame(&frame) {
                Some(Ok(msg)) => {
                    for event in translate(msg) {
                        if inbound.send(event).await.is_err() {
                            debug!("Session stopped listening; reader stops");
                            return;
                        }
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Failed to parse Gemini message"),
                None => {}
            },
            Some(Err(e)) => {
                error!(error = %e, "Gemini WebSocket error");
                break LiveEvent::Error {
                    message: format!("connection lost: {e}"),
                };
            }
            None => break LiveEvent::Closed { reason: None },
        }
    };
    let _ = inbound.send(last).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use voiceboard_core::{generic_types::ToolCallResponse, tools::ToolDispatcher};

    fn server(value: serde_json::Value) -> ServerMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_setup_advertises_tools_and_voice() {
        let connector = GeminiConnector::new("wss://example", "models/test", Some("Puck".into()));
        let setup = connector.build_setup(SessionConfig {
            instructions: "Be brief.".into(),
            tools: ToolDispatcher::declarations(),
        });
        let json = serde_json::to_value(ClientMessage::Setup(setup)).unwrap();

        assert_eq!(json["setup"]["model"], "models/test");
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"],
            json!(["AUDIO"])
        );
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Puck"
        );
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
        let names: Vec<_> = json["setup"]["tools"][0]["functionDeclarations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["addTask", "markTaskComplete", "getExistingTasks"]);
    }

    #[test]
    fn test_setup_omits_empty_sections() {
        let connector = GeminiConnector::new("wss://example", "models/test", None);
        let json =
            serde_json::to_value(ClientMessage::Setup(connector.build_setup(SessionConfig::default())))
                .unwrap();
        assert!(json["setup"].get("tools").is_none());
        assert!(json["setup"].get("systemInstruction").is_none());
        assert!(json["setup"]["generationConfig"].get("speechConfig").is_none());
    }

    #[test]
    fn test_outbound_audio_is_base64_realtime_input() {
        let json = serde_json::to_value(to_client_message(ClientEvent::Audio(vec![1, 0, 255, 127])))
            .unwrap();
        assert_eq!(json["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(json["realtimeInput"]["audio"]["data"], "AQD/fw==");
    }

    #[test]
    fn test_outbound_tool_responses_keep_order() {
        let event = ClientEvent::ToolResponses(vec![
            ToolCallResponse {
                id: "a".into(),
                name: "addTask".into(),
                result: json!({"status": "success"}),
            },
            ToolCallResponse {
                id: "b".into(),
                name: "getExistingTasks".into(),
                result: json!({"tasks": []}),
            },
        ]);
        let json = serde_json::to_value(to_client_message(event)).unwrap();
        let responses = &json["toolResponse"]["functionResponses"];
        assert_eq!(responses[0]["id"], "a");
        assert_eq!(responses[0]["response"]["result"]["status"], "success");
        assert_eq!(responses[1]["id"], "b");
    }

    #[test]
    fn test_interrupt_precedes_audio() {
        let events = translate(server(json!({
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}}]},
                "interrupted": true
            }
        })));
        assert_eq!(
            events,
            vec![LiveEvent::Interrupted, LiveEvent::Audio(vec![0, 0])]
        );
    }

    #[test]
    fn test_bad_audio_is_dropped() {
        let events = translate(server(json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"data": "not base64!"}},
                    {"inlineData": {"data": "AAAAAA=="}}
                ]},
                "turnComplete": true
            }
        })));
        assert_eq!(
            events,
            vec![LiveEvent::Audio(vec![0, 0, 0, 0]), LiveEvent::TurnComplete]
        );
    }

    #[test]
    fn test_transcripts_and_control_messages() {
        let events = translate(server(json!({
            "serverContent": {
                "inputTranscription": {"text": "add milk"},
                "outputTranscription": {"text": "Added."}
            }
        })));
        assert_eq!(
            events,
            vec![
                LiveEvent::Transcript { speaker: Speaker::User, text: "add milk".into() },
                LiveEvent::Transcript { speaker: Speaker::Assistant, text: "Added.".into() },
            ]
        );

        let events = translate(server(json!({
            "toolCallCancellation": {"ids": ["c1"]},
            "goAway": {"timeLeft": "10s"}
        })));
        assert_eq!(
            events,
            vec![
                LiveEvent::ToolCallCancellation(vec!["c1".into()]),
                LiveEvent::GoAway { time_left: Some("10s".into()) },
            ]
        );
    }

    #[test]
    fn test_tool_calls_become_one_batch() {
        let events = translate(server(json!({
            "toolCall": {"functionCalls": [
                {"id": "1", "name": "addTask", "args": {"title": "Buy milk"}},
                {"id": "2", "name": "getExistingTasks"}
            ]}
        })));
        let [LiveEvent::ToolCalls(calls)] = events.as_slice() else {
            panic!("expected one tool batch, got {events:?}");
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "1");
        assert_eq!(calls[0].args["title"], "Buy milk");
        assert_eq!(calls[1].name, "getExistingTasks");
        assert!(calls[1].args.is_empty());
    }

    #[test]
    fn test_setup_complete_alone_yields_nothing() {
        assert!(translate(server(json!({"setupComplete": {}}))).is_empty());
    }
}
