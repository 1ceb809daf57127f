use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Generic configuration for initializing a live session with any provider.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// System instructions for the remote assistant.
    pub instructions: String,
    /// Local tools the remote assistant may invoke.
    pub tools: Vec<ToolDeclaration>,
}

/// Describes one callable tool to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's arguments.
    pub parameters: Value,
}

/// A structured action requested by the remote service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCallRequest {
    /// Remote-supplied identifier, echoed back on the response.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// The local result of a [`ToolCallRequest`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub name: String,
    pub result: Value,
}

/// Who a transcript line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

/// Generic events that any live provider can emit back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// A chunk of assistant speech: 16-bit little-endian PCM, mono, 24 kHz.
    Audio(Vec<u8>),
    /// One or more tool calls, to be answered in a single batch.
    ToolCalls(Vec<ToolCallRequest>),
    /// The remote service withdrew previously issued tool calls.
    ToolCallCancellation(Vec<String>),
    /// The user spoke over the assistant; pending playback must be flushed.
    Interrupted,
    /// A transcription of either side of the conversation.
    Transcript { speaker: Speaker, text: String },
    /// The assistant finished its turn.
    TurnComplete,
    /// The remote service will close the connection soon.
    GoAway { time_left: Option<String> },
    /// The connection was closed by the remote peer.
    Closed { reason: Option<String> },
    /// A transport-level failure.
    Error { message: String },
}

/// Events the session sends to the active provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Captured microphone audio: 16-bit little-endian PCM, mono, 16 kHz.
    Audio(Vec<u8>),
    /// Responses for one batch of tool calls, in request order.
    ToolResponses(Vec<ToolCallResponse>),
}
