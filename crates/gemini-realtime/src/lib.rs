//! Minimal client for the Gemini Live bidirectional streaming API.

pub mod client;
pub mod protocol;

pub use client::{DEFAULT_ENDPOINT, GeminiSink, GeminiSource, connect, parse_frame, to_frame};
pub use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
