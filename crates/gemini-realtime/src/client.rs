use crate::protocol::{ClientMessage, ServerMessage, Setup};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, info, warn};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub type GeminiStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type GeminiSink = SplitSink<GeminiStream, Message>;
pub type GeminiSource = SplitStream<GeminiStream>;

/// Serializes a client message into a text frame.
pub fn to_frame(msg: &ClientMessage) -> Result<Message> {
    Ok(Message::Text(serde_json::to_string(msg)?.into()))
}

/// Parses a server frame. Gemini sends JSON in both text and binary frames;
/// control frames yield `None`.
pub fn parse_frame(frame: &Message) -> Option<Result<ServerMessage>> {
    match frame {
        Message::Text(text) => Some(serde_json::from_str(text).map_err(Into::into)),
        Message::Binary(data) => Some(serde_json::from_slice(data).map_err(Into::into)),
        _ => None,
    }
}

/// Connects to the Live API and completes the setup handshake.
///
/// Resolves only once the server has acknowledged the `setup` message, so the
/// returned halves are ready for bidirectional streaming.
pub async fn connect(
    endpoint: &str,
    api_key: &SecretString,
    setup: Setup,
) -> Result<(GeminiSink, GeminiSource)> {
    let url = format!("{}?key={}", endpoint, api_key.expose_secret());
    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect to Gemini Live WebSocket")?;
    info!(model = %setup.model, "Connected to Gemini Live WebSocket.");
    let (mut tx, mut rx) = ws_stream.split();

    tx.send(to_frame(&ClientMessage::Setup(setup))?)
        .await
        .context("Failed to send setup message")?;

    while let Some(frame) = rx.next().await {
        let frame = frame.context("Error reading from Gemini WebSocket during setup")?;
        if let Message::Close(close_frame) = &frame {
            let reason = close_frame
                .as_ref()
                .map(|c| c.reason.to_string())
                .unwrap_or_default();
            bail!("Gemini closed the connection during setup: {}", reason);
        }
        match parse_frame(&frame) {
            Some(Ok(msg)) if msg.setup_complete.is_some() => {
                info!("Gemini session setup is complete.");
                return Ok((tx, rx));
            }
            Some(Ok(msg)) => debug!(?msg, "Ignoring message received before setup completed"),
            Some(Err(e)) => warn!(error = %e, "Failed to parse Gemini message during setup"),
            None => {}
        }
    }

    Err(anyhow!("Gemini WebSocket ended before setup completed"))
}
