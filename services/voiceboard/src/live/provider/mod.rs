//! The seam between the session engine and a concrete live-audio service.

pub mod gemini;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use tokio::{sync::mpsc, task::JoinHandle};
use voiceboard_core::generic_types::{ClientEvent, LiveEvent, SessionConfig};

/// Depth of the provider's inbound and outbound event channels.
pub const CHANNEL_CAPACITY: usize = 128;

/// An established, handshaken connection to a live service.
///
/// Dropping `outbound` asks the provider to close gracefully; `handle`
/// finishes once the close is acknowledged or the socket is gone.
pub struct LiveConnection {
    pub outbound: mpsc::Sender<ClientEvent>,
    pub inbound: mpsc::Receiver<LiveEvent>,
    pub handle: JoinHandle<()>,
}

/// Opens connections to a live service.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Connects and completes the session handshake.
    ///
    /// Resolves only once the remote end has acknowledged `config`.
    async fn connect(
        &self,
        credential: &SecretString,
        config: SessionConfig,
    ) -> Result<LiveConnection>;
}
