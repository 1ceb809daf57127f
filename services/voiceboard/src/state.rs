//! Observable Engine State
//!
//! The small state surface a UI renders: connection phase, who is talking,
//! the microphone level and the last error. Consumers subscribe to a
//! `watch` channel and are woken only when a field actually changes.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

/// Everything a UI needs to render the engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineObservableState {
    pub phase: ConnectionState,
    pub connected: bool,
    pub assistant_talking: bool,
    pub user_talking: bool,
    /// Microphone loudness in [0, 1].
    pub user_audio_level: f32,
    pub error: Option<String>,
}

/// Shared, clonable handle to the observable state.
#[derive(Clone)]
pub struct EngineState {
    tx: Arc<watch::Sender<EngineObservableState>>,
}

impl EngineState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(EngineObservableState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineObservableState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> EngineObservableState {
        self.tx.borrow().clone()
    }

    /// Applies `f` and notifies subscribers if anything changed.
    pub fn update(&self, f: impl FnOnce(&mut EngineObservableState)) {
        self.tx.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    /// Moves to `Error`, recording `message` and dropping every live flag.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| {
            s.phase = ConnectionState::Error;
            s.error = Some(message);
            s.connected = false;
            s.assistant_talking = false;
            s.user_talking = false;
            s.user_audio_level = 0.0;
        });
    }

    /// Clears every live flag after a session has been torn down.
    pub fn reset_activity(&self) {
        self.update(|s| {
            s.connected = false;
            s.assistant_talking = false;
            s.user_talking = false;
            s.user_audio_level = 0.0;
        });
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}
