//! Manages the lifecycle of a live voice session.
//!
//! [`LiveEngine`] is the surface a UI drives: `connect`, `disconnect` and an
//! observable state channel. Each `connect` spawns one session task that owns
//! the provider connection, the capture pipeline and playback. The task runs
//! until a local shutdown, a remote close or a transport failure, then tears
//! everything down before it exits, so at most one session ever holds the
//! audio devices.

use super::provider::{LiveConnection, LiveConnector};
use crate::{
    audio_utils::decode_pcm16,
    capture::CapturePipeline,
    config::Config,
    device::{AudioDevices, AudioOutput, SilentOutput},
    playback::Playback,
    state::{ConnectionState, EngineObservableState, EngineState},
};
use secrecy::SecretString;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, timeout},
};
use tracing::{Instrument, debug, error, info, info_span, warn};
use voiceboard_core::{
    board::TaskBoard,
    generic_types::{ClientEvent, LiveEvent, SessionConfig, Speaker},
    tools::ToolDispatcher,
};

/// How often the assistant-talking flag is re-evaluated against the clock.
pub const SCHEDULER_TICK: Duration = Duration::from_millis(50);

pub const CREDENTIAL_MISSING: &str = "credential missing";
pub const MICROPHONE_DENIED: &str = "microphone access denied";
pub const SPEAKER_UNAVAILABLE: &str = "audio output unavailable";
pub const CONNECTION_LOST: &str = "connection lost";

/// Extra time `disconnect` allows the session task beyond its own close wait.
const TEARDOWN_GRACE: Duration = Duration::from_millis(500);

/// The live audio session engine.
pub struct LiveEngine {
    config: Arc<Config>,
    connector: Arc<dyn LiveConnector>,
    devices: Arc<dyn AudioDevices>,
    dispatcher: ToolDispatcher,
    state: EngineState,
    active: Mutex<Option<ActiveSession>>,
    connect_lock: Mutex<()>,
    session_seq: AtomicU64,
}

struct ActiveSession {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl LiveEngine {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn LiveConnector>,
        devices: Arc<dyn AudioDevices>,
        board: Arc<dyn TaskBoard>,
    ) -> Self {
        Self {
            config,
            connector,
            devices,
            dispatcher: ToolDispatcher::new(board),
            state: EngineState::new(),
            active: Mutex::new(None),
            connect_lock: Mutex::new(()),
            session_seq: AtomicU64::new(0),
        }
    }

    /// A snapshot of the observable state.
    pub fn state(&self) -> EngineObservableState {
        self.state.snapshot()
    }

    /// Subscribes to observable state changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineObservableState> {
        self.state.subscribe()
    }

    /// Starts a new session, tearing down any previous one first.
    ///
    /// Suspends until the remote handshake completes, fails, or is cancelled
    /// by `disconnect`. Failures are reported through the observable state.
    pub async fn connect(&self) {
        let ready = {
            let _guard = self.connect_lock.lock().await;
            self.teardown_active().await;

            let Some(credential) = self.config.gemini_api_key.clone() else {
                warn!("Connect requested without a credential");
                self.state.fail(CREDENTIAL_MISSING);
                return;
            };

            // Held until the session is installed, so a `disconnect` that
            // observes `Connecting` always finds the session to cancel.
            let mut active = self.active.lock().await;
            self.state.update(|s| {
                s.phase = ConnectionState::Connecting;
                s.error = None;
            });

            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = SessionTask {
                config: self.config.clone(),
                connector: self.connector.clone(),
                devices: self.devices.clone(),
                dispatcher: self.dispatcher.clone(),
                state: self.state.clone(),
            };
            let session_id = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let span = info_span!("live_session", session_id);

            let handle = tokio::spawn(task.run(credential, shutdown_rx, ready_tx).instrument(span));
            *active = Some(ActiveSession {
                shutdown: shutdown_tx,
                handle,
            });
            ready_rx
        };

        // Dropped unanswered when the handshake fails or is cancelled.
        let _ = ready.await;
    }

    /// Ends the active session. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        self.teardown_active().await;
        self.state.reset_activity();
        self.state.update(|s| {
            if matches!(
                s.phase,
                ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing
            ) {
                s.phase = ConnectionState::Closed;
            }
        });
    }

    async fn teardown_active(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        info!("Disconnecting live session");
        let _ = active.shutdown.send(());

        let mut handle = active.handle;
        let budget = self.config.disconnect_timeout + TEARDOWN_GRACE;
        if timeout(budget, &mut handle).await.is_err() {
            warn!(?budget, "Session task did not finish in time; aborting it");
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Why the session loop stopped.
#[derive(Debug)]
enum Ending {
    Local,
    Remote(Option<String>),
    Failed(String),
}

/// Everything one session task needs, detached from the engine.
struct SessionTask {
    config: Arc<Config>,
    connector: Arc<dyn LiveConnector>,
    devices: Arc<dyn AudioDevices>,
    dispatcher: ToolDispatcher,
    state: EngineState,
}

impl SessionTask {
    async fn run(
        self,
        credential: SecretString,
        mut shutdown: oneshot::Receiver<()>,
        ready: oneshot::Sender<()>,
    ) {
        let session_config = SessionConfig {
            instructions: self.config.instructions.clone(),
            tools: ToolDispatcher::declarations(),
        };

        let result = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Connect cancelled before the handshake completed");
                self.state.reset_activity();
                self.state.update(|s| s.phase = ConnectionState::Closed);
                return;
            }
            result = self.connector.connect(&credential, session_config) => result,
        };
        let LiveConnection {
            outbound,
            mut inbound,
            mut handle,
        } = match result {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = ?e, "Live connection failed");
                self.state.fail(format!("{e:#}"));
                return;
            }
        };

        self.state.update(|s| {
            s.phase = ConnectionState::Open;
            s.connected = true;
            s.error = None;
        });
        info!("Live session open");

        let output: Arc<dyn AudioOutput> = match self.devices.open_speaker() {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Speaker unavailable; continuing without audible output");
                self.state.update(|s| s.error = Some(SPEAKER_UNAVAILABLE.to_string()));
                Arc::new(SilentOutput::new())
            }
        };
        let mut playback = Playback::new(output);

        let capture = match CapturePipeline::start(
            self.devices.as_ref(),
            self.config.capture_frame_samples,
            self.state.clone(),
            outbound.clone(),
        ) {
            Ok(capture) => Some(capture),
            Err(e) => {
                warn!(error = %e, "Microphone unavailable; session stays open for playback");
                // Keep an earlier speaker error visible alongside this one.
                self.state.update(|s| {
                    s.error = Some(match s.error.take() {
                        Some(earlier) => format!("{earlier}; {MICROPHONE_DENIED}"),
                        None => MICROPHONE_DENIED.to_string(),
                    })
                });
                None
            }
        };
        let _ = ready.send(());

        let mut tick = tokio::time::interval(SCHEDULER_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ending = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break Ending::Local,
                event = inbound.recv() => match event {
                    Some(event) => {
                        if let Some(ending) = self.handle_event(event, &mut playback, &outbound, &mut shutdown).await {
                            break ending;
                        }
                    }
                    None => break Ending::Failed(CONNECTION_LOST.to_string()),
                },
                _ = tick.tick() => {
                    let talking = playback.refresh();
                    self.state.update(|s| s.assistant_talking = talking);
                }
            }
        };

        // --- Teardown ---
        info!(?ending, "Live session ending");
        match &ending {
            Ending::Failed(message) => {
                error!(%message, "Live session failed");
                self.state.fail(message.clone());
            }
            Ending::Local | Ending::Remote(_) => self.state.update(|s| {
                s.phase = ConnectionState::Closing;
                s.connected = false;
                s.assistant_talking = false;
                s.user_talking = false;
            }),
        }

        if let Some(capture) = capture {
            capture.stop().await;
        }
        playback.close();

        // Dropping the last sender asks the provider to close the socket.
        drop(outbound);
        if timeout(
            self.config.disconnect_timeout,
            await_provider(&mut handle, &mut inbound),
        )
        .await
        .is_err()
        {
            warn!("Close acknowledgement timed out; aborting provider task");
            handle.abort();
        }

        self.state.reset_activity();
        if !matches!(ending, Ending::Failed(_)) {
            self.state.update(|s| s.phase = ConnectionState::Closed);
        }
        info!("Live session closed");
    }

    /// Applies one inbound event; returns `Some` when the session must end.
    ///
    /// A reply waiting on a full outbound queue still yields to `shutdown`.
    async fn handle_event(
        &self,
        event: LiveEvent,
        playback: &mut Playback,
        outbound: &mpsc::Sender<ClientEvent>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Option<Ending> {
        match event {
            LiveEvent::Audio(bytes) => match decode_pcm16(&bytes) {
                Ok(samples) => {
                    let talking = playback.enqueue(samples);
                    self.state.update(|s| s.assistant_talking = talking);
                }
                Err(e) => warn!(error = %e, "Dropping malformed audio frame"),
            },
            LiveEvent::ToolCalls(calls) => {
                let responses = self.dispatcher.dispatch_batch(&calls);
                info!(count = responses.len(), "Sending tool responses");
                tokio::select! {
                    biased;
                    _ = &mut *shutdown => return Some(Ending::Local),
                    sent = outbound.send(ClientEvent::ToolResponses(responses)) => {
                        if sent.is_err() {
                            return Some(Ending::Failed(CONNECTION_LOST.to_string()));
                        }
                    }
                }
            }
            LiveEvent::Interrupted => {
                info!("Assistant interrupted; flushing playback");
                playback.interrupt();
                self.state.update(|s| s.assistant_talking = false);
            }
            LiveEvent::ToolCallCancellation(ids) => {
                // Calls are executed synchronously, so there is nothing left to cancel.
                info!(?ids, "Remote withdrew tool calls that already ran");
            }
            LiveEvent::Transcript { speaker, text } => match speaker {
                Speaker::User => debug!(%text, "User transcript"),
                Speaker::Assistant => debug!(%text, "Assistant transcript"),
            },
            LiveEvent::TurnComplete => debug!("Assistant turn complete"),
            LiveEvent::GoAway { time_left } => {
                warn!(?time_left, "Remote service will close the session soon");
            }
            LiveEvent::Closed { reason } => return Some(Ending::Remote(reason)),
            LiveEvent::Error { message } => return Some(Ending::Failed(message)),
        }
        None
    }
}

/// Waits for the provider task, discarding late inbound events meanwhile.
async fn await_provider(handle: &mut JoinHandle<()>, inbound: &mut mpsc::Receiver<LiveEvent>) {
    let mut draining = true;
    loop {
        tokio::select! {
            _ = &mut *handle => return,
            event = inbound.recv(), if draining => match event {
                Some(LiveEvent::Closed { reason }) => debug!(?reason, "Close acknowledged"),
                Some(_) => {}
                None => draining = false,
            },
        }
    }
}
