//! Main Entrypoint for the Voiceboard CLI
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Seeding the in-memory task board.
//! 4. Running one live session on the default audio devices until Ctrl+C or
//!    until the session ends on its own.
//! 5. Printing the final board as JSON.

use anyhow::Context;
use clap::Parser;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};
use voiceboard::{
    config::Config,
    device::CpalDevices,
    live::{LiveEngine, provider::gemini::GeminiConnector},
    state::{ConnectionState, EngineObservableState},
};
use voiceboard_core::{
    board::{MemoryTaskBoard, TaskBoard},
    task::Task,
};

#[derive(Parser, Debug)]
#[command(version, about = "Talk to a live voice assistant that keeps your task board.")]
struct Cli {
    /// JSON file holding an array of tasks to seed the board with.
    #[arg(long, value_name = "FILE")]
    tasks: Option<PathBuf>,
}

fn load_tasks(path: &Path) -> anyhow::Result<Vec<Task>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tasks file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse tasks file {}", path.display()))
}

/// Logs every state change until the session reaches a terminal phase.
async fn follow_state(
    mut states: tokio::sync::watch::Receiver<EngineObservableState>,
) -> EngineObservableState {
    let mut last_phase = None;
    loop {
        let state = states.borrow_and_update().clone();
        if last_phase != Some(state.phase) {
            info!(phase = ?state.phase, error = ?state.error, "Session phase changed");
            last_phase = Some(state.phase);
        }
        debug!(
            connected = state.connected,
            assistant_talking = state.assistant_talking,
            user_talking = state.user_talking,
            level = state.user_audio_level,
            "Engine state"
        );
        if matches!(state.phase, ConnectionState::Closed | ConnectionState::Error) {
            return state;
        }
        if states.changed().await.is_err() {
            return state;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing voice session...");

    // --- 3. Seed the Board ---
    let board = Arc::new(match &cli.tasks {
        Some(path) => {
            let tasks = load_tasks(path)?;
            info!(count = tasks.len(), path = %path.display(), "Seeded task board");
            MemoryTaskBoard::with_tasks(tasks)
        }
        None => MemoryTaskBoard::new(),
    });

    // --- 4. Run the Session ---
    info!(
        model = %config.gemini_model,
        voice = ?config.gemini_voice,
        "Connecting to Gemini Live"
    );
    let connector = Arc::new(GeminiConnector::new(
        config.gemini_endpoint.clone(),
        config.gemini_model.clone(),
        config.gemini_voice.clone(),
    ));
    let engine = LiveEngine::new(
        Arc::new(config),
        connector,
        Arc::new(CpalDevices),
        board.clone(),
    );

    let states = engine.subscribe();
    let session = async {
        engine.connect().await;
        follow_state(states).await
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received shutdown signal. Disconnecting...");
        }
        state = session => {
            info!(phase = ?state.phase, "Session ended.");
        }
    }
    engine.disconnect().await;

    if let Some(error) = engine.state().error {
        warn!(%error, "Session finished with an error");
    }

    // --- 5. Print the Board ---
    println!("{}", serde_json::to_string_pretty(&board.tasks())?);
    Ok(())
}
