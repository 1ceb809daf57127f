use crate::capture::CAPTURE_FRAME_SAMPLES;
use gemini_realtime::DEFAULT_ENDPOINT;
use secrecy::SecretString;
use std::{path::PathBuf, time::Duration};
use tracing::Level;

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 2000;

/// Instructions used when no prompt file is configured.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a friendly voice assistant that keeps the user's task board. \
Whenever the user mentions something they need to do, call addTask immediately without asking for confirmation. \
When they say a task is done, call markTaskComplete. Use getExistingTasks before answering questions about the board. \
Keep spoken replies short.";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Failed to read system prompt from {path}: {source}")]
    Prompt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Absent credentials are reported when a session is started, not here.
    pub gemini_api_key: Option<SecretString>,
    pub gemini_model: String,
    pub gemini_voice: Option<String>,
    pub gemini_endpoint: String,
    pub instructions: String,
    pub capture_frame_samples: usize,
    pub disconnect_timeout: Duration,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_model: DEFAULT_MODEL.to_string(),
            gemini_voice: None,
            gemini_endpoint: DEFAULT_ENDPOINT.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            capture_frame_samples: CAPTURE_FRAME_SAMPLES,
            disconnect_timeout: Duration::from_millis(DEFAULT_DISCONNECT_TIMEOUT_MS),
            log_level: Level::INFO,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);

        let gemini_model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let gemini_voice = std::env::var("GEMINI_VOICE")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let gemini_endpoint =
            std::env::var("GEMINI_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        let instructions = match std::env::var("SYSTEM_PROMPT_PATH") {
            Ok(path) => {
                let path = PathBuf::from(path);
                std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Prompt { path, source })?
            }
            Err(_) => DEFAULT_INSTRUCTIONS.to_string(),
        };

        let capture_frame_samples = match std::env::var("CAPTURE_FRAME_SAMPLES") {
            Ok(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue(
                        "CAPTURE_FRAME_SAMPLES".to_string(),
                        format!("'{}' is not a positive sample count", raw),
                    ));
                }
            },
            Err(_) => CAPTURE_FRAME_SAMPLES,
        };

        let disconnect_timeout_ms = match std::env::var("DISCONNECT_TIMEOUT_MS") {
            Ok(raw) => raw.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue("DISCONNECT_TIMEOUT_MS".to_string(), e.to_string())
            })?,
            Err(_) => DEFAULT_DISCONNECT_TIMEOUT_MS,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            gemini_api_key,
            gemini_model,
            gemini_voice,
            gemini_endpoint,
            instructions,
            capture_frame_samples,
            disconnect_timeout: Duration::from_millis(disconnect_timeout_ms),
            log_level,
        })
    }
}
