//! Live Session
//!
//! - `provider`: the connector seam and the Gemini Live implementation.
//! - `session`: the engine that owns a connection, the capture pipeline and
//!   playback, and publishes the observable state.

pub mod provider;
pub mod session;

pub use session::LiveEngine;
