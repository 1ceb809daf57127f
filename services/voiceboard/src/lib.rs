//! Voiceboard Library Crate
//!
//! A duplex voice session with a remote assistant that manages a local task
//! board through tool calls. The `voiceboard` binary is a thin wrapper around
//! this library.

pub mod audio_utils;
pub mod capture;
pub mod config;
pub mod device;
pub mod live;
pub mod playback;
pub mod state;
