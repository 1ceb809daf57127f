//! Voiceboard Core
//!
//! Runtime-free building blocks shared by the live session engine: the task
//! model, the task-board seam, the tool dispatcher and the provider-agnostic
//! events exchanged with a live voice provider.

pub mod board;
pub mod generic_types;
pub mod task;
pub mod tools;
