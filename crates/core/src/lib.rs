//! Pure domain logic for batch image generation.
//!
//! Prompt-file grammar, workflow template binding and the on-disk workflow
//! library. Nothing here performs network I/O or spawns tasks.

pub mod error;
pub mod library;
pub mod prompt_file;
pub mod types;
pub mod workflow;
