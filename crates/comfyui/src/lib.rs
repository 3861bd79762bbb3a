//! ComfyUI REST client library.
//!
//! Provides HTTP API wrappers for workflow submission and history
//! retrieval, plus [`job::JobClient`], which tracks a submitted workflow
//! to completion by polling.

pub mod api;
pub mod job;
