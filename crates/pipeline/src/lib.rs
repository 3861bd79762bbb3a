//! Batch generation pipeline.
//!
//! - [`batch`]: runs one prompt file against ComfyUI.
//! - [`queue`]: the `queue` → `processing` → `completed`/`failed` directory
//!   queue.
//! - [`invoker`]: how the queue hands a file to the batch runner.
//! - [`config`]: environment-driven settings for all of the above.

pub mod batch;
pub mod config;
pub mod invoker;
pub mod queue;

pub use batch::{BatchRunner, RunCounters, RunReport, RunSettings, RunStatus};
pub use config::{ConfigError, PipelineConfig};
pub use invoker::{FileInvoker, InvocationOutcome, InvokeError, ProcessInvoker};
pub use queue::{DirectoryQueue, QueueError, QueueLayout, QueueSettings, QueueState};
