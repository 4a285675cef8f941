use thiserror::Error;

use segway_core::ConfigError;
use segway_queue::QueueError;

/// Errors surfaced by workers and the supervisor.
///
/// Message-level failures never show up here; they end in an ack, a retry
/// or a dead letter inside the worker.
#[derive(Debug, Error)]
pub enum ImporterError {
    #[error("worker '{worker}' could not bind to the broker: {source}")]
    Bind { worker: String, source: QueueError },

    #[error("worker '{worker}' failed to start: {reason}")]
    Startup { worker: String, reason: String },

    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("broker error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
