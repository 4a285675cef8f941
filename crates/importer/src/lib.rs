pub mod error;
pub mod metrics;
pub mod source;
pub mod sources;
pub mod supervisor;
pub mod worker;

pub use error::ImporterError;
pub use metrics::{MetricsSnapshot, WorkerHealth, WorkerMetrics, WorkerStatus};
pub use source::{FnSource, SourceHandler};
pub use sources::{build_worker, AsanaSource, CsvSource, JiraSource, TrelloSource};
pub use supervisor::{Supervisor, DEFAULT_HEALTH_INTERVAL};
pub use worker::{
    ImportWorker, Outcome, Worker, WorkerOptions, DEFAULT_DRAIN_TIMEOUT, DEFAULT_REQUEUE_DELAY,
};
