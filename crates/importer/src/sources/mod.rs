//! Built-in source handlers.

mod asana;
mod csv;
mod jira;
mod trello;

use std::sync::Arc;

pub use asana::AsanaSource;
pub use csv::CsvSource;
pub use jira::JiraSource;
pub use trello::TrelloSource;

use segway_core::WorkerBinding;
use segway_queue::ConnectionManager;

use crate::error::ImporterError;
use crate::worker::{ImportWorker, Worker, WorkerOptions};

/// Build the worker for a built-in source.
pub fn build_worker(
    binding: WorkerBinding,
    connection: Arc<ConnectionManager>,
    options: WorkerOptions,
) -> Result<Arc<dyn Worker>, ImporterError> {
    let worker: Arc<dyn Worker> = match binding.source() {
        "jira" => Arc::new(ImportWorker::new(JiraSource, binding, connection, options)),
        "asana" => Arc::new(ImportWorker::new(AsanaSource, binding, connection, options)),
        "trello" => Arc::new(ImportWorker::new(TrelloSource, binding, connection, options)),
        "csv" => Arc::new(ImportWorker::new(CsvSource, binding, connection, options)),
        other => return Err(ImporterError::UnknownSource(other.to_string())),
    };
    Ok(worker)
}
