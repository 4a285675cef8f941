//! Runs all source workers as one unit.
//!
//! Startup is all-or-nothing. Shutdown drains the connection, stops every
//! worker concurrently and then closes the connection. While running, a
//! periodic health report logs each worker's status and counters.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use segway_core::ImporterConfig;
use segway_queue::{ConnectionManager, ConnectionState};

use crate::error::ImporterError;
use crate::metrics::{WorkerHealth, WorkerStatus};
use crate::sources;
use crate::worker::{Worker, WorkerOptions};

/// Default interval between health reports.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

pub struct Supervisor {
    connection: Arc<ConnectionManager>,
    workers: Vec<Arc<dyn Worker>>,
    health_interval: Option<Duration>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            workers: Vec::new(),
            health_interval: Some(DEFAULT_HEALTH_INTERVAL),
            health_task: Mutex::new(None),
        }
    }

    /// One worker per configured source, with per-source overrides applied.
    pub fn from_config(
        config: &ImporterConfig,
        connection: Arc<ConnectionManager>,
    ) -> Result<Self, ImporterError> {
        config.validate()?;
        let options = WorkerOptions::from_settings(&config.worker);
        let mut supervisor =
            Self::new(connection.clone()).with_health_interval(config.health_interval());
        for source in &config.sources {
            let binding = config.binding_for(source);
            supervisor.register(sources::build_worker(binding, connection.clone(), options)?);
        }
        Ok(supervisor)
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.push(worker);
    }

    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.register(worker);
        self
    }

    /// `None` disables the periodic report.
    pub fn with_health_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn workers(&self) -> &[Arc<dyn Worker>] {
        &self.workers
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Current health of every worker.
    pub fn health(&self) -> Vec<WorkerHealth> {
        collect_health(&self.workers, self.connection.state())
    }

    /// Start every worker in registration order.
    ///
    /// If one fails, the ones already started are stopped again and the
    /// failure is returned.
    pub async fn start(&self) -> Result<(), ImporterError> {
        info!(workers = self.workers.len(), "starting workers");
        for (index, worker) in self.workers.iter().enumerate() {
            if let Err(e) = worker.start().await {
                error!(worker = worker.name(), error = %e, "worker failed to start");
                stop_all(&self.workers[..index]).await;
                return Err(ImporterError::Startup {
                    worker: worker.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }
        info!(workers = self.workers.len(), "all workers started");
        report(&self.health());
        self.spawn_health_loop();
        Ok(())
    }

    /// Drain the connection, stop all workers concurrently, close the
    /// connection.
    pub async fn shutdown(&self) -> Result<(), ImporterError> {
        let health_task = lock(&self.health_task).take();
        if let Some(handle) = health_task {
            handle.abort();
        }

        info!(workers = self.workers.len(), "shutting down");
        self.connection.begin_drain();
        stop_all(&self.workers).await;
        self.connection.close().await?;
        report(&self.health());
        info!("shutdown complete");
        Ok(())
    }

    /// Start, wait for `signal`, shut down.
    ///
    /// A startup failure closes the connection and is returned.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), ImporterError>
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.start().await {
            if let Err(close) = self.connection.close().await {
                warn!(error = %close, "closing connection after failed startup");
            }
            return Err(e);
        }
        signal.await;
        info!("shutdown signal received");
        self.shutdown().await
    }

    fn spawn_health_loop(&self) {
        let Some(interval) = self.health_interval else {
            return;
        };
        let workers = self.workers.clone();
        let connection = self.connection.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; a report was just logged.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                report(&collect_health(&workers, connection.state()));
            }
        });
        let previous = lock(&self.health_task).replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

async fn stop_all(workers: &[Arc<dyn Worker>]) {
    let results = join_all(workers.iter().map(|worker| async move {
        (worker.name(), worker.stop().await)
    }))
    .await;
    for (name, result) in results {
        if let Err(e) = result {
            warn!(worker = name, error = %e, "worker stop returned error");
        }
    }
}

/// Workers that look healthy are degraded while the connection is down.
fn collect_health(workers: &[Arc<dyn Worker>], connection: ConnectionState) -> Vec<WorkerHealth> {
    workers
        .iter()
        .map(|worker| {
            let mut health = worker.health();
            if health.status == WorkerStatus::Healthy && connection != ConnectionState::Connected {
                health.status = WorkerStatus::Degraded;
            }
            health
        })
        .collect()
}

fn report(health: &[WorkerHealth]) {
    for h in health {
        let m = &h.metrics;
        if h.status == WorkerStatus::Healthy {
            info!(
                worker = %h.worker,
                status = %h.status,
                received = m.received,
                published = m.published,
                irrelevant = m.irrelevant,
                retried = m.retried,
                dead_lettered = m.dead_lettered,
                requeued = m.requeued,
                "worker health"
            );
        } else {
            warn!(
                worker = %h.worker,
                status = %h.status,
                received = m.received,
                published = m.published,
                irrelevant = m.irrelevant,
                retried = m.retried,
                dead_lettered = m.dead_lettered,
                requeued = m.requeued,
                "worker health"
            );
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
