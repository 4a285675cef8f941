//! Per-worker counters and health reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::worker::Outcome;

/// Liveness as seen by the supervisor's health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Bound and consuming.
    Healthy,
    /// Alive but waiting for the broker to come back.
    Degraded,
    /// Not started, stopped, or its task died.
    Unhealthy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Lock-free delivery counters, updated once per delivery.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    received: AtomicU64,
    irrelevant: AtomicU64,
    published: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Published => &self.published,
            Outcome::Irrelevant => &self.irrelevant,
            Outcome::Retried { .. } => &self.retried,
            Outcome::DeadLettered { .. } => &self.dead_lettered,
            Outcome::Requeued => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            irrelevant: self.irrelevant.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WorkerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub irrelevant: u64,
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
}

/// One line of the supervisor's health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub worker: String,
    pub status: WorkerStatus,
    pub metrics: MetricsSnapshot,
}
