//! Worker trait and the generic import worker.
//!
//! [`ImportWorker`] binds one `(domain, source)` queue, runs every delivery
//! through its [`SourceHandler`], relays the result to the outbound queue and
//! decides between ack, retry and dead-letter. It pauses while the broker is
//! away and rebinds once the [`ConnectionManager`] is connected again.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use segway_core::config::WorkerSettings;
use segway_core::{
    DeadLetter, FailureKind, HandleError, ImportJobMessage, NormalizedMessage, WorkerBinding,
};
use segway_queue::{
    Backoff, BrokerChannel, ConnectionManager, Delivery, DeliveryStream, PublishError, Publisher,
    QueueError, DEFAULT_CONFIRM_TIMEOUT,
};

use crate::error::ImporterError;
use crate::metrics::{MetricsSnapshot, WorkerHealth, WorkerMetrics, WorkerStatus};
use crate::source::SourceHandler;

/// Default wait for in-flight work during [`Worker::stop`].
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default pause before a message that could not be rerouted is nacked.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);

// ── Worker trait ─────────────────────────────────────────────────────

/// A long-running consumer managed by the supervisor.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Declare queues and begin consuming. Idempotent while running.
    async fn start(&self) -> Result<(), ImporterError>;

    /// Stop taking deliveries, drain in-flight work, release the channel.
    async fn stop(&self) -> Result<(), ImporterError>;

    /// Name used in logs and health reports.
    fn name(&self) -> &str;

    fn health(&self) -> WorkerHealth;
}

// ── Options ──────────────────────────────────────────────────────────

/// Timing knobs shared by all workers of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Wait for each publish confirmation.
    pub confirm_timeout: Duration,
    /// Wait for in-flight deliveries on stop before aborting them.
    pub drain_timeout: Duration,
    /// Delay between failed rebind attempts after a reconnect.
    pub rebind_backoff: Backoff,
    /// Pause before nacking a message that could not be rerouted.
    pub requeue_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            rebind_backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }
}

impl WorkerOptions {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            confirm_timeout: settings.publish_confirm_timeout(),
            drain_timeout: settings.drain_timeout(),
            requeue_delay: settings.requeue_delay(),
            ..Self::default()
        }
    }

    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }
}

// ── Outcome ──────────────────────────────────────────────────────────

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Normalized message confirmed on the outbound queue; original acked.
    Published,
    /// Filtered out by the relevance check; acked.
    Irrelevant,
    /// Republished to its own queue with `attempt`; original acked.
    Retried { attempt: u32 },
    /// Published to the dead-letter queue; original acked.
    DeadLettered { kind: FailureKind },
    /// Retry or dead-letter publish failed; original nacked with requeue.
    Requeued,
}

// ── ImportWorker ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Paused,
    Draining,
    Stopped,
}

/// Channel and consumer currently held by a worker.
struct Session {
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: String,
}

type SharedSession = Arc<Mutex<Option<Session>>>;

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    session: SharedSession,
}

/// Worker base, generic over the source-specific handler.
pub struct ImportWorker<S> {
    name: String,
    engine: Arc<Engine<S>>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
}

impl<S: SourceHandler> ImportWorker<S> {
    pub fn new(
        handler: S,
        binding: WorkerBinding,
        connection: Arc<ConnectionManager>,
        options: WorkerOptions,
    ) -> Self {
        if handler.source() != binding.source() {
            warn!(
                handler = handler.source(),
                queue = binding.queue(),
                "handler source differs from its binding"
            );
        }
        Self {
            name: binding.queue().to_string(),
            engine: Arc::new(Engine {
                handler,
                binding,
                connection,
                options,
                metrics: WorkerMetrics::new(),
                phase: Mutex::new(Phase::Idle),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
        }
    }

    pub fn binding(&self) -> &WorkerBinding {
        &self.engine.binding
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics.snapshot()
    }

    fn status(&self) -> WorkerStatus {
        let task_died = lock(&self.running)
            .as_ref()
            .is_some_and(|running| running.task.is_finished());
        if task_died {
            return WorkerStatus::Unhealthy;
        }
        match *lock(&self.engine.phase) {
            Phase::Running => WorkerStatus::Healthy,
            Phase::Paused | Phase::Draining => WorkerStatus::Degraded,
            Phase::Idle | Phase::Stopped => WorkerStatus::Unhealthy,
        }
    }
}

#[async_trait]
impl<S: SourceHandler> Worker for ImportWorker<S> {
    async fn start(&self) -> Result<(), ImporterError> {
        let _lifecycle = self.lifecycle.lock().await;
        let finished = {
            let mut running = lock(&self.running);
            match running.as_ref().map(|current| current.task.is_finished()) {
                Some(true) => running.take(),
                Some(false) => {
                    debug!(worker = %self.name, "worker already started");
                    return Ok(());
                }
                None => None,
            }
        };
        if let Some(dead) = finished {
            warn!(worker = %self.name, "consume task had exited, rebinding");
            release(&dead.session).await;
        }

        let (session, deliveries) = self.engine.bind().await.map_err(|source| {
            ImporterError::Bind {
                worker: self.name.clone(),
                source,
            }
        })?;

        let session: SharedSession = Arc::new(Mutex::new(Some(session)));
        let (stop, stop_rx) = watch::channel(false);
        self.engine.set_phase(Phase::Running);
        let task = tokio::spawn(self.engine.clone().run(deliveries, session.clone(), stop_rx));
        *lock(&self.running) = Some(Running {
            stop,
            task,
            session,
        });
        info!(worker = %self.name, "worker started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ImporterError> {
        let _lifecycle = self.lifecycle.lock().await;
        let running = lock(&self.running).take();
        let Some(Running {
            stop,
            mut task,
            session,
        }) = running
        else {
            return Ok(());
        };

        let timeout = self.engine.options.drain_timeout;
        self.engine.set_phase(Phase::Draining);
        info!(worker = %self.name, timeout = ?timeout, "draining worker");
        stop.send_replace(true);

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => debug!(worker = %self.name, "in-flight work drained"),
            Ok(Err(e)) => warn!(worker = %self.name, error = %e, "worker task ended abnormally"),
            Err(_) => {
                warn!(
                    worker = %self.name,
                    "drain timed out, aborting; unacknowledged messages will be redelivered"
                );
                task.abort();
                let _ = task.await;
            }
        }

        release(&session).await;
        self.engine.set_phase(Phase::Stopped);
        info!(worker = %self.name, "worker stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn health(&self) -> WorkerHealth {
        WorkerHealth {
            worker: self.name.clone(),
            status: self.status(),
            metrics: self.metrics(),
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// State shared between a worker handle and its consume task.
struct Engine<S> {
    handler: S,
    binding: WorkerBinding,
    connection: Arc<ConnectionManager>,
    options: WorkerOptions,
    metrics: WorkerMetrics,
    phase: Mutex<Phase>,
}

impl<S: SourceHandler> Engine<S> {
    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }

    /// Open a channel, declare the worker's queues and start consuming.
    #[instrument(skip(self), fields(worker = %self.binding))]
    async fn bind(&self) -> Result<(Session, DeliveryStream), QueueError> {
        let channel = self.connection.create_channel().await?;
        match self.subscribe(channel.as_ref()).await {
            Ok((consumer_tag, deliveries)) => Ok((
                Session {
                    channel,
                    consumer_tag,
                },
                deliveries,
            )),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<(String, DeliveryStream), QueueError> {
        channel.declare_queue(self.binding.queue()).await?;
        channel.declare_queue(&self.binding.outbound_queue()).await?;
        channel.declare_queue(&self.binding.dead_letter_queue()).await?;
        channel.set_prefetch(self.binding.prefetch()).await?;

        let consumer_tag = format!(
            "segway-{}-{}",
            self.binding.source(),
            Uuid::new_v4().simple()
        );
        let deliveries = channel.consume(self.binding.queue(), &consumer_tag).await?;
        info!(
            queue = self.binding.queue(),
            prefetch = self.binding.prefetch(),
            consumer_tag = %consumer_tag,
            "consuming"
        );
        Ok((consumer_tag, deliveries))
    }

    /// Consume task: runs until stopped or the connection shuts down.
    async fn run(
        self: Arc<Self>,
        mut deliveries: DeliveryStream,
        session: SharedSession,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let channel = lock(&session).as_ref().map(|s| s.channel.clone());
            let Some(channel) = channel else {
                return;
            };
            self.consume(deliveries, channel, stop.clone()).await;
            release(&session).await;
            if *stop.borrow() {
                return;
            }

            self.set_phase(Phase::Paused);
            warn!(worker = %self.binding, "consumer stream ended, waiting to rebind");
            let Some((bound, next)) = self.rebind(&mut stop).await else {
                return;
            };
            *lock(&session) = Some(bound);
            deliveries = next;
            self.set_phase(Phase::Running);
            info!(worker = %self.binding, "worker rebound after reconnect");
        }
    }

    /// Wait for the connection and bind again. `None` once stopping.
    async fn rebind(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<(Session, DeliveryStream)> {
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                ready = self.connection.wait_connected() => {
                    if ready.is_err() {
                        debug!(worker = %self.binding, "connection shutting down, not rebinding");
                        return None;
                    }
                }
                _ = stop.wait_for(|stopped| *stopped) => return None,
            }

            match self.bind().await {
                Ok(bound) => return Some(bound),
                Err(e) => {
                    let delay = self.options.rebind_backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        worker = %self.binding,
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "rebind failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.wait_for(|stopped| *stopped) => return None,
                    }
                }
            }
        }
    }

    /// Process deliveries with at most `prefetch` in flight until the stream
    /// ends or stop is signalled. In-flight deliveries always finish.
    async fn consume(
        &self,
        deliveries: DeliveryStream,
        channel: Arc<dyn BrokerChannel>,
        mut stop: watch::Receiver<bool>,
    ) {
        let publisher = Publisher::new(channel.clone(), self.options.confirm_timeout);
        let stopped = async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        };
        let limit = usize::from(self.binding.prefetch());
        let channel = channel.as_ref();
        let publisher = &publisher;

        deliveries
            .take_until(stopped)
            .for_each_concurrent(limit, |next| async move {
                match next {
                    Ok(delivery) => {
                        self.process(channel, publisher, delivery).await;
                    }
                    Err(e) => warn!(worker = %self.binding, error = %e, "delivery stream error"),
                }
            })
            .await;
    }

    async fn process(
        &self,
        channel: &dyn BrokerChannel,
        publisher: &Publisher,
        delivery: Delivery,
    ) -> Outcome {
        self.metrics.record_received();
        let outcome = self.dispatch(channel, publisher, delivery).await;
        self.metrics.record(&outcome);
        outcome
    }

    #[instrument(
        skip_all,
        fields(
            worker = %self.binding,
            delivery_tag = delivery.delivery_tag,
            job_id = tracing::field::Empty,
            attempt = tracing::field::Empty,
        )
    )]
    async fn dispatch(
        &self,
        channel: &dyn BrokerChannel,
        publisher: &Publisher,
        delivery: Delivery,
    ) -> Outcome {
        let tag = delivery.delivery_tag;
        let job = match ImportJobMessage::from_slice(&delivery.body) {
            Ok(job) => job,
            Err(e) => {
                let dead = DeadLetter::for_raw_body(
                    &self.binding,
                    &delivery.body,
                    format!("undecodable job: {e}"),
                );
                return self.dead_letter(channel, publisher, tag, dead).await;
            }
        };

        let span = tracing::Span::current();
        span.record("job_id", job.job_id.as_str());
        span.record("attempt", job.attempt);
        if delivery.redelivered {
            debug!("redelivered by the broker");
        }

        if let Err(reason) = job.validate_for(&self.binding) {
            let dead = DeadLetter::for_job(&self.binding, job, FailureKind::Validation, reason);
            return self.dead_letter(channel, publisher, tag, dead).await;
        }

        if !self.handler.is_relevant(&job) {
            debug!("job not relevant, acknowledging");
            self.ack(channel, tag).await;
            return Outcome::Irrelevant;
        }

        let failure = match self.transform(&job).await {
            Ok(normalized) => {
                match publisher.publish(&self.binding.outbound_queue(), &normalized).await {
                    Ok(()) => {
                        self.ack(channel, tag).await;
                        info!(external_id = %normalized.external_id, "relayed");
                        return Outcome::Published;
                    }
                    Err(e) => HandleFailure::publish(&e),
                }
            }
            Err(e) => HandleFailure::from(e),
        };

        self.fail(channel, publisher, tag, job, failure).await
    }

    /// Run the handler, turning a panic into a transform error.
    async fn transform(&self, job: &ImportJobMessage) -> Result<NormalizedMessage, HandleError> {
        match AssertUnwindSafe(self.handler.handle(job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HandleError::transform(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// Retry or dead-letter a job whose transform or relay failed.
    async fn fail(
        &self,
        channel: &dyn BrokerChannel,
        publisher: &Publisher,
        tag: u64,
        job: ImportJobMessage,
        failure: HandleFailure,
    ) -> Outcome {
        if !failure.kind.is_retryable() {
            let dead = DeadLetter::for_job(&self.binding, job, failure.kind, failure.reason);
            return self.dead_letter(channel, publisher, tag, dead).await;
        }

        let next = job.next_attempt();
        if next.attempt >= self.binding.max_attempts() {
            let dead = DeadLetter::for_job(&self.binding, next, failure.kind, failure.reason);
            return self.dead_letter(channel, publisher, tag, dead).await;
        }

        match publisher.publish(self.binding.queue(), &next).await {
            Ok(()) => {
                self.ack(channel, tag).await;
                warn!(
                    kind = %failure.kind,
                    reason = %failure.reason,
                    next_attempt = next.attempt,
                    "scheduled retry"
                );
                Outcome::Retried {
                    attempt: next.attempt,
                }
            }
            Err(e) => self.requeue(channel, tag, &e).await,
        }
    }

    async fn dead_letter(
        &self,
        channel: &dyn BrokerChannel,
        publisher: &Publisher,
        tag: u64,
        dead: DeadLetter,
    ) -> Outcome {
        match publisher.publish(&self.binding.dead_letter_queue(), &dead).await {
            Ok(()) => {
                self.ack(channel, tag).await;
                error!(
                    kind = %dead.kind,
                    reason = %dead.reason,
                    final_attempt = dead.attempt,
                    "dead-lettered"
                );
                Outcome::DeadLettered { kind: dead.kind }
            }
            Err(e) => self.requeue(channel, tag, &e).await,
        }
    }

    async fn requeue(&self, channel: &dyn BrokerChannel, tag: u64, cause: &PublishError) -> Outcome {
        let delay = self.options.requeue_delay;
        warn!(
            error = %cause,
            delay = ?delay,
            "could not reroute message, returning it to the broker"
        );
        tokio::time::sleep(delay).await;
        if let Err(e) = channel.nack(tag, true).await {
            warn!(error = %e, "nack failed; broker will redeliver once the channel closes");
        }
        Outcome::Requeued
    }

    async fn ack(&self, channel: &dyn BrokerChannel, tag: u64) {
        if let Err(e) = channel.ack(tag).await {
            warn!(error = %e, "ack failed; message may be redelivered");
        }
    }
}

/// Why a decoded job could not be relayed.
struct HandleFailure {
    kind: FailureKind,
    reason: String,
}

impl HandleFailure {
    fn publish(error: &PublishError) -> Self {
        Self {
            kind: FailureKind::Publish,
            reason: error.to_string(),
        }
    }
}

impl From<HandleError> for HandleFailure {
    fn from(error: HandleError) -> Self {
        Self {
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

/// Cancel the consumer and close the channel, if still held.
async fn release(session: &SharedSession) {
    let current = lock(session).take();
    let Some(Session {
        channel,
        consumer_tag,
    }) = current
    else {
        return;
    };
    if let Err(e) = channel.cancel(&consumer_tag).await {
        debug!(consumer_tag = %consumer_tag, error = %e, "consumer cancel failed");
    }
    if let Err(e) = channel.close().await {
        debug!(error = %e, "channel close failed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Tests ────────────────────────────────────────────────────────────
