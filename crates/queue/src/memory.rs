//! In-process broker with AMQP-like semantics.
//!
//! Queues, per-channel prefetch windows, ack/nack, requeue-on-close and
//! publisher confirms behave like RabbitMQ's default exchange, which is what
//! the pipeline relies on. Fault injection hooks simulate an unreachable
//! broker, a dropped connection, and rejected or stalled confirms.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::watch;
use tracing::debug;

use crate::broker::{BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream};
use crate::error::QueueError;

/// Injected outcome for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFault {
    /// The broker nacks the publish.
    Nack,
    /// The confirmation never arrives; the message is not stored.
    Stall,
}

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    /// Every body ever published to this queue, in order.
    history: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct Pending {
    queue: String,
    body: Vec<u8>,
}

#[derive(Debug)]
struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    open: bool,
    /// Keyed by delivery tag so requeue preserves delivery order.
    unacked: BTreeMap<u64, Pending>,
    consumers: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, bool>,
    faults: HashMap<String, VecDeque<PublishFault>>,
    stalled: Vec<String>,
    unreachable: bool,
    next_id: u64,
    connects: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    /// Return a channel's unacked deliveries to the front of their queues.
    fn requeue_unacked(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        let pending = std::mem::take(&mut channel.unacked);
        for (_, p) in pending.into_iter().rev() {
            self.queue(&p.queue).ready.push_front(Stored {
                body: p.body,
                redelivered: true,
            });
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        self.requeue_unacked(channel_id);
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.open = false;
            channel.consumers.clear();
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        let ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.close_channel(id);
        }
        self.connections.insert(connection_id, false);
    }

    fn channel_usable(&self, channel_id: u64) -> bool {
        self.channels.get(&channel_id).is_some_and(|c| {
            c.open && self.connections.get(&c.connection_id).copied().unwrap_or(false)
        })
    }
}

struct Inner {
    state: Mutex<State>,
    /// Bumped on every state change; consumers and waiters watch it.
    version: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the state consistent enough
        // for tests to keep observing it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Cloneable handle to a shared in-memory broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                version,
            }),
        }
    }

    // ── Producer side (stands in for the job-submission API) ─────────

    /// Put a message on `queue` as an external producer would.
    pub fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        {
            let mut state = self.inner.lock();
            let q = state.queue(queue);
            q.history.push(body.clone());
            q.ready.push_back(Stored {
                body,
                redelivered: false,
            });
        }
        self.inner.bump();
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// Bodies waiting in `queue` (not including unacked deliveries).
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.inner.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Every body ever published to `queue`, including consumed ones.
    pub fn history(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.inner.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.history.clone())
            .unwrap_or_default()
    }

    /// Deliveries from `queue` that are currently unacknowledged.
    pub fn unacked(&self, queue: &str) -> usize {
        let state = self.inner.lock();
        state
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|p| p.queue == queue)
            .count()
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.inner.lock().queues.contains_key(queue)
    }

    /// Number of consumers registered on open channels for `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        let state = self.inner.lock();
        state
            .channels
            .values()
            .filter(|c| c.open)
            .flat_map(|c| c.consumers.values())
            .filter(|q| q.as_str() == queue)
            .count()
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.inner.lock().connects
    }

    pub fn open_channels(&self) -> usize {
        let state = self.inner.lock();
        state
            .channels
            .keys()
            .filter(|id| state.channel_usable(**id))
            .count()
    }

    /// Wait until `predicate` holds, checking after every broker change.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&MemoryBroker) -> bool,
    {
        let mut version = self.inner.version.subscribe();
        let wait = async {
            loop {
                version.borrow_and_update();
                if predicate(self) {
                    return;
                }
                if version.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok() && predicate(self)
    }

    // ── Fault injection ──────────────────────────────────────────────

    /// Make subsequent connects fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unreachable = !reachable;
        self.inner.bump();
    }

    /// Drop every live connection, as a network failure would.
    pub fn drop_connections(&self) {
        {
            let mut state = self.inner.lock();
            let live: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, alive)| **alive)
                .map(|(id, _)| *id)
                .collect();
            for id in live {
                state.close_connection(id);
            }
        }
        debug!("dropped all in-memory broker connections");
        self.inner.bump();
    }

    /// Apply `fault` to the next `times` publishes to `queue`.
    pub fn fail_publishes(&self, queue: &str, fault: PublishFault, times: usize) {
        let mut state = self.inner.lock();
        let faults = state.faults.entry(queue.to_string()).or_default();
        faults.extend(std::iter::repeat(fault).take(times));
    }

    /// Stall every publish to `queue` until [`Self::clear_faults`].
    pub fn stall_publishes(&self, queue: &str) {
        self.inner.lock().stalled.push(queue.to_string());
    }

    /// Drop pending publish faults and stop stalling. Publishes already
    /// stalled stay unconfirmed.
    pub fn clear_faults(&self) {
        let mut state = self.inner.lock();
        state.faults.clear();
        state.stalled.clear();
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        let id = {
            let mut state = self.inner.lock();
            if state.unreachable {
                return Err(QueueError::Connection("in-memory broker unreachable".into()));
            }
            let id = state.next_id();
            state.connections.insert(id, true);
            state.connects += 1;
            id
        };
        self.inner.bump();
        Ok(Arc::new(MemoryConnection {
            inner: self.inner.clone(),
            id,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

pub struct MemoryConnection {
    inner: Arc<Inner>,
    id: u64,
}

impl MemoryConnection {
    fn alive(&self) -> bool {
        self.inner
            .lock()
            .connections
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        let id = {
            let mut state = self.inner.lock();
            if !state.connections.get(&self.id).copied().unwrap_or(false) {
                return Err(QueueError::NotConnected);
            }
            let id = state.next_id();
            state.channels.insert(
                id,
                ChannelState {
                    connection_id: self.id,
                    prefetch: 0,
                    open: true,
                    unacked: BTreeMap::new(),
                    consumers: HashMap::new(),
                },
            );
            id
        };
        self.inner.bump();
        Ok(Arc::new(MemoryChannel {
            inner: self.inner.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.alive()
    }

    async fn closed(&self) {
        let mut version = self.inner.version.subscribe();
        loop {
            version.borrow_and_update();
            if !self.alive() {
                return;
            }
            if version.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.lock().close_connection(self.id);
        self.inner.bump();
        Ok(())
    }
}

pub struct MemoryChannel {
    inner: Arc<Inner>,
    id: u64,
}

impl MemoryChannel {
    fn ensure_usable(&self, state: &State) -> Result<(), QueueError> {
        if state.channel_usable(self.id) {
            Ok(())
        } else {
            Err(QueueError::Closed)
        }
    }
}

/// Per-consumer cursor driving the delivery stream.
struct ConsumerCursor {
    inner: Arc<Inner>,
    channel_id: u64,
    queue: String,
    consumer_tag: String,
    version: watch::Receiver<u64>,
}

impl ConsumerCursor {
    /// Take the next deliverable message, `Ok(None)` if none is ready yet,
    /// `Err(())` once the consumer is gone.
    fn poll_next(&self) -> Result<Option<Delivery>, ()> {
        let mut state = self.inner.lock();
        if !state.channel_usable(self.channel_id) {
            return Err(());
        }
        let Some(channel) = state.channels.get(&self.channel_id) else {
            return Err(());
        };
        if !channel.consumers.contains_key(&self.consumer_tag) {
            return Err(());
        }
        let window_full =
            channel.prefetch > 0 && channel.unacked.len() >= usize::from(channel.prefetch);
        if window_full {
            return Ok(None);
        }
        let Some(stored) = state.queue(&self.queue).ready.pop_front() else {
            return Ok(None);
        };
        let tag = state.next_id();
        if let Some(channel) = state.channels.get_mut(&self.channel_id) {
            channel.unacked.insert(
                tag,
                Pending {
                    queue: self.queue.clone(),
                    body: stored.body.clone(),
                },
            );
        }
        Ok(Some(Delivery {
            delivery_tag: tag,
            body: stored.body,
            redelivered: stored.redelivered,
        }))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str) -> Result<(), QueueError> {
        {
            let mut state = self.inner.lock();
            self.ensure_usable(&state)?;
            state.queue(name);
        }
        self.inner.bump();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        self.ensure_usable(&state)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, QueueError> {
        {
            let mut state = self.inner.lock();
            self.ensure_usable(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(QueueError::Consume(format!("no queue '{queue}'")));
            }
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel
                    .consumers
                    .insert(consumer_tag.to_string(), queue.to_string());
            }
        }
        self.inner.bump();

        let cursor = ConsumerCursor {
            inner: self.inner.clone(),
            channel_id: self.id,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            version: self.inner.version.subscribe(),
        };

        let deliveries = stream::unfold(cursor, |mut cursor| async move {
            loop {
                cursor.version.borrow_and_update();
                match cursor.poll_next() {
                    Ok(Some(delivery)) => {
                        cursor.inner.bump();
                        return Some((Ok(delivery), cursor));
                    }
                    Ok(None) => {
                        if cursor.version.changed().await.is_err() {
                            return None;
                        }
                    }
                    Err(()) => return None,
                }
            }
        });
        Ok(Box::pin(deliveries))
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let fault = {
            let mut state = self.inner.lock();
            self.ensure_usable(&state)?;
            if state.stalled.iter().any(|q| q == queue) {
                Some(PublishFault::Stall)
            } else {
                state.faults.get_mut(queue).and_then(|f| f.pop_front())
            }
        };

        match fault {
            Some(PublishFault::Stall) => {
                debug!(queue, "stalling publish confirm");
                futures::future::pending().await
            }
            Some(PublishFault::Nack) => Err(QueueError::Nacked(queue.to_string())),
            None => {
                {
                    let mut state = self.inner.lock();
                    let q = state.queue(queue);
                    q.history.push(body.to_vec());
                    q.ready.push_back(Stored {
                        body: body.to_vec(),
                        redelivered: false,
                    });
                }
                self.inner.bump();
                Ok(())
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError> {
        {
            let mut state = self.inner.lock();
            self.ensure_usable(&state)?;
            let removed = state
                .channels
                .get_mut(&self.id)
                .and_then(|c| c.unacked.remove(&delivery_tag));
            if removed.is_none() {
                return Err(QueueError::Ack(format!("unknown delivery tag {delivery_tag}")));
            }
        }
        self.inner.bump();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        {
            let mut state = self.inner.lock();
            self.ensure_usable(&state)?;
            let pending = state
                .channels
                .get_mut(&self.id)
                .and_then(|c| c.unacked.remove(&delivery_tag))
                .ok_or_else(|| QueueError::Ack(format!("unknown delivery tag {delivery_tag}")))?;
            if requeue {
                state.queue(&pending.queue).ready.push_front(Stored {
                    body: pending.body,
                    redelivered: true,
                });
            }
        }
        self.inner.bump();
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), QueueError> {
        {
            let mut state = self.inner.lock();
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.consumers.remove(consumer_tag);
            }
        }
        self.inner.bump();
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.lock().close_channel(self.id);
        self.inner.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const WAIT: Duration = Duration::from_secs(2);

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let conn = broker.connect().await.unwrap();
        conn.create_channel().await.unwrap()
    }

    #[tokio::test]
    async fn publish_then_consume_and_ack() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        ch.publish("q", b"one").await.unwrap();

        let mut deliveries = ch.consume("q", "c1").await.unwrap();
        let d = deliveries.next().await.unwrap().unwrap();
        assert_eq!(d.body, b"one");
        assert!(!d.redelivered);
        assert_eq!(broker.unacked("q"), 1);

        ch.ack(d.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked("q"), 0);
        assert!(broker.messages("q").is_empty());
        assert_eq!(broker.history("q").len(), 1);
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_window() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        ch.set_prefetch(1).await.unwrap();
        broker.enqueue("q", "a");
        broker.enqueue("q", "b");

        let mut deliveries = ch.consume("q", "c1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        ch.ack(first.delivery_tag).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"b");
    }

    #[tokio::test]
    async fn nack_requeue_redelivers_first() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        broker.enqueue("q", "a");
        broker.enqueue("q", "b");

        let mut deliveries = ch.consume("q", "c1").await.unwrap();
        let a = deliveries.next().await.unwrap().unwrap();
        ch.nack(a.delivery_tag, true).await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn closing_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        broker.enqueue("q", "a");

        let mut deliveries = ch.consume("q", "c1").await.unwrap();
        let _a = deliveries.next().await.unwrap().unwrap();
        ch.close().await.unwrap();

        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.messages("q"), vec![b"a".to_vec()]);
        assert_eq!(broker.unacked("q"), 0);
    }

    #[tokio::test]
    async fn dropped_connection_ends_streams_and_resolves_closed() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let ch = conn.create_channel().await.unwrap();
        ch.declare_queue("q").await.unwrap();
        let mut deliveries = ch.consume("q", "c1").await.unwrap();

        broker.drop_connections();

        tokio::time::timeout(WAIT, conn.closed()).await.unwrap();
        assert!(!conn.is_connected());
        assert!(deliveries.next().await.is_none());
        assert!(matches!(ch.publish("q", b"x").await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connect() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        assert!(matches!(broker.connect().await, Err(QueueError::Connection(_))));
        broker.set_reachable(true);
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn injected_nack_and_stall() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        broker.fail_publishes("out", PublishFault::Nack, 1);
        assert!(matches!(ch.publish("out", b"x").await, Err(QueueError::Nacked(_))));
        ch.publish("out", b"y").await.unwrap();

        broker.stall_publishes("out");
        let stalled = tokio::time::timeout(Duration::from_millis(50), ch.publish("out", b"z")).await;
        assert!(stalled.is_err());
        assert_eq!(broker.messages("out"), vec![b"y".to_vec()]);
    }

    #[tokio::test]
    async fn cancel_ends_stream_but_keeps_unacked() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        broker.enqueue("q", "a");

        let mut deliveries = ch.consume("q", "c1").await.unwrap();
        let a = deliveries.next().await.unwrap().unwrap();
        ch.cancel("c1").await.unwrap();

        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.unacked("q"), 1);
        ch.ack(a.delivery_tag).await.unwrap();
        assert_eq!(broker.consumer_count("q"), 0);
    }

    #[tokio::test]
    async fn wait_until_observes_changes() {
        let broker = MemoryBroker::new();
        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue("q", "late");
        });
        assert!(broker.wait_until(WAIT, |b| b.messages("q").len() == 1).await);
        assert!(!broker.wait_until(Duration::from_millis(20), |b| b.messages("q").len() == 2).await);
    }
}
