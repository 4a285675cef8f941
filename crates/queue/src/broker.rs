//! Broker transport traits and types.
//!
//! The pipeline talks to the broker only through these traits so the same
//! worker code runs against RabbitMQ ([`crate::amqp`]) and the in-process
//! broker ([`crate::memory`]).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::QueueError;

/// A message handed to a consumer, pending acknowledgment.
#[derive(Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack/nack this delivery.
    pub delivery_tag: u64,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before (to any consumer).
    pub redelivered: bool,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer registration.
///
/// Ends when the consumer is cancelled or its channel/connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, QueueError>>;

/// Opens transport connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection. Fails when the broker is unreachable or
    /// rejects the credentials.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, QueueError>;

    /// Human-readable target for logs (no secrets).
    fn describe(&self) -> String;
}

/// A live transport connection. Safe for concurrent channel creation.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel with publisher confirms enabled.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, QueueError>;

    /// Whether the transport is still up.
    fn is_connected(&self) -> bool;

    /// Resolves once the transport has failed or been closed.
    async fn closed(&self);

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), QueueError>;
}

/// A channel on a [`BrokerConnection`]. Never shared between workers.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue (no-op if it already exists).
    async fn declare_queue(&self, name: &str) -> Result<(), QueueError>;

    /// Bound the number of unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError>;

    /// Register a consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, QueueError>;

    /// Publish a persistent message to `queue` and wait for the broker's
    /// confirmation. A broker nack is reported as [`QueueError::Nacked`].
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError>;

    /// Acknowledge successful processing; removes the message from the queue.
    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError>;

    /// Negative-acknowledge; with `requeue` the broker redelivers the
    /// message unchanged.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError>;

    /// Cancel a consumer registration. Unacked deliveries stay pending until
    /// acked or the channel closes.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), QueueError>;

    /// Close the channel. Unacked deliveries are returned to their queues.
    async fn close(&self) -> Result<(), QueueError>;
}
