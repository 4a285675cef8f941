pub mod amqp;
pub mod backoff;
pub mod broker;
pub mod connection;
pub mod error;
pub mod memory;
pub mod publisher;

pub use amqp::AmqpConnector;
pub use backoff::Backoff;
pub use broker::{BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream};
pub use connection::{ConnectionManager, ConnectionState, DisconnectEvent};
pub use error::QueueError;
pub use memory::{MemoryBroker, PublishFault};
pub use publisher::{PublishError, Publisher, DEFAULT_CONFIRM_TIMEOUT};
