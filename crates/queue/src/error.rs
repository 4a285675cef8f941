//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("declare error: {0}")]
    Declare(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("broker rejected publish to {0}")]
    Nacked(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("not connected to broker")]
    NotConnected,

    #[error("connection closed")]
    Closed,
}

impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        Self::Channel(e.to_string())
    }
}
