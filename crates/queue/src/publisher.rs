//! Confirmed, persistent publishing of JSON messages.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::broker::BrokerChannel;
use crate::error::QueueError;

/// Default wait for a broker confirmation.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode message for '{queue}': {source}")]
    Encode {
        queue: String,
        source: serde_json::Error,
    },

    #[error("publish to '{queue}' failed: {source}")]
    Broker { queue: String, source: QueueError },

    #[error("publish to '{queue}' not confirmed within {timeout:?}")]
    ConfirmTimeout { queue: String, timeout: Duration },
}

/// Publishes on one channel and waits for each confirmation.
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
    confirm_timeout: Duration,
}

impl Publisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, confirm_timeout: Duration) -> Self {
        Self {
            channel,
            confirm_timeout,
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    /// Serialize `payload` as JSON and publish it persistently to `queue`.
    ///
    /// Returns only after the broker confirmed the message.
    pub async fn publish<T>(&self, queue: &str, payload: &T) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| PublishError::Encode {
            queue: queue.to_string(),
            source,
        })?;
        self.publish_bytes(queue, &body).await
    }

    /// Publish an already-encoded body.
    pub async fn publish_bytes(&self, queue: &str, body: &[u8]) -> Result<(), PublishError> {
        match tokio::time::timeout(self.confirm_timeout, self.channel.publish(queue, body)).await {
            Ok(Ok(())) => {
                debug!(queue, bytes = body.len(), "publish confirmed");
                Ok(())
            }
            Ok(Err(source)) => {
                warn!(queue, error = %source, "publish failed");
                Err(PublishError::Broker {
                    queue: queue.to_string(),
                    source,
                })
            }
            Err(_) => {
                warn!(queue, timeout = ?self.confirm_timeout, "publish confirm timed out");
                Err(PublishError::ConfirmTimeout {
                    queue: queue.to_string(),
                    timeout: self.confirm_timeout,
                })
            }
        }
    }
}
