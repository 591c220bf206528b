//! Message producer on top of the connection pool.

use serde::Serialize;

use crate::error::{PublishError, TransportError};
use crate::lifecycle::{BrokerChannel, BrokerConnection, Connector, QueueOptions};
use crate::pool::ConnectionPool;

/// Publishes messages through connections borrowed from a [`ConnectionPool`].
///
/// Every publish borrows one connection, opens a channel, declares the
/// target queue, publishes, and hands the connection back, on both the
/// success and the failure path. The producer never retries; a failed
/// publish is reported to the caller.
pub struct Producer<C: Connector> {
    pool: ConnectionPool<C>,
    exchange: String,
    queue_options: QueueOptions,
    persistent: bool,
}

impl<C: Connector> Producer<C> {
    /// Create a producer publishing to the default exchange with durable
    /// queues and persistent delivery.
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self {
            pool,
            exchange: String::new(),
            queue_options: QueueOptions::durable(),
            persistent: true,
        }
    }

    /// Publish through a named exchange instead of the default one.
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Set the options used when declaring queues.
    #[must_use]
    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Enable or disable persistent delivery.
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// The pool this producer borrows connections from.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Declare `queue` and publish `payload` with `routing_key`.
    pub async fn publish(
        &self,
        queue: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        let conn = self.pool.get().await?;
        let transport_err = |source: TransportError| PublishError::Transport {
            queue: queue.to_string(),
            source,
        };

        let channel = conn.open_channel().await.map_err(transport_err)?;
        let result = self.declare_and_publish(&channel, queue, routing_key, payload).await;

        if let Err(e) = channel.close().await {
            tracing::debug!(connection_id = conn.id(), error = %e, "channel close failed");
        }

        match result {
            Ok(()) => {
                tracing::debug!(
                    queue,
                    routing_key,
                    bytes = payload.len(),
                    connection_id = conn.id(),
                    "message published"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(queue, routing_key, error = %e, "publish failed");
                Err(transport_err(e))
            }
        }
    }

    /// Serialize `message` as JSON and publish it.
    pub async fn publish_json<T>(
        &self,
        queue: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message)?;
        self.publish(queue, routing_key, &payload).await
    }

    async fn declare_and_publish(
        &self,
        channel: &<C::Connection as BrokerConnection>::Channel,
        queue: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        channel.declare_queue(queue, self.queue_options).await?;
        channel
            .publish(&self.exchange, routing_key, payload, self.persistent)
            .await
    }
}

impl<C: Connector> Clone for Producer<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            exchange: self.exchange.clone(),
            queue_options: self.queue_options,
            persistent: self.persistent,
        }
    }
}
