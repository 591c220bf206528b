//! lapin-backed connection and channel.

use async_trait::async_trait;
use broker_pool::{BrokerChannel, BrokerConnection, QueueOptions, TransportError};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// AMQP delivery mode for messages that survive a broker restart.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// A pooled AMQP connection.
pub struct AmqpConnection {
    inner: Connection,
}

impl AmqpConnection {
    pub(crate) fn new(inner: Connection) -> Self {
        Self { inner }
    }

    /// The underlying lapin connection.
    #[must_use]
    pub fn inner(&self) -> &Connection {
        &self.inner
    }
}

impl std::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("connected", &self.inner.status().connected())
            .finish()
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn open_channel(&self) -> Result<AmqpChannel, TransportError> {
        let channel = self.inner.create_channel().await.map_err(channel_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_error)?;
        Ok(AmqpChannel { inner: channel })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(connection_error)
    }
}

/// A channel with publisher confirms enabled.
pub struct AmqpChannel {
    inner: Channel,
}

impl AmqpChannel {
    /// The underlying lapin channel.
    #[must_use]
    pub fn inner(&self) -> &Channel {
        &self.inner
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            ..QueueDeclareOptions::default()
        };
        self.inner
            .queue_declare(queue, declare, FieldTable::default())
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), TransportError> {
        let mut properties = BasicProperties::default();
        if persistent {
            properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        if confirm.is_nack() {
            return Err(TransportError::Publish(format!(
                "broker rejected message for routing key '{routing_key}'"
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(channel_error)
    }
}

fn is_closed_state(err: &lapin::Error) -> bool {
    matches!(err, lapin::Error::InvalidConnectionState(..))
}

fn connection_error(err: lapin::Error) -> TransportError {
    if is_closed_state(&err) {
        TransportError::Closed
    } else {
        TransportError::Connect(err.to_string())
    }
}

fn channel_error(err: lapin::Error) -> TransportError {
    if is_closed_state(&err) {
        TransportError::Closed
    } else {
        TransportError::Channel(err.to_string())
    }
}

fn publish_error(err: lapin::Error) -> TransportError {
    if is_closed_state(&err) {
        TransportError::Closed
    } else {
        TransportError::Publish(err.to_string())
    }
}
