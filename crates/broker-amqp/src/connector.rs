//! Opening AMQP connections from a [`ConnectionConfig`].

use std::time::Duration;

use async_trait::async_trait;
use broker_pool::{ConnectionConfig, Connector, TransportError};
use lapin::uri::AMQPUri;
use lapin::{Connection, ConnectionProperties};

use crate::connection::AmqpConnection;

/// [`Connector`] that opens lapin connections.
///
/// Each [`connect`](Connector::connect) call makes up to
/// `connection_attempts` attempts, sleeping `retry_delay` between them, and
/// bounds every attempt by `connection_timeout`.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl AmqpConnector {
    /// Create a connector with default connection properties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector with custom lapin connection properties
    /// (executor, reactor, client properties).
    #[must_use]
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }

    async fn connect_once(
        &self,
        uri: AMQPUri,
        timeout: Duration,
    ) -> Result<AmqpConnection, TransportError> {
        match tokio::time::timeout(timeout, Connection::connect_uri(uri, self.properties.clone()))
            .await
        {
            Ok(Ok(conn)) => Ok(AmqpConnection::new(conn)),
            Ok(Err(e)) => Err(TransportError::Connect(e.to_string())),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

impl std::fmt::Debug for AmqpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<AmqpConnection, TransportError> {
        let uri = amqp_uri(config)?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.connect_once(uri.clone(), config.connection_timeout).await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < config.connection_attempts => {
                    tracing::debug!(
                        address = %config.address(),
                        attempt,
                        error = %e,
                        "AMQP connect attempt failed"
                    );
                    tokio::time::sleep(config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build the AMQP URI for `config`.
///
/// Parameters are set field by field rather than formatted into a string,
/// so credentials and virtual hosts need no escaping.
pub fn amqp_uri(config: &ConnectionConfig) -> Result<AMQPUri, TransportError> {
    config
        .validate()
        .map_err(|e| TransportError::InvalidParameters(e.to_string()))?;

    let heartbeat = u16::try_from(config.heartbeat.as_secs()).map_err(|_| {
        TransportError::InvalidParameters(format!(
            "heartbeat {:?} exceeds {}s",
            config.heartbeat,
            u16::MAX
        ))
    })?;
    let connection_timeout = u64::try_from(config.connection_timeout.as_millis())
        .map_err(|_| TransportError::InvalidParameters("connection_timeout overflows".into()))?;

    let mut uri = AMQPUri::default();
    uri.authority.host = config.host.clone();
    uri.authority.port = config.port;
    uri.authority.userinfo.username = config.credentials.username.clone();
    uri.authority.userinfo.password = config.credentials.password.clone();
    uri.vhost = config.virtual_host.clone();
    uri.query.heartbeat = Some(heartbeat);
    uri.query.connection_timeout = Some(connection_timeout);
    Ok(uri)
}
