//! # broker-amqp
//!
//! AMQP 0-9-1 transport for `broker-pool`, built on [`lapin`].
//!
//! [`AmqpConnector`] turns a [`broker_pool::ConnectionConfig`] into lapin
//! connections; [`AmqpConnection`] and [`AmqpChannel`] implement the pool's
//! lifecycle traits. Channels are opened with publisher confirms, so a
//! publish only succeeds once the broker has acknowledged the message.
//!
//! ## Example
//!
//! ```rust,ignore
//! use broker_amqp::AmqpConnector;
//! use broker_pool::{ConnectionConfig, ConnectionPool, Producer};
//!
//! let pool = ConnectionPool::builder(AmqpConnector::new())
//!     .connection_config(ConnectionConfig::from_env()?)
//!     .build()
//!     .await?;
//!
//! Producer::new(pool)
//!     .publish("bulk_products", "bulk_products", br#"{"sku":"A-1"}"#)
//!     .await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod connector;

pub use connection::{AmqpChannel, AmqpConnection};
pub use connector::{AmqpConnector, amqp_uri};

/// Pool over AMQP connections.
pub type AmqpPool = broker_pool::ConnectionPool<AmqpConnector>;

/// Producer over AMQP connections.
pub type AmqpProducer = broker_pool::Producer<AmqpConnector>;
