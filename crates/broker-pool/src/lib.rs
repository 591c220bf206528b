//! # broker-pool
//!
//! Connection pool for message brokers with bounded startup retries.
//!
//! The pool keeps a LIFO cache of live broker connections. It is filled
//! once at startup, lends connections to callers, discards connections that
//! closed while cached, and opens connections on demand when the cache runs
//! dry. It is a cache, not an admission gate: `acquire` never waits.
//!
//! ## Features
//!
//! - Startup fill with exponential backoff and jitter, bounded attempts
//! - Degraded startup: an unreachable broker leaves an empty pool instead
//!   of failing the host service
//! - Stale-connection discard on acquire and release
//! - Scoped [`PooledConnection`] guards that release on drop
//! - Background health monitor that prunes and replenishes
//! - [`Producer`] for declare-and-publish with guaranteed release
//!
//! The transport is pluggable through [`Connector`]; `broker-amqp` provides
//! the AMQP 0-9-1 implementation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use broker_pool::{ConnectionConfig, ConnectionPool, Producer};
//! use broker_amqp::AmqpConnector;
//!
//! let pool = ConnectionPool::builder(AmqpConnector::new())
//!     .connection_config(ConnectionConfig::from_env()?)
//!     .pool_size(5)
//!     .max_retries(30)
//!     .build()
//!     .await?;
//!
//! let producer = Producer::new(pool.clone());
//! producer.publish("bulk_products", "bulk_products", b"...").await?;
//!
//! pool.close_all().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod producer;

pub use config::{ConnectionConfig, Credentials, PoolConfig, RetryPolicy};
pub use error::{PoolError, PublishError, TransportError};
pub use lifecycle::{
    BrokerChannel, BrokerConnection, ConnectionHandle, ConnectionMetadata, Connector, QueueOptions,
};
pub use pool::{
    ConnectionPool, FillReport, Handle, HealthReport, PoolBuilder, PoolStatus, PooledConnection,
};
pub use producer::Producer;
