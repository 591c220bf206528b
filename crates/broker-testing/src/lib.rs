//! # broker-testing
//!
//! Test infrastructure for the broker connection pool.
//!
//! This crate provides a scripted in-memory broker for unit tests and a
//! RabbitMQ testcontainer for integration tests.
//!
//! ## Features
//!
//! - Mock connector with per-call connect outcomes (succeed, fail, fatal)
//! - Broker-side connection kills to simulate restarts and stale connections
//! - Recording of queue declarations and published messages
//! - RabbitMQ container management via testcontainers
//! - Queue-name and pool-config fixtures
//!
//! ## Mock Broker Example
//!
//! ```rust,ignore
//! use broker_testing::mock::MockBroker;
//! use broker_testing::fixtures;
//!
//! #[tokio::test]
//! async fn test_with_mock_broker() {
//!     let broker = MockBroker::builder().fail_next(2).build();
//!     let pool = ConnectionPool::initialize(
//!         broker.connector(),
//!         fixtures::mock_connection_config(),
//!         fixtures::pool_config(5, 30),
//!     )
//!     .await
//!     .unwrap();
//!     assert_eq!(pool.idle_count(), 5);
//! }
//! ```
//!
//! ## Container Example
//!
//! ```rust,ignore
//! use broker_testing::RabbitMqContainer;
//! use testcontainers::runners::AsyncRunner;
//!
//! #[tokio::test]
//! async fn test_with_real_broker() {
//!     let image = RabbitMqContainer::default();
//!     let container = image.clone().start().await.unwrap();
//!     let port = container.get_host_port_ipv4(5672).await.unwrap();
//!     let config = image.connection_config("127.0.0.1", port);
//!     // Build a pool with AmqpConnector...
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod container;
pub mod fixtures;
pub mod mock;

pub use container::RabbitMqContainer;
pub use fixtures::QueueFixture;
pub use mock::{
    ConnectOutcome, DeclaredQueue, MockBroker, MockBrokerBuilder, MockChannel, MockConnection,
    MockConnector, PublishedMessage,
};
