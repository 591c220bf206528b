//! Connection lifecycle management.
//!
//! This module defines the transport seam of the pool: how connections are
//! created ([`Connector`]), what the pool needs from a live connection
//! ([`BrokerConnection`]), and what a producer needs from a channel
//! ([`BrokerChannel`]). It also defines [`ConnectionHandle`], the owned
//! wrapper that carries per-connection metadata through acquire/release.

use std::ops::{Deref, DerefMut};
use std::time::Instant;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::TransportError;

/// Creates broker connections from a [`ConnectionConfig`].
///
/// `#[async_trait]` keeps the returned futures `Send` so pool operations can
/// run inside spawned tasks.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced by this connector.
    type Connection: BrokerConnection;

    /// Establish one connection.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Connection, TransportError>;
}

/// A live transport connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// The channel type opened on this connection.
    type Channel: BrokerChannel;

    /// Check if the underlying transport is still open.
    ///
    /// This is a cheap local check; it does not round-trip to the broker.
    fn is_open(&self) -> bool;

    /// Open a channel for declaring and publishing.
    async fn open_channel(&self) -> Result<Self::Channel, TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// An AMQP channel multiplexed over a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue.
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError>;

    /// Publish a payload to `exchange` with `routing_key`.
    ///
    /// Returns once the broker has accepted the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), TransportError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Options for queue declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Delete the queue once the last consumer unsubscribes.
    pub auto_delete: bool,
    /// Restrict the queue to the declaring connection.
    pub exclusive: bool,
}

impl QueueOptions {
    /// Options for a durable, shared queue.
    #[must_use]
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::durable()
    }
}

/// Metadata about a pool-managed connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier for this connection within its pool.
    pub id: u64,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last checked out or returned.
    pub last_used_at: Instant,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
}

impl ConnectionMetadata {
    /// Create metadata for a new connection.
    pub fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            checkout_count: 0,
        }
    }

    /// Mark the connection as checked out.
    pub fn mark_checkout(&mut self) {
        self.last_used_at = Instant::now();
        self.checkout_count += 1;
    }

    /// Mark the connection as returned to the pool.
    pub fn mark_checkin(&mut self) {
        self.last_used_at = Instant::now();
    }
}

/// An owned broker connection plus its pool metadata.
///
/// Exactly one owner holds a handle at a time: the pool while it is idle,
/// the caller between acquire and release.
#[derive(Debug)]
pub struct ConnectionHandle<T> {
    meta: ConnectionMetadata,
    conn: T,
}

impl<T> ConnectionHandle<T> {
    pub(crate) fn new(id: u64, conn: T) -> Self {
        Self {
            meta: ConnectionMetadata::new(id),
            conn,
        }
    }

    /// The pool-assigned connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// Connection metadata.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.meta
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut ConnectionMetadata {
        &mut self.meta
    }

    /// Take the transport connection out of the handle.
    pub fn into_inner(self) -> T {
        self.conn
    }
}

impl<T> Deref for ConnectionHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T> DerefMut for ConnectionHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.conn
    }
}
