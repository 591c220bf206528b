//! Scripted in-memory broker for unit testing.
//!
//! [`MockBroker`] stands in for a real broker behind the pool's
//! [`Connector`] seam. Connect outcomes can be scripted per call, live
//! connections can be killed to simulate broker restarts, and every
//! declared queue and published message is recorded for assertions.
//!
//! ## Example
//!
//! ```rust,ignore
//! use broker_testing::mock::MockBroker;
//! use broker_pool::ConnectionPool;
//!
//! #[tokio::test]
//! async fn test_degraded_startup() {
//!     let broker = MockBroker::builder().fail_next(2).build();
//!     let pool = ConnectionPool::builder(broker.connector())
//!         .pool_size(3)
//!         .retry_delay(Duration::ZERO)
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(broker.connect_calls(), 5);
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use broker_pool::{
    BrokerChannel, BrokerConnection, ConnectionConfig, Connector, QueueOptions, TransportError,
};
use parking_lot::Mutex;

/// Outcome of a single connect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Hand out a live connection.
    Succeed,
    /// Fail with a transient connect error.
    Fail,
    /// Fail with an invalid-parameters error.
    Fatal,
}

/// A message recorded by [`MockChannel::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Message body.
    pub payload: Vec<u8>,
    /// Whether persistent delivery was requested.
    pub persistent: bool,
    /// Broker-side id of the connection that carried the message.
    pub connection: u64,
}

/// A queue declaration recorded by [`MockChannel::declare_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// Queue name.
    pub name: String,
    /// Declaration options.
    pub options: QueueOptions,
}

#[derive(Debug)]
struct BrokerState {
    script: Mutex<VecDeque<ConnectOutcome>>,
    default_outcome: Mutex<ConnectOutcome>,
    connect_delay: Mutex<Duration>,
    connect_calls: AtomicU32,
    next_id: AtomicU64,
    connections: Mutex<Vec<Arc<ConnState>>>,
    declared: Mutex<Vec<DeclaredQueue>>,
    published: Mutex<Vec<PublishedMessage>>,
    fail_publish: AtomicBool,
    fail_close: AtomicBool,
    close_calls: AtomicU32,
    channels_opened: AtomicU32,
    channels_closed: AtomicU32,
}

#[derive(Debug)]
struct ConnState {
    id: u64,
    open: AtomicBool,
}

/// Builder for [`MockBroker`].
#[derive(Debug)]
pub struct MockBrokerBuilder {
    script: VecDeque<ConnectOutcome>,
    default_outcome: ConnectOutcome,
    connect_delay: Duration,
    fail_publish: bool,
    fail_close: bool,
}

impl MockBrokerBuilder {
    /// Create a builder for a broker that accepts every connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            default_outcome: ConnectOutcome::Succeed,
            connect_delay: Duration::ZERO,
            fail_publish: false,
            fail_close: false,
        }
    }

    /// Fail the next `n` connect calls.
    #[must_use]
    pub fn fail_next(mut self, n: usize) -> Self {
        self.script.extend(std::iter::repeat_n(ConnectOutcome::Fail, n));
        self
    }

    /// Accept the next `n` connect calls.
    #[must_use]
    pub fn succeed_next(mut self, n: usize) -> Self {
        self.script.extend(std::iter::repeat_n(ConnectOutcome::Succeed, n));
        self
    }

    /// Append one scripted outcome.
    #[must_use]
    pub fn then(mut self, outcome: ConnectOutcome) -> Self {
        self.script.push_back(outcome);
        self
    }

    /// Outcome once the script is exhausted.
    #[must_use]
    pub fn otherwise(mut self, outcome: ConnectOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Reject every connection that is not explicitly scripted.
    #[must_use]
    pub fn unavailable(self) -> Self {
        self.otherwise(ConnectOutcome::Fail)
    }

    /// Delay every connect call.
    #[must_use]
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Make every publish fail.
    #[must_use]
    pub fn fail_publish(mut self, fail: bool) -> Self {
        self.fail_publish = fail;
        self
    }

    /// Make every connection close fail.
    #[must_use]
    pub fn fail_close(mut self, fail: bool) -> Self {
        self.fail_close = fail;
        self
    }

    /// Build the broker.
    #[must_use]
    pub fn build(self) -> MockBroker {
        MockBroker {
            state: Arc::new(BrokerState {
                script: Mutex::new(self.script),
                default_outcome: Mutex::new(self.default_outcome),
                connect_delay: Mutex::new(self.connect_delay),
                connect_calls: AtomicU32::new(0),
                next_id: AtomicU64::new(1),
                connections: Mutex::new(Vec::new()),
                declared: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                fail_publish: AtomicBool::new(self.fail_publish),
                fail_close: AtomicBool::new(self.fail_close),
                close_calls: AtomicU32::new(0),
                channels_opened: AtomicU32::new(0),
                channels_closed: AtomicU32::new(0),
            }),
        }
    }
}

impl Default for MockBrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a scripted in-memory broker.
#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl Default for MockBroker {
    fn default() -> Self {
        MockBrokerBuilder::new().build()
    }
}

impl MockBroker {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> MockBrokerBuilder {
        MockBrokerBuilder::new()
    }

    /// A connector bound to this broker.
    #[must_use]
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    /// Number of connect calls made so far, successful or not.
    #[must_use]
    pub fn connect_calls(&self) -> u32 {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of connections handed out so far.
    #[must_use]
    pub fn connections_created(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Number of handed-out connections that are still open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state
            .connections
            .lock()
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    /// Number of `close` calls received, including failed ones.
    #[must_use]
    pub fn close_calls(&self) -> u32 {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Channels opened and closed so far.
    #[must_use]
    pub fn channel_counts(&self) -> (u32, u32) {
        (
            self.state.channels_opened.load(Ordering::SeqCst),
            self.state.channels_closed.load(Ordering::SeqCst),
        )
    }

    /// Close every live connection from the broker side.
    pub fn kill_all(&self) {
        for conn in self.state.connections.lock().iter() {
            conn.open.store(false, Ordering::SeqCst);
        }
    }

    /// Close one connection from the broker side.
    ///
    /// Returns `false` if no connection has that id.
    pub fn kill(&self, broker_id: u64) -> bool {
        self.state
            .connections
            .lock()
            .iter()
            .find(|c| c.id == broker_id)
            .map(|c| c.open.store(false, Ordering::SeqCst))
            .is_some()
    }

    /// Accept or reject connections that are not explicitly scripted.
    pub fn set_available(&self, available: bool) {
        *self.state.default_outcome.lock() = if available {
            ConnectOutcome::Succeed
        } else {
            ConnectOutcome::Fail
        };
    }

    /// Append outcomes to the connect script.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.state.script.lock().extend(outcomes);
    }

    /// Make publishes fail or succeed.
    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make connection closes fail or succeed.
    pub fn set_fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Messages published so far.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    /// Queue declarations so far.
    #[must_use]
    pub fn declared_queues(&self) -> Vec<DeclaredQueue> {
        self.state.declared.lock().clone()
    }

    fn next_outcome(&self) -> ConnectOutcome {
        self.state
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| *self.state.default_outcome.lock())
    }
}

/// [`Connector`] for a [`MockBroker`].
#[derive(Debug, Clone)]
pub struct MockConnector {
    broker: MockBroker,
}

impl MockConnector {
    /// The broker behind this connector.
    #[must_use]
    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<MockConnection, TransportError> {
        let state = &self.broker.state;
        let call = state.connect_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.broker.next_outcome() {
            ConnectOutcome::Succeed => {
                let conn = Arc::new(ConnState {
                    id: state.next_id.fetch_add(1, Ordering::SeqCst),
                    open: AtomicBool::new(true),
                });
                state.connections.lock().push(Arc::clone(&conn));
                tracing::trace!(call, broker_id = conn.id, "mock broker accepted connection");
                Ok(MockConnection {
                    broker: Arc::clone(state),
                    conn,
                })
            }
            ConnectOutcome::Fail => {
                tracing::trace!(call, "mock broker refused connection");
                Err(TransportError::Connect(format!(
                    "connection refused by {}",
                    config.address()
                )))
            }
            ConnectOutcome::Fatal => Err(TransportError::InvalidParameters(
                "mock broker rejected connection parameters".into(),
            )),
        }
    }
}

/// A connection to a [`MockBroker`].
#[derive(Debug)]
pub struct MockConnection {
    broker: Arc<BrokerState>,
    conn: Arc<ConnState>,
}

impl MockConnection {
    /// Broker-side id, independent of the pool's connection id.
    #[must_use]
    pub fn broker_id(&self) -> u64 {
        self.conn.id
    }

    /// Close this connection from the broker side.
    pub fn kill(&self) {
        self.conn.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    type Channel = MockChannel;

    fn is_open(&self) -> bool {
        self.conn.open.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> Result<MockChannel, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.broker.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockChannel {
            broker: Arc::clone(&self.broker),
            conn: Arc::clone(&self.conn),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.broker.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("close handshake failed".into()));
        }
        self.conn.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// A channel on a [`MockConnection`].
#[derive(Debug)]
pub struct MockChannel {
    broker: Arc<BrokerState>,
    conn: Arc<ConnState>,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.conn.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.declared.lock().push(DeclaredQueue {
            name: queue.to_string(),
            options,
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.broker.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("broker nacked message".into()));
        }
        self.broker.published.lock().push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            persistent,
            connection: self.conn.id,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.channels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
