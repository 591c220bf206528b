//! RabbitMQ container support via testcontainers.

use broker_pool::ConnectionConfig;
use testcontainers::Image;
use testcontainers::core::{ContainerPort, WaitFor};

/// AMQP port inside the container.
pub const AMQP_PORT: u16 = 5672;

/// RabbitMQ container image.
///
/// Uses the official `rabbitmq` image with a preconfigured default user.
#[derive(Debug, Clone)]
pub struct RabbitMqContainer {
    /// Default user created at boot.
    pub user: String,
    /// Password of the default user.
    pub password: String,
    /// Container tag (version).
    pub tag: String,
}

impl Default for RabbitMqContainer {
    fn default() -> Self {
        Self {
            user: "admin".to_string(),
            password: "admin".to_string(),
            tag: "3.13-alpine".to_string(),
        }
    }
}

impl RabbitMqContainer {
    /// Create a new RabbitMQ container configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default user's credentials.
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Set the container tag (RabbitMQ version).
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Connection configuration for this container's mapped AMQP port.
    #[must_use]
    pub fn connection_config(&self, host: impl Into<String>, port: u16) -> ConnectionConfig {
        ConnectionConfig::new()
            .host(host)
            .port(port)
            .credentials(self.user.clone(), self.password.clone())
    }
}

impl Image for RabbitMqContainer {
    fn name(&self) -> &str {
        "rabbitmq"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        vec![WaitFor::message_on_stdout("Server startup complete")]
    }

    fn env_vars(
        &self,
    ) -> impl IntoIterator<
        Item = (
            impl Into<std::borrow::Cow<'_, str>>,
            impl Into<std::borrow::Cow<'_, str>>,
        ),
    > {
        vec![
            ("RABBITMQ_DEFAULT_USER", self.user.as_str()),
            ("RABBITMQ_DEFAULT_PASS", self.password.as_str()),
        ]
    }

    fn expose_ports(&self) -> &[ContainerPort] {
        &[ContainerPort::Tcp(AMQP_PORT)]
    }
}
