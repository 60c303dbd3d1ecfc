//! Wire-level types exchanged with a broker

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::Utf8Error;
use std::time::Duration;

/// Heartbeat used when the connection parameters leave it unset
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Default AMQP port
pub const DEFAULT_PORT: u16 = 5672;

/// Name of the default (direct, routing-key = queue name) exchange
pub const DEFAULT_EXCHANGE: &str = "";

/// Login credentials for a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("guest", "guest")
    }
}

/// Parameters needed to open one broker connection
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Virtual host (namespace) on the broker
    pub virtual_host: String,
    /// Login credentials
    pub credentials: Credentials,
    /// Requested heartbeat interval (None = broker default)
    pub heartbeat: Option<Duration>,
    /// Client-provided connection name shown by the broker
    pub connection_name: Option<String>,
}

impl ConnectionParams {
    /// Create parameters for a host with default port, vhost and credentials
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            virtual_host: "/".to_string(),
            credentials: Credentials::default(),
            heartbeat: None,
            connection_name: None,
        }
    }

    /// Set the virtual host
    pub fn with_virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.virtual_host = vhost.into();
        self
    }

    /// Set the login credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Request a heartbeat interval
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Set the client-provided connection name
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Heartbeat interval that will actually be negotiated
    pub fn effective_heartbeat(&self) -> Duration {
        self.heartbeat.unwrap_or(DEFAULT_HEARTBEAT)
    }
}

/// Flags used when declaring a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Non-durable queue removed once its last consumer goes away
    pub fn auto_delete() -> Self {
        Self {
            auto_delete: true,
            ..Self::default()
        }
    }
}

/// A single publish request
#[derive(Debug, Clone)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    /// Fail the publish instead of dropping it when no queue matches
    pub mandatory: bool,
}

impl Publishing {
    /// Publish to a queue through the default exchange
    pub fn to_queue(queue: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: queue.into(),
            body: body.into(),
            mandatory: false,
        }
    }

    /// Mark the publish as mandatory
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Broker-assigned identifier of one delivery on one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An item pushed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub routing_key: String,
    pub body: Bytes,
    /// Whether this item was delivered before and requeued
    pub redelivered: bool,
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    /// Convert into the opaque message handed to the bridge
    pub fn into_message(self) -> Message {
        Message {
            body: self.body,
            delivery_tag: Some(self.delivery_tag),
        }
    }
}

/// Opaque payload, tagged when it came from an inbound delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Bytes,
    pub delivery_tag: Option<DeliveryTag>,
}

impl Message {
    /// Create an untagged message
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            delivery_tag: None,
        }
    }

    /// Decode the payload as UTF-8 text
    pub fn text(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}
