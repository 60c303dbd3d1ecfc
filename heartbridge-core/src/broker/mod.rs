//! Broker client abstraction
//!
//! The bridge treats the message broker as a black box that can open
//! connections and channels, pump heartbeats, publish, consume and settle
//! deliveries. [`scheduler`] provides the one sanctioned way to move work
//! onto the task that owns a connection, and [`memory`] is an in-process
//! broker used by the CLI and the test suites.

pub mod connection;
pub mod error;
pub mod memory;
pub mod scheduler;
pub mod types;

pub use connection::{Broker, Channel, Connection, DeliveryStream};
pub use error::BrokerError;
pub use memory::InMemoryBroker;
pub use scheduler::{callback_queue, CallbackQueue, CallbackScheduler, PendingCallback};
pub use types::{
    ConnectionParams, Credentials, Delivery, DeliveryTag, Message, Publishing, QueueOptions,
    DEFAULT_HEARTBEAT,
};
