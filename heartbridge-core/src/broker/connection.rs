//! Traits a broker client must provide to the bridge

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use super::error::Result;
use super::types::{ConnectionParams, Delivery, DeliveryTag, Publishing, QueueOptions};

/// Stream of deliveries for one consumer. Ends when the consumer is
/// cancelled or the owning connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens connections to a broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Connection>>;
}

/// A live broker session.
///
/// A connection is driven by exactly one task. Nothing here is meant to be
/// shared: the only sanctioned way to get work onto the owning task is the
/// [`CallbackScheduler`](super::scheduler::CallbackScheduler).
#[async_trait]
pub trait Connection: Send {
    /// Open a channel on this connection
    async fn channel(&mut self) -> Result<Box<dyn Channel>>;

    /// Service pending network events, answering heartbeats, for at most
    /// `time_limit`.
    ///
    /// Must be cancel-safe: dropping the future early leaves the connection
    /// in a consistent state.
    async fn process_data_events(&mut self, time_limit: Duration) -> Result<()>;

    /// Whether the connection is still open
    fn is_open(&self) -> bool;

    /// Close the connection. Closing an already closed connection is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// A channel (lightweight session) on a connection
#[async_trait]
pub trait Channel: Send {
    /// Declare a queue, creating it if absent
    async fn queue_declare(&mut self, queue: &str, options: QueueOptions) -> Result<()>;

    /// Enable publisher confirms
    async fn confirm_select(&mut self) -> Result<()>;

    /// Limit the number of unacknowledged deliveries
    async fn basic_qos(&mut self, prefetch_count: u16) -> Result<()>;

    /// Publish a message
    async fn basic_publish(&mut self, publishing: Publishing) -> Result<()>;

    /// Start consuming a queue
    async fn basic_consume(&mut self, queue: &str) -> Result<DeliveryStream>;

    /// Acknowledge one delivery
    async fn basic_ack(&mut self, delivery_tag: DeliveryTag) -> Result<()>;

    /// Reject one delivery
    async fn basic_nack(&mut self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()>;
}
