//! Inbound bridge: consumes one queue and forwards each item downstream

use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use heartbridge_core::broker::{
    Broker, Channel, Connection, ConnectionParams, Delivery, Message, QueueOptions,
};

use crate::error::{RelayError, Result};
use crate::publisher::OutboundEventLoop;

/// Unacknowledged deliveries the broker may push at once
const PREFETCH_COUNT: u16 = 1;

/// How one delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handled and acknowledged; `forwarded` tells whether it was handed to
    /// the publisher or only logged
    Acked { forwarded: bool },
    /// Handling failed; rejected without requeue
    Nacked { reason: String },
}

/// Counters kept by an [`InboundBridge`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub forwarded: u64,
}

/// Consumer: owns the inbound connection
pub struct InboundBridge {
    queue: String,
    connection: Box<dyn Connection>,
    channel: Option<Box<dyn Channel>>,
    publisher: Option<Arc<OutboundEventLoop>>,
    stats: RelayStats,
}

impl InboundBridge {
    /// Open the inbound connection, declare the source queue and limit
    /// in-flight deliveries to one
    pub async fn connect(
        broker: &dyn Broker,
        params: &ConnectionParams,
        queue: impl Into<String>,
        publisher: Option<Arc<OutboundEventLoop>>,
    ) -> Result<Self> {
        let queue = queue.into();
        let mut connection = broker.connect(params).await?;
        let mut channel = connection.channel().await?;
        channel
            .queue_declare(&queue, QueueOptions::auto_delete())
            .await?;
        channel.basic_qos(PREFETCH_COUNT).await?;

        info!(
            host = %params.host,
            queue = %queue,
            forwarding = publisher.is_some(),
            "Consumer connected"
        );

        Ok(Self {
            queue,
            connection,
            channel: Some(channel),
            publisher,
            stats: RelayStats::default(),
        })
    }

    /// Source queue
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Counters so far
    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Consume until `shutdown` fires or the broker ends the consumer, then
    /// [`stop`](Self::stop). Failures inside the receive loop are logged,
    /// not returned; the result is that of `stop`.
    pub async fn start(&mut self, shutdown: CancellationToken) -> Result<()> {
        let span = info_span!("consumer", queue = %self.queue);
        async {
            match self.consume(&shutdown).await {
                Ok(()) => {}
                Err(RelayError::AlreadyStarted) => return Err(RelayError::AlreadyStarted),
                Err(e) => error!(error = %e, "Consumer loop failed"),
            }
            self.stop().await
        }
        .instrument(span)
        .await
    }

    async fn consume(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let channel = self.channel.as_mut().ok_or(RelayError::AlreadyStarted)?;
        let mut deliveries = channel.basic_consume(&self.queue).await?;
        info!("Waiting for messages. To exit press CTRL+C");

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.on_delivery(delivery).await?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    info!("Consumer cancelled by the broker");
                    return Ok(());
                }
            }
        }
    }

    /// Handle one delivery: forward it if a publisher is configured, then ack.
    /// Any handling failure is settled with a nack without requeue.
    ///
    /// Errors only when the settlement itself cannot reach the broker.
    pub async fn on_delivery(&mut self, delivery: Delivery) -> Result<DeliveryOutcome> {
        let tag = delivery.delivery_tag;
        let redelivered = delivery.redelivered;
        let message = delivery.into_message();
        self.stats.received += 1;

        let handled = self.handle(&message);
        let channel = self.channel.as_mut().ok_or(RelayError::AlreadyStarted)?;

        match handled {
            Ok(forwarded) => {
                channel.basic_ack(tag).await?;
                self.stats.acked += 1;
                if forwarded {
                    self.stats.forwarded += 1;
                }
                Ok(DeliveryOutcome::Acked { forwarded })
            }
            Err(e) => {
                error!(
                    delivery_tag = %tag,
                    redelivered,
                    payload = %String::from_utf8_lossy(&message.body),
                    error = %e,
                    "Failed to handle message, rejecting"
                );
                channel.basic_nack(tag, false).await?;
                self.stats.nacked += 1;
                Ok(DeliveryOutcome::Nacked {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn handle(&self, message: &Message) -> Result<bool> {
        let text = message.text()?;
        info!(payload = %text, "Received message");

        match &self.publisher {
            Some(publisher) => {
                publisher.publish(message.body.clone())?;
                Ok(true)
            }
            None => {
                info!("No publisher configured, message only logged");
                Ok(false)
            }
        }
    }

    /// Close the inbound connection and stop the publisher. Safe to call
    /// more than once.
    pub async fn stop(&mut self) -> Result<()> {
        let mut outcome = Ok(());

        self.channel = None;
        if self.connection.is_open() {
            match self.connection.close().await {
                Ok(()) => info!(queue = %self.queue, "Inbound connection closed"),
                Err(e) => {
                    warn!(error = %e, "Failed to close inbound connection");
                    outcome = Err(e.into());
                }
            }
        }

        if let Some(publisher) = &self.publisher {
            let stopped = publisher.stop().await;
            if outcome.is_ok() {
                outcome = stopped;
            }
        }
        outcome
    }
}
