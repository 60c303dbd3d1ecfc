//! Relay lifecycle
//!
//! Builds the publisher and the consumer from configuration, starts the
//! publisher first, consumes until shutdown and tears both down inbound
//! first.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use heartbridge_core::broker::Broker;
use heartbridge_core::config::Config;

use crate::consumer::{InboundBridge, RelayStats};
use crate::error::Result;
use crate::publisher::{OutboundEventLoop, PumpMode};

const PUBLISHER_CONNECTION_NAME: &str = "heartbridge-publisher";
const CONSUMER_CONNECTION_NAME: &str = "heartbridge-consumer";

/// Publisher and consumer wired together
pub struct Relay {
    consumer: InboundBridge,
    publisher: Option<Arc<OutboundEventLoop>>,
}

impl Relay {
    /// Connect both sides and start the publisher loop.
    ///
    /// With `bridge.forward = false` no publisher is created and the
    /// consumer only logs what it receives.
    pub async fn connect(
        config: &Config,
        upstream: &dyn Broker,
        downstream: &dyn Broker,
    ) -> Result<Self> {
        let publisher = if config.bridge.forward {
            let mode = if config.bridge.service_heartbeats {
                PumpMode::Service
            } else {
                PumpMode::Skip
            };
            let params = config
                .downstream
                .connection_params(PUBLISHER_CONNECTION_NAME);
            let publisher = OutboundEventLoop::connect(downstream, &params, &config.downstream.queue)
                .await?
                .with_pump_mode(mode);
            publisher.start().await?;
            Some(Arc::new(publisher))
        } else {
            info!("Forwarding disabled");
            None
        };

        let params = config.upstream.connection_params(CONSUMER_CONNECTION_NAME);
        let consumer = match InboundBridge::connect(
            upstream,
            &params,
            &config.upstream.queue,
            publisher.clone(),
        )
        .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                if let Some(publisher) = &publisher {
                    if let Err(stop_err) = publisher.stop().await {
                        warn!(error = %stop_err, "Failed to stop publisher after consumer setup failed");
                    }
                }
                return Err(e);
            }
        };

        Ok(Self {
            consumer,
            publisher,
        })
    }

    /// The publisher, when forwarding is enabled
    pub fn publisher(&self) -> Option<&Arc<OutboundEventLoop>> {
        self.publisher.as_ref()
    }

    /// Consume until `shutdown` fires, then stop the consumer and the
    /// publisher in that order
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<RelayStats> {
        info!(
            upstream = %self.consumer.queue(),
            downstream = self.publisher.as_ref().map(|p| p.queue()).unwrap_or("-"),
            "Relay running"
        );
        self.consumer.start(shutdown).await?;

        let stats = self.consumer.stats();
        info!(
            received = stats.received,
            acked = stats.acked,
            nacked = stats.nacked,
            forwarded = stats.forwarded,
            "Relay stopped"
        );
        Ok(stats)
    }

    /// Stop without running. Safe to call after `connect` failed halfway.
    pub async fn shutdown(mut self) -> Result<()> {
        self.consumer.stop().await
    }
}
