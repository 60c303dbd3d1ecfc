#![allow(dead_code)]

use heartbridge_core::broker::{ConnectionParams, InMemoryBroker};
use heartbridge_relay::{InboundBridge, OutboundEventLoop, RelayStats};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

pub const UPSTREAM_HOST: &str = "rabbitmq_upstream";
pub const DOWNSTREAM_HOST: &str = "rabbitmq_downstream";
pub const UPSTREAM_QUEUE: &str = "upstream_queue";
pub const DOWNSTREAM_QUEUE: &str = "downstream_queue";
pub const DOWNSTREAM_HEARTBEAT: Duration = Duration::from_secs(10);

pub fn downstream_params() -> ConnectionParams {
    ConnectionParams::new(DOWNSTREAM_HOST).with_heartbeat(DOWNSTREAM_HEARTBEAT)
}

pub fn upstream_params() -> ConnectionParams {
    ConnectionParams::new(UPSTREAM_HOST)
}

pub async fn started_publisher(broker: &InMemoryBroker) -> Arc<OutboundEventLoop> {
    let publisher = OutboundEventLoop::connect(broker, &downstream_params(), DOWNSTREAM_QUEUE)
        .await
        .expect("connect publisher");
    publisher.start().await.expect("start publisher");
    Arc::new(publisher)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A consumer running on its own task
pub struct RunningBridge {
    shutdown: CancellationToken,
    task: JoinHandle<(InboundBridge, heartbridge_relay::Result<()>)>,
}

impl RunningBridge {
    pub async fn spawn(
        broker: &InMemoryBroker,
        publisher: Option<Arc<OutboundEventLoop>>,
    ) -> Self {
        let mut bridge = InboundBridge::connect(broker, &upstream_params(), UPSTREAM_QUEUE, publisher)
            .await
            .expect("connect consumer");
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = bridge.start(token).await;
            (bridge, result)
        });
        Self { shutdown, task }
    }

    /// Request shutdown and wait for the stop cascade
    pub async fn shutdown(self) -> (InboundBridge, RelayStats) {
        self.shutdown.cancel();
        let (bridge, result) = self.task.await.expect("consumer task");
        result.expect("consumer stop");
        let stats = bridge.stats();
        (bridge, stats)
    }
}

/// Every published item has been settled one way or the other
pub fn settled(broker: &InMemoryBroker) -> bool {
    broker.queue_depth(UPSTREAM_QUEUE) == 0 && broker.unacked_count(UPSTREAM_QUEUE) == 0
}
