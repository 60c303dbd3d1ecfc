//! In-process broker
//!
//! Implements the [`Broker`], [`Connection`] and [`Channel`] traits against
//! shared in-memory state. It follows the AMQP semantics the bridge relies on
//! (queue declaration, prefetch, ack/nack, publisher confirms, auto-delete and
//! heartbeat enforcement) closely enough to exercise the bridge end to end,
//! and exposes a few inspection helpers for tests and demos.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection::{Broker, Channel, Connection, DeliveryStream};
use super::error::{BrokerError, Result};
use super::types::{
    ConnectionParams, Credentials, Delivery, DeliveryTag, Publishing, QueueOptions,
    DEFAULT_EXCHANGE,
};

/// Number of heartbeat intervals a client may stay silent before the broker
/// drops it.
pub const MISSED_HEARTBEATS: u32 = 2;

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    host: String,
    virtual_hosts: Vec<String>,
    users: HashMap<String, String>,
    inner: Mutex<BrokerInner>,
    changed: watch::Sender<u64>,
    next_connection_id: AtomicU64,
}

#[derive(Default)]
struct BrokerInner {
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionEntry>,
    dropped: HashMap<String, usize>,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<QueuedMessage>,
    consumers: usize,
    max_length: Option<usize>,
}

struct QueuedMessage {
    body: Bytes,
    redelivered: bool,
}

struct ConnectionEntry {
    name: Option<String>,
    /// Zero disables heartbeat enforcement
    heartbeat: Duration,
    last_activity: Instant,
    closed: Option<String>,
    next_channel: u64,
    channels: HashMap<u64, ChannelEntry>,
}

#[derive(Default)]
struct ChannelEntry {
    prefetch: u16,
    confirm: bool,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    /// consumer tag -> queue
    consumers: HashMap<String, String>,
}

struct Unacked {
    queue: String,
    body: Bytes,
}

enum NextDelivery {
    Ready(Delivery),
    Wait,
    Ended,
}

impl InMemoryBroker {
    /// Create a broker reachable as `host`, with vhost `/` and user `guest`
    pub fn new(host: impl Into<String>) -> Self {
        let defaults = Credentials::default();
        let mut users = HashMap::new();
        users.insert(defaults.username, defaults.password);
        let (changed, _) = watch::channel(0);

        Self {
            state: Arc::new(BrokerState {
                host: host.into(),
                virtual_hosts: vec!["/".to_string()],
                users,
                inner: Mutex::new(BrokerInner::default()),
                changed,
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Host name this broker answers to
    pub fn host(&self) -> &str {
        &self.state.host
    }

    /// Declare a queue from outside any connection
    pub fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        self.state.inner.lock().declare(queue, options)
    }

    /// Reject publishes once `queue` holds `max_length` ready messages
    pub fn limit_queue(&self, queue: &str, max_length: usize) -> Result<()> {
        let mut inner = self.state.inner.lock();
        let state = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| no_queue(queue))?;
        state.max_length = Some(max_length);
        Ok(())
    }

    /// Put a message straight onto a queue, as the management UI would
    pub fn publish_to(&self, queue: &str, body: impl Into<Bytes>) -> Result<()> {
        {
            let mut inner = self.state.inner.lock();
            let state = inner
                .queues
                .get_mut(queue)
                .ok_or_else(|| no_queue(queue))?;
            state.ready.push_back(QueuedMessage {
                body: body.into(),
                redelivered: false,
            });
        }
        self.state.bump();
        Ok(())
    }

    /// Ready (not yet delivered) messages on a queue, oldest first
    pub fn peek(&self, queue: &str) -> Vec<Bytes> {
        let inner = self.state.inner.lock();
        inner
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of ready messages on a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        let inner = self.state.inner.lock();
        inner.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Whether a queue currently exists
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.inner.lock().queues.contains_key(queue)
    }

    /// Number of consumers attached to a queue
    pub fn consumer_count(&self, queue: &str) -> usize {
        let inner = self.state.inner.lock();
        inner.queues.get(queue).map(|q| q.consumers).unwrap_or(0)
    }

    /// Deliveries from `queue` still waiting for an ack or nack
    pub fn unacked_count(&self, queue: &str) -> usize {
        let inner = self.state.inner.lock();
        inner
            .connections
            .values()
            .flat_map(|c| c.channels.values())
            .flat_map(|ch| ch.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Messages from `queue` rejected without requeue
    pub fn dropped_count(&self, queue: &str) -> usize {
        let inner = self.state.inner.lock();
        inner.dropped.get(queue).copied().unwrap_or(0)
    }

    /// Number of open connections. Connections that missed their heartbeats
    /// are closed as a side effect.
    pub fn open_connections(&self) -> usize {
        let mut inner = self.state.inner.lock();
        let ids: Vec<u64> = inner.connections.keys().copied().collect();
        let open = ids
            .into_iter()
            .filter(|id| inner.check_alive(*id).is_ok())
            .count();
        drop(inner);
        self.state.bump();
        open
    }

    /// Delete a queue, cancelling its consumers
    pub fn delete_queue(&self, queue: &str) -> bool {
        let removed = self.state.inner.lock().delete_queue(queue);
        self.state.bump();
        removed
    }

    /// Close every client connection from the broker side
    pub fn force_close_connections(&self, reason: &str) {
        {
            let mut inner = self.state.inner.lock();
            let ids: Vec<u64> = inner.connections.keys().copied().collect();
            for id in ids {
                inner.close_connection(id, reason.to_string());
            }
        }
        self.state.bump();
    }

    /// Allow another user to log in
    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state
                .users
                .insert(username.to_string(), password.to_string());
        }
        self
    }

    /// Create another virtual host
    pub fn with_virtual_host(mut self, vhost: &str) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.virtual_hosts.push(vhost.to_string());
        }
        self
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Connection>> {
        let state = &self.state;
        if params.host != state.host {
            return Err(BrokerError::ConnectionFailed(format!(
                "could not resolve host '{}'",
                params.host
            )));
        }
        if !state.virtual_hosts.contains(&params.virtual_host) {
            return Err(BrokerError::AccessRefused(format!(
                "vhost '{}' not found",
                params.virtual_host
            )));
        }
        let Credentials { username, password } = &params.credentials;
        if state.users.get(username) != Some(password) {
            return Err(BrokerError::AccessRefused(format!(
                "login refused for user '{}'",
                username
            )));
        }

        let id = state.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let heartbeat = params.effective_heartbeat();
        state.inner.lock().connections.insert(
            id,
            ConnectionEntry {
                name: params.connection_name.clone(),
                heartbeat,
                last_activity: Instant::now(),
                closed: None,
                next_channel: 1,
                channels: HashMap::new(),
            },
        );
        debug!(
            host = %state.host,
            connection = id,
            heartbeat_s = heartbeat.as_secs(),
            "Connection opened"
        );

        Ok(Box::new(InMemoryConnection {
            state: Arc::clone(state),
            id,
            heartbeat,
        }))
    }
}

impl BrokerState {
    fn bump(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }
}

impl BrokerInner {
    fn check_alive(&mut self, conn: u64) -> Result<()> {
        let entry = self
            .connections
            .get(&conn)
            .ok_or_else(|| BrokerError::closed("unknown connection"))?;
        if let Some(reason) = &entry.closed {
            return Err(BrokerError::closed(reason.clone()));
        }
        let expired = match entry.heartbeat.checked_mul(MISSED_HEARTBEATS) {
            Some(timeout) if !timeout.is_zero() => entry.last_activity.elapsed() > timeout,
            _ => false,
        };
        if expired {
            let reason = format!(
                "missed heartbeats from client, timeout: {}s",
                entry.heartbeat.as_secs()
            );
            warn!(
                connection = conn,
                name = entry.name.as_deref().unwrap_or(""),
                "{}",
                reason
            );
            self.close_connection(conn, reason.clone());
            return Err(BrokerError::closed(reason));
        }
        Ok(())
    }

    fn touch(&mut self, conn: u64) -> Result<()> {
        self.check_alive(conn)?;
        if let Some(entry) = self.connections.get_mut(&conn) {
            entry.last_activity = Instant::now();
        }
        Ok(())
    }

    fn channel_mut(&mut self, conn: u64, chan: u64) -> Result<&mut ChannelEntry> {
        self.touch(conn)?;
        self.connections
            .get_mut(&conn)
            .and_then(|c| c.channels.get_mut(&chan))
            .ok_or_else(|| BrokerError::ChannelClosed(format!("channel {} is closed", chan)))
    }

    fn declare(&mut self, queue: &str, options: QueueOptions) -> Result<()> {
        if queue.is_empty() {
            return Err(BrokerError::PreconditionFailed(
                "queue name must not be empty".to_string(),
            ));
        }
        match self.queues.get(queue) {
            Some(existing) if existing.options != options => {
                Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{}'",
                    queue
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    queue.to_string(),
                    QueueState {
                        options,
                        ready: VecDeque::new(),
                        consumers: 0,
                        max_length: None,
                    },
                );
                debug!(queue, "Queue declared");
                Ok(())
            }
        }
    }

    fn publish(&mut self, conn: u64, chan: u64, publishing: Publishing) -> Result<()> {
        let confirm = self.channel_mut(conn, chan)?.confirm;
        if publishing.exchange != DEFAULT_EXCHANGE {
            return Err(BrokerError::NotFound(format!(
                "no exchange '{}'",
                publishing.exchange
            )));
        }

        let Some(queue) = self.queues.get_mut(&publishing.routing_key) else {
            if publishing.mandatory && confirm {
                return Err(BrokerError::Unroutable(publishing.routing_key));
            }
            debug!(routing_key = %publishing.routing_key, "Unroutable message dropped");
            return Ok(());
        };

        if queue.max_length.is_some_and(|max| queue.ready.len() >= max) {
            if confirm {
                return Err(BrokerError::PublishNacked(format!(
                    "queue '{}' is full",
                    publishing.routing_key
                )));
            }
            debug!(queue = %publishing.routing_key, "Queue full, message dropped");
            return Ok(());
        }

        queue.ready.push_back(QueuedMessage {
            body: publishing.body,
            redelivered: false,
        });
        Ok(())
    }

    fn consume(&mut self, conn: u64, chan: u64, queue: &str) -> Result<String> {
        self.channel_mut(conn, chan)?;
        let state = self.queues.get_mut(queue).ok_or_else(|| no_queue(queue))?;
        state.consumers += 1;

        let tag = format!("ctag-{}", uuid::Uuid::new_v4().simple());
        if let Some(channel) = self
            .connections
            .get_mut(&conn)
            .and_then(|c| c.channels.get_mut(&chan))
        {
            channel.consumers.insert(tag.clone(), queue.to_string());
        }
        Ok(tag)
    }

    fn next_delivery(&mut self, conn: u64, chan: u64, consumer_tag: &str) -> Result<NextDelivery> {
        let channel = self.channel_mut(conn, chan)?;
        let Some(queue_name) = channel.consumers.get(consumer_tag).cloned() else {
            return Ok(NextDelivery::Ended);
        };
        if channel.prefetch > 0 && channel.unacked.len() >= usize::from(channel.prefetch) {
            return Ok(NextDelivery::Wait);
        }

        let Some(message) = self
            .queues
            .get_mut(&queue_name)
            .and_then(|q| q.ready.pop_front())
        else {
            return Ok(NextDelivery::Wait);
        };

        let channel = self.channel_mut(conn, chan)?;
        channel.next_tag += 1;
        let tag = channel.next_tag;
        channel.unacked.insert(
            tag,
            Unacked {
                queue: queue_name.clone(),
                body: message.body.clone(),
            },
        );

        Ok(NextDelivery::Ready(Delivery {
            delivery_tag: DeliveryTag(tag),
            routing_key: queue_name,
            body: message.body,
            redelivered: message.redelivered,
            received_at: Utc::now(),
        }))
    }

    fn settle(&mut self, conn: u64, chan: u64, tag: DeliveryTag, requeue: Option<bool>) -> Result<()> {
        let unacked = self
            .channel_mut(conn, chan)?
            .unacked
            .remove(&tag.0)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;

        match requeue {
            None => {}
            Some(true) => {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(QueuedMessage {
                        body: unacked.body,
                        redelivered: true,
                    });
                }
            }
            Some(false) => {
                *self.dropped.entry(unacked.queue).or_default() += 1;
            }
        }
        Ok(())
    }

    fn cancel_consumer(&mut self, conn: u64, chan: u64, consumer_tag: &str) {
        let queue = self
            .connections
            .get_mut(&conn)
            .and_then(|c| c.channels.get_mut(&chan))
            .and_then(|ch| ch.consumers.remove(consumer_tag));
        if let Some(queue) = queue {
            self.remove_consumer(&queue);
        }
    }

    fn close_channel(&mut self, conn: u64, chan: u64) {
        let channel = self
            .connections
            .get_mut(&conn)
            .and_then(|c| c.channels.remove(&chan));
        if let Some(channel) = channel {
            self.release_channel(channel);
        }
    }

    fn close_connection(&mut self, conn: u64, reason: String) {
        let Some(entry) = self.connections.get_mut(&conn) else {
            return;
        };
        if entry.closed.is_some() {
            return;
        }
        debug!(connection = conn, reason = %reason, "Connection closed");
        entry.closed = Some(reason);
        let channels = std::mem::take(&mut entry.channels);
        for channel in channels.into_values() {
            self.release_channel(channel);
        }
    }

    /// Close `conn` and drop its entry. Only the client side forgets a
    /// connection; broker-side closes keep the reason for the handle to read.
    fn forget_connection(&mut self, conn: u64, reason: &str) {
        self.close_connection(conn, reason.to_string());
        self.connections.remove(&conn);
    }

    /// Requeue a channel's unacked deliveries and drop its consumers
    fn release_channel(&mut self, channel: ChannelEntry) {
        for unacked in channel.unacked.into_values().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(QueuedMessage {
                    body: unacked.body,
                    redelivered: true,
                });
            }
        }
        for queue in channel.consumers.into_values() {
            self.remove_consumer(&queue);
        }
    }

    fn remove_consumer(&mut self, queue: &str) {
        let delete = match self.queues.get_mut(queue) {
            Some(state) => {
                state.consumers = state.consumers.saturating_sub(1);
                state.consumers == 0 && state.options.auto_delete
            }
            None => false,
        };
        if delete {
            self.queues.remove(queue);
            debug!(queue, "Auto-delete queue removed");
        }
    }

    fn delete_queue(&mut self, queue: &str) -> bool {
        if self.queues.remove(queue).is_none() {
            return false;
        }
        for connection in self.connections.values_mut() {
            for channel in connection.channels.values_mut() {
                channel.consumers.retain(|_, q| q != queue);
            }
        }
        true
    }
}

fn no_queue(queue: &str) -> BrokerError {
    BrokerError::NotFound(format!("no queue '{}' in vhost", queue))
}

/// Connection to an [`InMemoryBroker`]
pub struct InMemoryConnection {
    state: Arc<BrokerState>,
    id: u64,
    heartbeat: Duration,
}

impl InMemoryConnection {
    /// Broker-assigned connection id
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn channel(&mut self) -> Result<Box<dyn Channel>> {
        let chan = {
            let mut inner = self.state.inner.lock();
            inner.touch(self.id)?;
            let entry = inner
                .connections
                .get_mut(&self.id)
                .ok_or_else(|| BrokerError::closed("unknown connection"))?;
            let chan = entry.next_channel;
            entry.next_channel += 1;
            entry.channels.insert(chan, ChannelEntry::default());
            chan
        };

        Ok(Box::new(InMemoryChannel {
            state: Arc::clone(&self.state),
            conn: self.id,
            id: chan,
            heartbeat: self.heartbeat,
        }))
    }

    async fn process_data_events(&mut self, time_limit: Duration) -> Result<()> {
        let deadline = Instant::now() + time_limit;
        let step = service_step(self.heartbeat, time_limit);
        loop {
            self.state.inner.lock().touch(self.id)?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep(step.min(deadline - now)).await;
        }
    }

    fn is_open(&self) -> bool {
        let alive = self.state.inner.lock().check_alive(self.id).is_ok();
        if !alive {
            self.state.bump();
        }
        alive
    }

    async fn close(&mut self) -> Result<()> {
        self.state
            .inner
            .lock()
            .forget_connection(self.id, "closed by client");
        self.state.bump();
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.state
            .inner
            .lock()
            .forget_connection(self.id, "connection dropped by client");
        self.state.bump();
    }
}

/// Channel on an [`InMemoryConnection`]
pub struct InMemoryChannel {
    state: Arc<BrokerState>,
    conn: u64,
    id: u64,
    heartbeat: Duration,
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn queue_declare(&mut self, queue: &str, options: QueueOptions) -> Result<()> {
        let mut inner = self.state.inner.lock();
        inner.channel_mut(self.conn, self.id)?;
        inner.declare(queue, options)
    }

    async fn confirm_select(&mut self) -> Result<()> {
        self.state
            .inner
            .lock()
            .channel_mut(self.conn, self.id)?
            .confirm = true;
        Ok(())
    }

    async fn basic_qos(&mut self, prefetch_count: u16) -> Result<()> {
        self.state
            .inner
            .lock()
            .channel_mut(self.conn, self.id)?
            .prefetch = prefetch_count;
        self.state.bump();
        Ok(())
    }

    async fn basic_publish(&mut self, publishing: Publishing) -> Result<()> {
        self.state
            .inner
            .lock()
            .publish(self.conn, self.id, publishing)?;
        self.state.bump();
        Ok(())
    }

    async fn basic_consume(&mut self, queue: &str) -> Result<DeliveryStream> {
        let consumer_tag = self.state.inner.lock().consume(self.conn, self.id, queue)?;
        debug!(queue, consumer_tag = %consumer_tag, "Consumer registered");

        let cursor = ConsumerCursor {
            state: Arc::clone(&self.state),
            changed: self.state.changed.subscribe(),
            conn: self.conn,
            chan: self.id,
            consumer_tag,
            step: service_step(self.heartbeat, Duration::from_secs(1)),
            done: false,
        };

        Ok(futures::stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            match cursor.next().await {
                Ok(Some(delivery)) => Some((Ok(delivery), cursor)),
                Ok(None) => None,
                Err(e) => {
                    cursor.done = true;
                    Some((Err(e), cursor))
                }
            }
        })
        .boxed())
    }

    async fn basic_ack(&mut self, delivery_tag: DeliveryTag) -> Result<()> {
        self.state
            .inner
            .lock()
            .settle(self.conn, self.id, delivery_tag, None)?;
        self.state.bump();
        Ok(())
    }

    async fn basic_nack(&mut self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.state
            .inner
            .lock()
            .settle(self.conn, self.id, delivery_tag, Some(requeue))?;
        self.state.bump();
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.state.inner.lock().close_channel(self.conn, self.id);
        self.state.bump();
    }
}

/// How long the owning task may sleep between heartbeat services
fn service_step(heartbeat: Duration, fallback: Duration) -> Duration {
    if heartbeat.is_zero() {
        fallback
    } else {
        (heartbeat / 2).max(Duration::from_millis(10))
    }
}

struct ConsumerCursor {
    state: Arc<BrokerState>,
    changed: watch::Receiver<u64>,
    conn: u64,
    chan: u64,
    consumer_tag: String,
    step: Duration,
    done: bool,
}

impl ConsumerCursor {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            self.changed.borrow_and_update();
            let next = self
                .state
                .inner
                .lock()
                .next_delivery(self.conn, self.chan, &self.consumer_tag)?;
            match next {
                NextDelivery::Ready(delivery) => return Ok(Some(delivery)),
                NextDelivery::Ended => return Ok(None),
                NextDelivery::Wait => {}
            }
            tokio::select! {
                _ = self.changed.changed() => {}
                _ = tokio::time::sleep(self.step) => {}
            }
        }
    }
}

impl Drop for ConsumerCursor {
    fn drop(&mut self) {
        self.state
            .inner
            .lock()
            .cancel_consumer(self.conn, self.chan, &self.consumer_tag);
        self.state.bump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    const QUEUE: &str = "upstream_queue";

    async fn open(broker: &InMemoryBroker) -> (Box<dyn Connection>, Box<dyn Channel>) {
        let mut conn = broker
            .connect(&ConnectionParams::new(broker.host()))
            .await
            .unwrap();
        let channel = conn.channel().await.unwrap();
        (conn, channel)
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_host_and_credentials() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");

        let err = broker
            .connect(&ConnectionParams::new("elsewhere"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::ConnectionFailed(_)));

        let params = ConnectionParams::new("rabbitmq_upstream")
            .with_credentials(Credentials::new("guest", "wrong"));
        let err = broker.connect(&params).await.err().unwrap();
        assert!(matches!(err, BrokerError::AccessRefused(_)));

        let params = ConnectionParams::new("rabbitmq_upstream").with_virtual_host("/missing");
        let err = broker.connect(&params).await.err().unwrap();
        assert!(matches!(err, BrokerError::AccessRefused(_)));
    }

    #[tokio::test]
    async fn test_extra_user_and_vhost() {
        let broker = InMemoryBroker::new("rabbitmq_upstream")
            .with_user("bridge", "secret")
            .with_virtual_host("/relay");
        let params = ConnectionParams::new("rabbitmq_upstream")
            .with_virtual_host("/relay")
            .with_credentials(Credentials::new("bridge", "secret"));
        assert!(broker.connect(&params).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_declare_is_idempotent() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");
        let (_conn, mut channel) = open(&broker).await;

        channel
            .queue_declare(QUEUE, QueueOptions::auto_delete())
            .await
            .unwrap();
        channel
            .queue_declare(QUEUE, QueueOptions::auto_delete())
            .await
            .unwrap();
        assert!(broker.queue_exists(QUEUE));

        let err = channel
            .queue_declare(QUEUE, QueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_publish_and_consume_with_ack() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");
        let (_conn, mut channel) = open(&broker).await;
        channel
            .queue_declare(QUEUE, QueueOptions::auto_delete())
            .await
            .unwrap();

        channel
            .basic_publish(Publishing::to_queue(QUEUE, "hello"))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth(QUEUE), 1);

        let mut deliveries = channel.basic_consume(QUEUE).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, Bytes::from_static(b"hello"));
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count(QUEUE), 1);

        channel.basic_ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(QUEUE), 0);

        let err = channel.basic_ack(delivery.delivery_tag).await.unwrap_err();
        assert_eq!(err, BrokerError::UnknownDeliveryTag(delivery.delivery_tag));
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");
        let (_conn, mut channel) = open(&broker).await;
        channel
            .queue_declare(QUEUE, QueueOptions::auto_delete())
            .await
            .unwrap();
        channel.basic_qos(1).await.unwrap();
        broker.publish_to(QUEUE, "one").unwrap();
        broker.publish_to(QUEUE, "two").unwrap();

        let mut deliveries = channel.basic_consume(QUEUE).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();

        // Second item is withheld until the first is settled
        let pending =
            tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(pending.is_err());
        assert_eq!(broker.queue_depth(QUEUE), 1);

        channel.basic_ack(first.delivery_tag).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_nack_requeue_and_drop() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");
        let (_conn, mut channel) = open(&broker).await;
        channel
            .queue_declare(QUEUE, QueueOptions::auto_delete())
            .await
            .unwrap();
        broker.publish_to(QUEUE, "poison").unwrap();

        let mut deliveries = channel.basic_consume(QUEUE).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.basic_nack(delivery.delivery_tag, true).await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, delivery.delivery_tag);

        channel.basic_nack(again.delivery_tag, false).await.unwrap();
        assert_eq!(broker.dropped_count(QUEUE), 1);
        assert_eq!(broker.queue_depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_auto_delete_after_last_consumer() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");
        let (mut conn, mut channel) = open(&broker).await;
        channel
            .queue_declare(QUEUE, QueueOptions::auto_delete())
            .await
            .unwrap();
        let _deliveries = channel.basic_consume(QUEUE).await.unwrap();
        assert_eq!(broker.consumer_count(QUEUE), 1);

        conn.close().await.unwrap();
        assert!(!broker.queue_exists(QUEUE));
    }

    #[tokio::test]
    async fn test_close_requeues_unacked() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");
        broker.declare_queue(QUEUE, QueueOptions::default()).unwrap();
        broker.publish_to(QUEUE, "hello").unwrap();

        let (mut conn, mut channel) = open(&broker).await;
        let mut deliveries = channel.basic_consume(QUEUE).await.unwrap();
        let _delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.queue_depth(QUEUE), 0);

        assert_ok!(conn.close().await);
        assert!(!conn.is_open());
        assert_eq!(broker.queue_depth(QUEUE), 1);

        // Closing twice is fine
        assert_ok!(conn.close().await);
    }

    #[tokio::test]
    async fn test_confirm_mode_surfaces_failures() {
        let broker = InMemoryBroker::new("rabbitmq_downstream");
        let (_conn, mut channel) = open(&broker).await;
        channel
            .queue_declare("downstream_queue", QueueOptions::auto_delete())
            .await
            .unwrap();
        broker.limit_queue("downstream_queue", 1).unwrap();

        // Without confirms, overflow and unroutable messages vanish silently
        channel
            .basic_publish(Publishing::to_queue("downstream_queue", "a"))
            .await
            .unwrap();
        channel
            .basic_publish(Publishing::to_queue("downstream_queue", "b"))
            .await
            .unwrap();
        channel
            .basic_publish(Publishing::to_queue("missing", "c").mandatory())
            .await
            .unwrap();

        channel.confirm_select().await.unwrap();
        let err = channel
            .basic_publish(Publishing::to_queue("downstream_queue", "d"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PublishNacked(_)));
        let err = channel
            .basic_publish(Publishing::to_queue("missing", "e").mandatory())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable(_)));

        assert_eq!(
            broker.peek("downstream_queue"),
            vec![Bytes::from_static(b"a")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_dropped() {
        let broker = InMemoryBroker::new("rabbitmq_downstream");
        let params =
            ConnectionParams::new("rabbitmq_downstream").with_heartbeat(Duration::from_secs(10));
        let conn = broker.connect(&params).await.unwrap();
        assert_eq!(broker.open_connections(), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!conn.is_open());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_data_events_keeps_connection_alive() {
        let broker = InMemoryBroker::new("rabbitmq_downstream");
        let params =
            ConnectionParams::new("rabbitmq_downstream").with_heartbeat(Duration::from_secs(10));
        let mut conn = broker.connect(&params).await.unwrap();

        for _ in 0..60 {
            conn.process_data_events(Duration::from_secs(1)).await.unwrap();
        }
        assert!(conn.is_open());
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_heartbeat_never_expires() {
        let broker = InMemoryBroker::new("rabbitmq_downstream");
        let params = ConnectionParams::new("rabbitmq_downstream")
            .with_heartbeat(Duration::from_secs(u64::MAX));
        let mut conn = broker.connect(&params).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(conn.is_open());
        conn.process_data_events(Duration::from_secs(1)).await.unwrap();
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_client_close_forgets_connection() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");
        let (mut closed, _) = open(&broker).await;
        let (dropped, _) = open(&broker).await;
        let (_kept, _) = open(&broker).await;
        assert_eq!(broker.state.inner.lock().connections.len(), 3);

        closed.close().await.unwrap();
        drop(dropped);
        assert_eq!(broker.state.inner.lock().connections.len(), 1);
        assert_eq!(broker.open_connections(), 1);
        assert!(!closed.is_open());

        broker.force_close_connections("shutdown");
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_deleted_queue_ends_consumer_stream() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");
        let (_conn, mut channel) = open(&broker).await;
        channel
            .queue_declare(QUEUE, QueueOptions::auto_delete())
            .await
            .unwrap();
        let mut deliveries = channel.basic_consume(QUEUE).await.unwrap();

        assert!(broker.delete_queue(QUEUE));
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn test_forced_close_fails_consumer_stream() {
        let broker = InMemoryBroker::new("rabbitmq_upstream");
        let (_conn, mut channel) = open(&broker).await;
        channel
            .queue_declare(QUEUE, QueueOptions::auto_delete())
            .await
            .unwrap();
        let mut deliveries = channel.basic_consume(QUEUE).await.unwrap();

        broker.force_close_connections("shutdown");
        let err = deliveries.next().await.unwrap().unwrap_err();
        assert!(err.is_connection_closed());
        assert!(deliveries.next().await.is_none());
    }
}
