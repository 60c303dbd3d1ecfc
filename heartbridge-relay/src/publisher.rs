//! Outbound event loop
//!
//! The loop task is the only code that ever touches the outbound connection.
//! It alternates between pumping network events (which answers heartbeats)
//! and running callbacks that other tasks scheduled through
//! [`OutboundEventLoop::schedule`]. [`OutboundEventLoop::publish`] is such a
//! callback, so a publish requested from any thread is executed on the loop's
//! own task, in submission order.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use heartbridge_core::broker::{
    self, callback_queue, Broker, CallbackQueue, CallbackScheduler, Channel, Connection,
    ConnectionParams, PendingCallback, Publishing, QueueOptions,
};

use crate::error::{RelayError, Result};

/// Upper bound on one event pump; also the latency of observing `stop()`
pub const PUMP_INTERVAL: Duration = Duration::from_secs(1);

/// How long `stop()` waits for the loop to wind down before aborting it
pub const STOP_GRACE: Duration = Duration::from_secs(2);

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static OWNING_LOOP: LoopId;
}

/// Identity of one outbound loop task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// The outbound loop whose task is currently executing, if any
pub fn current_loop() -> Option<LoopId> {
    OWNING_LOOP.try_with(|id| *id).ok()
}

/// Whether the loop services its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PumpMode {
    /// Pump events every [`PUMP_INTERVAL`]
    #[default]
    Service,
    /// Never pump. The broker drops the connection after two missed
    /// heartbeats and scheduled callbacks never run.
    Skip,
}

/// State private to the loop task, handed to every scheduled callback
pub struct OutboundContext {
    loop_id: LoopId,
    channel: Box<dyn Channel>,
    queue: String,
    published: Arc<AtomicU64>,
}

impl OutboundContext {
    /// Loop this context belongs to
    pub fn loop_id(&self) -> LoopId {
        self.loop_id
    }

    /// Destination queue
    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn publish_on_own_context(&mut self, body: Bytes) -> broker::error::Result<()> {
        debug_assert_eq!(current_loop(), Some(self.loop_id));
        info!(
            queue = %self.queue,
            payload = %String::from_utf8_lossy(&body),
            "Publishing on own context"
        );
        self.channel
            .basic_publish(Publishing::to_queue(self.queue.clone(), body))
            .await?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Publisher: an event loop that owns the outbound connection
pub struct OutboundEventLoop {
    id: LoopId,
    queue: String,
    mode: PumpMode,
    scheduler: CallbackScheduler<OutboundContext>,
    running: Arc<AtomicBool>,
    published: Arc<AtomicU64>,
    /// Loop state between `connect` and `start`
    pending: Mutex<Option<LoopState>>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl OutboundEventLoop {
    /// Open the outbound connection, declare the destination queue and
    /// enable publisher confirms. The loop does not run until [`start`](Self::start).
    pub async fn connect(
        broker: &dyn Broker,
        params: &ConnectionParams,
        queue: impl Into<String>,
    ) -> Result<Self> {
        let queue = queue.into();
        let mut connection = broker.connect(params).await?;
        let mut channel = connection.channel().await?;
        channel
            .queue_declare(&queue, QueueOptions::auto_delete())
            .await?;
        channel.confirm_select().await?;

        let id = LoopId(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed));
        let (scheduler, callbacks) = callback_queue();
        let running = Arc::new(AtomicBool::new(true));
        let published = Arc::new(AtomicU64::new(0));

        info!(
            host = %params.host,
            queue = %queue,
            heartbeat_s = params.effective_heartbeat().as_secs(),
            "Publisher connected"
        );

        let state = LoopState {
            mode: PumpMode::default(),
            connection,
            callbacks,
            running: Arc::clone(&running),
            context: OutboundContext {
                loop_id: id,
                channel,
                queue: queue.clone(),
                published: Arc::clone(&published),
            },
        };

        Ok(Self {
            id,
            queue,
            mode: PumpMode::default(),
            scheduler,
            running,
            published,
            pending: Mutex::new(Some(state)),
            task: Mutex::new(None),
        })
    }

    /// Choose how the loop treats its connection. Only effective before `start`.
    pub fn with_pump_mode(mut self, mode: PumpMode) -> Self {
        if let Some(state) = self.pending.get_mut() {
            state.mode = mode;
            self.mode = mode;
        }
        self
    }

    /// Identity of the loop task
    pub fn id(&self) -> LoopId {
        self.id
    }

    /// Destination queue
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Spawn the loop on its own task
    pub async fn start(&self) -> Result<()> {
        let state = self
            .pending
            .lock()
            .await
            .take()
            .ok_or(RelayError::AlreadyStarted)?;

        let span = info_span!("publisher", queue = %self.queue, id = %self.id);
        let task = tokio::spawn(OWNING_LOOP.scope(self.id, state.run()).instrument(span));
        *self.task.lock().await = Some(task);

        info!(queue = %self.queue, mode = ?self.mode, "Publisher started");
        Ok(())
    }

    /// Hand `body` to the loop for publishing and return immediately.
    ///
    /// Safe to call from any task or thread. Fails with
    /// [`RelayError::PublisherStopped`] once the loop has shut down.
    pub fn publish(&self, body: impl Into<Bytes>) -> Result<()> {
        let body = body.into();
        debug!(queue = %self.queue, bytes = body.len(), "Scheduling publish");
        self.schedule(move |context: &mut OutboundContext| {
            context.publish_on_own_context(body).boxed()
        })
    }

    /// Run `callback` on the loop task, after every callback scheduled before it
    pub fn schedule<F>(&self, callback: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut OutboundContext) -> BoxFuture<'a, broker::error::Result<()>>
            + Send
            + 'static,
    {
        self.scheduler
            .add_callback_threadsafe(callback)
            .map_err(RelayError::from_schedule)
    }

    /// Clear the run flag, give the loop [`STOP_GRACE`] to flush and close
    /// its connection, and report how it ended. A loop that overruns the
    /// grace is aborted and awaited before this returns
    /// [`RelayError::StopTimedOut`]. Later calls return `Ok(())`.
    pub async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);

        // Never started: the connection is closed here instead
        if let Some(mut state) = self.pending.lock().await.take() {
            state.callbacks.close();
            state.discard("publisher stopped before start");
            state.close_connection().await;
            info!(queue = %self.queue, "Publisher stopped before start");
            return Ok(());
        }

        let Some(mut task) = self.task.lock().await.take() else {
            debug!(queue = %self.queue, "Publisher already stopped");
            return Ok(());
        };

        info!(queue = %self.queue, "Stopping publisher");
        match tokio::time::timeout(STOP_GRACE, &mut task).await {
            Ok(Ok(result)) => {
                info!(queue = %self.queue, "Publisher stopped");
                result
            }
            Ok(Err(e)) if e.is_panic() => {
                error!(queue = %self.queue, "Publisher loop panicked");
                Err(RelayError::LoopPanicked)
            }
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                warn!(
                    queue = %self.queue,
                    grace_ms = STOP_GRACE.as_millis() as u64,
                    "Publisher loop did not exit in time, aborting"
                );
                task.abort();
                // The aborted task drops its state, and with it the connection
                match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(RelayError::LoopPanicked),
                    Err(_) => Err(RelayError::StopTimedOut(STOP_GRACE)),
                }
            }
        }
    }

    /// Whether the loop task is alive and has not been asked to stop
    pub async fn is_running(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Messages confirmed by the broker so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Get publisher status
    pub async fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "queue": self.queue,
            "running": self.is_running().await,
            "pump_mode": format!("{:?}", self.mode),
            "pump_interval_ms": PUMP_INTERVAL.as_millis() as u64,
            "published": self.published_count(),
        })
    }
}

enum Wake {
    Pumped(broker::error::Result<()>),
    Scheduled(Option<PendingCallback<OutboundContext>>),
}

/// Everything the loop task owns
struct LoopState {
    mode: PumpMode,
    connection: Box<dyn Connection>,
    callbacks: CallbackQueue<OutboundContext>,
    running: Arc<AtomicBool>,
    context: OutboundContext,
}

impl LoopState {
    async fn run(mut self) -> Result<()> {
        info!(mode = ?self.mode, "Publisher loop running");

        let outcome = match self.mode {
            PumpMode::Service => self.service().await,
            PumpMode::Skip => {
                warn!("Heartbeat servicing disabled, the broker will drop this connection");
                idle(&self.running).await;
                Ok(())
            }
        };

        self.callbacks.close();
        let outcome = match outcome {
            Ok(()) if self.connection.is_open() => self.flush().await,
            Ok(()) => {
                warn!("Outbound connection was closed by the broker");
                self.discard("connection closed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Publisher loop failed");
                self.discard("loop failed");
                Err(e)
            }
        };

        self.close_connection().await;
        outcome
    }

    async fn service(&mut self) -> Result<()> {
        while self.running.load(Ordering::Acquire) {
            let wake = tokio::select! {
                biased;
                pumped = self.connection.process_data_events(PUMP_INTERVAL) => Wake::Pumped(pumped),
                callback = self.callbacks.recv() => Wake::Scheduled(callback),
            };

            match wake {
                Wake::Pumped(result) => result?,
                Wake::Scheduled(Some(callback)) => {
                    callback(&mut self.context).await?;
                    self.callbacks.drain(&mut self.context).await?;
                }
                Wake::Scheduled(None) => {
                    debug!("Publisher handle dropped");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Run callbacks queued before shutdown
    async fn flush(&mut self) -> Result<()> {
        match self.callbacks.drain(&mut self.context).await {
            Ok(0) => Ok(()),
            Ok(flushed) => {
                debug!(flushed, "Flushed scheduled callbacks");
                Ok(())
            }
            Err(e) => {
                self.discard("flush failed");
                Err(e.into())
            }
        }
    }

    fn discard(&mut self, reason: &str) {
        let mut discarded = 0usize;
        while self.callbacks.try_recv().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, reason, "Discarding scheduled callbacks");
        }
    }

    async fn close_connection(&mut self) {
        if !self.connection.is_open() {
            return;
        }
        match self.connection.close().await {
            Ok(()) => info!("Outbound connection closed"),
            Err(e) => warn!(error = %e, "Failed to close outbound connection"),
        }
    }
}

/// Wait for the run flag to clear without touching the connection
async fn idle(running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        tokio::time::sleep(PUMP_INTERVAL).await;
    }
}
