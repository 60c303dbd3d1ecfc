//! Thread-safe callback scheduling onto a connection's owning task
//!
//! A broker connection may only be driven by the task that owns it. Other
//! tasks hand work to that task through a [`CallbackScheduler`]; the owner
//! drains the matching [`CallbackQueue`] from inside its own loop and runs
//! each callback against its private context `C`.

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::error::{BrokerError, Result};

/// A unit of work waiting to run on the owning task
pub type PendingCallback<C> =
    Box<dyn for<'a> FnOnce(&'a mut C) -> BoxFuture<'a, Result<()>> + Send>;

/// Create a linked scheduler/queue pair
pub fn callback_queue<C>() -> (CallbackScheduler<C>, CallbackQueue<C>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CallbackScheduler { tx }, CallbackQueue { rx })
}

/// Submitting half. Cheap to clone and safe to use from any task or thread.
pub struct CallbackScheduler<C> {
    tx: mpsc::UnboundedSender<PendingCallback<C>>,
}

impl<C> Clone for CallbackScheduler<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> CallbackScheduler<C> {
    /// Queue `callback` to run on the owning task and return immediately.
    ///
    /// Fails with [`BrokerError::SchedulerClosed`] once the owner has closed
    /// its queue.
    pub fn add_callback_threadsafe<F>(&self, callback: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut C) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        self.tx
            .send(Box::new(callback))
            .map_err(|_| BrokerError::SchedulerClosed)
    }

    /// Whether the owning queue has been closed or dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, owned by exactly one loop
pub struct CallbackQueue<C> {
    rx: mpsc::UnboundedReceiver<PendingCallback<C>>,
}

impl<C> CallbackQueue<C> {
    /// Wait for the next callback
    pub async fn recv(&mut self) -> Option<PendingCallback<C>> {
        self.rx.recv().await
    }

    /// Take the next callback if one is ready
    pub fn try_recv(&mut self) -> Option<PendingCallback<C>> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting new callbacks. Already queued ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Run every callback that is ready right now, in submission order.
    ///
    /// Stops at the first failing callback; the rest stay queued.
    pub async fn drain(&mut self, context: &mut C) -> Result<usize> {
        let mut executed = 0;
        while let Some(callback) = self.try_recv() {
            callback(&mut *context).await?;
            executed += 1;
        }
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<u32>,
    }

    impl Recorder {
        async fn record(&mut self, value: u32) -> Result<()> {
            self.seen.push(value);
            Ok(())
        }
    }

    fn push(scheduler: &CallbackScheduler<Recorder>, value: u32) {
        scheduler
            .add_callback_threadsafe(move |recorder: &mut Recorder| recorder.record(value).boxed())
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_runs_in_submission_order() {
        let (scheduler, mut queue) = callback_queue::<Recorder>();
        for value in 1..=3 {
            push(&scheduler, value);
        }

        let mut recorder = Recorder::default();
        assert_eq!(queue.drain(&mut recorder).await.unwrap(), 3);
        assert_eq!(recorder.seen, vec![1, 2, 3]);

        // Each callback runs once
        assert_eq!(queue.drain(&mut recorder).await.unwrap(), 0);
        assert_eq!(recorder.seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_new_callbacks() {
        let (scheduler, mut queue) = callback_queue::<Recorder>();
        push(&scheduler, 1);
        queue.close();

        assert!(scheduler.is_closed());
        let err = scheduler
            .add_callback_threadsafe(|recorder: &mut Recorder| recorder.record(2).boxed())
            .unwrap_err();
        assert_eq!(err, BrokerError::SchedulerClosed);

        // Work queued before close still drains
        let mut recorder = Recorder::default();
        queue.drain(&mut recorder).await.unwrap();
        assert_eq!(recorder.seen, vec![1]);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let (scheduler, mut queue) = callback_queue::<Recorder>();
        push(&scheduler, 1);
        scheduler
            .add_callback_threadsafe(|_: &mut Recorder| {
                async { Err(BrokerError::PublishNacked("rejected".to_string())) }.boxed()
            })
            .unwrap();
        push(&scheduler, 3);

        let mut recorder = Recorder::default();
        assert!(queue.drain(&mut recorder).await.is_err());
        assert_eq!(recorder.seen, vec![1]);

        assert_eq!(queue.drain(&mut recorder).await.unwrap(), 1);
        assert_eq!(recorder.seen, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_submitters_on_other_threads() {
        let (scheduler, mut queue) = callback_queue::<Recorder>();

        let handles: Vec<_> = (0..4)
            .map(|thread| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        push(&scheduler, thread * 100 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut recorder = Recorder::default();
        assert_eq!(queue.drain(&mut recorder).await.unwrap(), 100);

        // Per-submitter order is preserved
        for thread in 0..4 {
            let mine: Vec<u32> = recorder
                .seen
                .iter()
                .copied()
                .filter(|v| v / 100 == thread)
                .collect();
            let expected: Vec<u32> = (0..25).map(|i| thread * 100 + i).collect();
            assert_eq!(mine, expected);
        }
    }
}
