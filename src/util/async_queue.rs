use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{cancelled, SyncResult};
use crate::util::runtime;

type QueuedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Ordered, single-consumer work queue.
///
/// Every operation enqueued here runs to completion before the next one
/// starts, so callers observe program-order semantics even though individual
/// operations may suspend on network or persistence I/O. Delayed entries are
/// used for retryable background work (garbage collection, timers) and can
/// be cancelled individually.
#[derive(Clone)]
pub struct AsyncQueue {
    tx: async_channel::Sender<QueuedTask>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded::<QueuedTask>();
        runtime::spawn_detached(async move {
            while let Ok(task) = rx.recv().await {
                task.await;
            }
        });
        Self { tx }
    }

    /// Appends an operation to the queue. The operation runs after every
    /// previously enqueued operation has completed.
    pub fn enqueue<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.try_send(Box::pin(future)).is_err() {
            log::warn!("async queue is shut down; dropping enqueued operation");
        }
    }

    /// Enqueues an operation and waits for its result.
    pub async fn run<T, F>(&self, future: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = futures::channel::oneshot::channel();
        self.enqueue(async move {
            let _ = tx.send(future.await);
        });
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(cancelled("work queue stopped before the operation ran")),
        }
    }

    /// Schedules an operation to be enqueued after `delay`. Cancelling the
    /// returned handle before the delay elapses prevents the operation from
    /// ever entering the queue.
    pub fn enqueue_after_delay<F>(&self, delay: Duration, future: F) -> DelayedOperation
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let tx = self.tx.clone();
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            let guard = Arc::clone(&flag);
            let _ = tx
                .send(Box::pin(async move {
                    // Re-check: cancellation may have raced the delivery.
                    if !guard.load(Ordering::SeqCst) {
                        future.await;
                    }
                }) as QueuedTask)
                .await;
        });
        DelayedOperation { cancelled }
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn operations_run_in_enqueue_order() {
        let queue = AsyncQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            queue.enqueue(async move {
                order.lock().unwrap().push(i);
            });
        }

        queue
            .run(async { Ok(()) })
            .await
            .expect("queue drains earlier entries first");
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn run_returns_operation_result() {
        let queue = AsyncQueue::new();
        let value = queue.run(async { Ok(41 + 1) }).await.expect("result");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = queue.enqueue_after_delay(Duration::from_millis(20), async move {
            flag.store(true, Ordering::SeqCst);
        });
        handle.cancel();

        runtime::sleep(Duration::from_millis(60)).await;
        queue.run(async { Ok(()) }).await.expect("queue alive");
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delayed_operation_runs_after_delay() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let _handle = queue.enqueue_after_delay(Duration::from_millis(10), async move {
            flag.store(true, Ordering::SeqCst);
        });

        for _ in 0..20 {
            if ran.load(Ordering::SeqCst) {
                break;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
