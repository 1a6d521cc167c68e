//! FIFO hand-off between one producer and N workers.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};
use tracing::trace;

use super::error::QueueError;

/// One queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMessage<T> {
    /// Work to do.
    Task(T),
    /// Sentinel: the receiving worker should exit.
    Shutdown,
}

/// Unbounded FIFO with a completion barrier.
///
/// Every [`put`](Self::put) raises the pending count and every
/// [`task_done`](Self::task_done) lowers it; [`join`](Self::join) waits until it
/// reaches zero. Dequeue is serialised, so each message goes to exactly one worker.
#[derive(Debug)]
pub struct WorkQueue<T> {
    sender: mpsc::UnboundedSender<QueueMessage<T>>,
    receiver: Mutex<mpsc::UnboundedReceiver<QueueMessage<T>>>,
    pending: AtomicUsize,
    drained: Notify,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Enqueues a task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the receiving side is gone.
    pub fn put(&self, task: T) -> Result<(), QueueError> {
        self.send(QueueMessage::Task(task))
    }

    /// Enqueues one shutdown sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the receiving side is gone.
    pub fn put_shutdown(&self) -> Result<(), QueueError> {
        self.send(QueueMessage::Shutdown)
    }

    fn send(&self, message: QueueMessage<T>) -> Result<(), QueueError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(message).is_err() {
            self.task_done();
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Waits for the next message. `None` only if the queue is closed.
    pub async fn get(&self) -> Option<QueueMessage<T>> {
        self.receiver.lock().await.recv().await
    }

    /// Acknowledges one dequeued message.
    pub fn task_done(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        trace!(pending = previous.saturating_sub(1), "task acknowledged");
        if previous <= 1 {
            self.drained.notify_waiters();
        }
    }

    /// Messages put but not yet acknowledged.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Waits until every message put so far has been acknowledged.
    pub async fn join(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            drained.await;
        }
    }
}
