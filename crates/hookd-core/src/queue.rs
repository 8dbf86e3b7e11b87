//! FIFO queue for spooled async requests.
//!
//! The queue is the only mutable structure shared between the gateway
//! (producer) and the async workers (consumers). Two variants exist: an
//! unbounded in-memory queue and a bounded one whose `push` exerts
//! backpressure on the HTTP side when the queue is full.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::manifest::Manifest;

/// One unit of async work: the spooled request file plus the manifest it was
/// resolved to.
///
/// Ownership of the file transfers with the item; whoever pops it must delete
/// the file when done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    /// Path of the spooled HTTP request on disk.
    pub path: PathBuf,
    /// Execution plan resolved at enqueue time.
    pub manifest: Manifest,
}

/// FIFO queue with optional capacity.
pub struct Queue {
    items: Mutex<VecDeque<QueuedItem>>,
    notify: Notify,
    capacity: Option<Semaphore>,
}

impl Queue {
    /// Creates a queue without a capacity bound; `push` never blocks.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: None,
        }
    }

    /// Creates a queue holding at most `capacity` items; `push` blocks until
    /// space is available.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: Some(Semaphore::new(capacity)),
        }
    }

    /// Appends an item at the back.
    ///
    /// On the bounded variant this waits for free capacity, aborting with
    /// [`QueueError::Cancelled`] when `cancel` fires first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Cancelled`] if the token fired before the item
    /// could be enqueued; the item is not enqueued in that case.
    pub async fn push(
        &self,
        item: QueuedItem,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        if let Some(capacity) = &self.capacity {
            let permit = tokio::select! {
                permit = capacity.acquire() => {
                    permit.map_err(|_| QueueError::Cancelled)?
                }
                () = cancel.cancelled() => return Err(QueueError::Cancelled),
            };
            // The permit is handed back in pop() once the slot frees up.
            permit.forget();
        }

        self.items
            .lock()
            .expect("queue mutex poisoned")
            .push_back(item);
        self.notify.notify_one();
        Ok(())
    }

    /// Removes and returns the front item, waiting for one to arrive.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Cancelled`] if the token fired while waiting; no
    /// item is removed in that case.
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<QueuedItem, QueueError> {
        loop {
            let front = self
                .items
                .lock()
                .expect("queue mutex poisoned")
                .pop_front();
            if let Some(item) = front {
                if let Some(capacity) = &self.capacity {
                    capacity.add_permits(1);
                }
                return Ok(item);
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(QueueError::Cancelled),
                () = self.notify.notified() => {}
            }
        }
    }

    /// Number of items currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Queue operation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The caller's cancellation signal fired before the operation finished.
    #[error("queue operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::manifest::AsyncMode;

    fn item(name: &str) -> QueuedItem {
        QueuedItem {
            path: PathBuf::from(name),
            manifest: Manifest {
                command: vec!["/bin/true".to_string()],
                async_mode: AsyncMode::Auto,
                timeout: Duration::ZERO,
                retries: 0,
                delay: Duration::from_secs(1),
            },
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Queue::unbounded();
        let cancel = CancellationToken::new();

        for name in ["a", "b", "c"] {
            queue.push(item(name), &cancel).await.unwrap();
        }

        for name in ["a", "b", "c"] {
            let popped = queue.pop(&cancel).await.unwrap();
            assert_eq!(popped.path, PathBuf::from(name));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(Queue::unbounded());
        let cancel = CancellationToken::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(item("late"), &cancel).await.unwrap();

        let popped = consumer.await.unwrap().unwrap();
        assert_eq!(popped.path, PathBuf::from("late"));
    }

    #[tokio::test]
    async fn test_cancelled_pop_removes_nothing() {
        let queue = Queue::unbounded();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(queue.pop(&cancel).await, Err(QueueError::Cancelled));

        let fresh = CancellationToken::new();
        queue.push(item("kept"), &fresh).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_push_blocks_at_capacity() {
        let queue = Arc::new(Queue::bounded(1));
        let cancel = CancellationToken::new();

        queue.push(item("first"), &cancel).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.push(item("second"), &cancel).await })
        };

        // The producer cannot complete until a slot frees up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let popped = queue.pop(&cancel).await.unwrap();
        assert_eq!(popped.path, PathBuf::from("first"));

        producer.await.unwrap().unwrap();
        let popped = queue.pop(&cancel).await.unwrap();
        assert_eq!(popped.path, PathBuf::from("second"));
    }

    #[tokio::test]
    async fn test_bounded_push_cancellation() {
        let queue = Queue::bounded(1);
        let cancel = CancellationToken::new();
        queue.push(item("fill"), &cancel).await.unwrap();

        let blocked = CancellationToken::new();
        blocked.cancel();
        assert_eq!(
            queue.push(item("over"), &blocked).await,
            Err(QueueError::Cancelled)
        );
        assert_eq!(queue.len(), 1);
    }
}
