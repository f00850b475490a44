//! FIFO mailbox between network I/O and message delivery
//!
//! [`MsgQueue`] is an unbounded queue with timed waits. Producers never block;
//! consumers wait for an item, a timeout, or the queue being closed. Closing is
//! terminal: queued items are discarded and every current and future waiter
//! receives the closed sentinel (`Ok(None)`) immediately.
//!
//! The queue assumes one producer and one consumer per instance, but stays
//! correct with more of either.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Errors returned by queue waits
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    /// No item arrived before the deadline
    #[error("timed out waiting for queue item")]
    Timeout,
}

impl From<QueueError> for crate::NatsError {
    fn from(_: QueueError) -> Self {
        Self::Timeout
    }
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    finished: bool,
}

/// Unbounded FIFO queue with timed, batch, and closable waits
#[derive(Debug)]
pub struct MsgQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> Default for MsgQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MsgQueue<T> {
    /// Create an empty open queue
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty open queue with preallocated capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                finished: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an item and wake a waiter
    ///
    /// Returns `false` (dropping the item) if the queue is closed.
    pub fn add(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Append only if fewer than `bound` items are queued
    ///
    /// Hands the item back when the queue is full or closed.
    pub fn try_add(&self, item: T, bound: usize) -> Result<(), T> {
        {
            let mut state = self.state.lock();
            if state.finished || state.items.len() >= bound {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the head item without waiting
    pub fn try_get(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Wait for the next item
    ///
    /// - `Ok(Some(item))` - an item was dequeued
    /// - `Ok(None)` - the queue is closed
    /// - `Err(QueueError::Timeout)` - `timeout` elapsed first (`None` waits forever)
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Option<T>, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add cannot be missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.finished {
                    return Ok(None);
                }
                if let Some(item) = state.items.pop_front() {
                    return Ok(Some(item));
                }
            }

            Self::wait(notified, deadline).await?;
        }
    }

    /// Wait for items and move up to `max` of them into `out` in one wake-up
    ///
    /// Returns `Ok(Some(n))` with the number of items moved (at least one),
    /// `Ok(None)` if the queue is closed, or a timeout error.
    pub async fn get_batch(
        &self,
        timeout: Option<Duration>,
        max: usize,
        out: &mut Vec<T>,
    ) -> Result<Option<usize>, QueueError> {
        let max = max.max(1);
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.finished {
                    return Ok(None);
                }
                if !state.items.is_empty() {
                    let n = state.items.len().min(max);
                    out.extend(state.items.drain(..n));
                    return Ok(Some(n));
                }
            }

            Self::wait(notified, deadline).await?;
        }
    }

    async fn wait(
        notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
        deadline: Option<Instant>,
    ) -> Result<(), QueueError> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, notified)
                .await
                .map_err(|_| QueueError::Timeout),
            None => {
                notified.await;
                Ok(())
            }
        }
    }

    /// Close the queue, discard queued items, and wake all waiters
    ///
    /// Returns the number of discarded items.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            if state.finished {
                return 0;
            }
            state.finished = true;
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.notify.notify_waiters();
        // Covers a consumer that checked state but has not yet registered
        self.notify.notify_one();
        discarded
    }

    /// Check if the queue has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().finished
    }

    /// Number of queued items
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Check if no items are queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}
