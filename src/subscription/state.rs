//! Subscription state shared by the connection, delivery tasks, and handles
//!
//! Lock order: the connection state lock (when held) is always taken before
//! [`SubscriptionCore::state`]. Message queues have their own internal lock
//! that is only ever taken last.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::delivery::DeliveryWorker;
use crate::connection::ConnInner;
use crate::error::{NatsError, Result};
use crate::message::Msg;
use crate::queue::MsgQueue;

/// Asynchronous message handler
pub(crate) type MsgHandler = Arc<dyn Fn(Msg) -> HandlerOutcome + Send + Sync>;

/// Predicate evaluated before a message is queued; `false` discards it
pub type MsgFilter = Arc<dyn Fn(&Msg) -> bool + Send + Sync>;

/// What a handler wants done with its subscription after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    Continue,
    Unsubscribe,
}

/// Result of offering a message to a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// Rejected by the message filter
    Filtered,
    /// Over a pending limit; `first` is set for the first drop since the
    /// subscription last kept up
    Dropped { first: bool },
    /// Past the auto-unsubscribe limit; the subscription should be removed
    OverMax,
    /// Closed or draining
    Rejected,
}

/// Where queued messages go
pub(crate) enum Mailbox {
    /// Drained by the user through `next_msg`
    Sync(MsgQueue<Msg>),
    /// Drained by a dedicated delivery task
    Async {
        queue: MsgQueue<Msg>,
        handler: MsgHandler,
    },
    /// Drained by a shared delivery worker
    Pooled {
        worker: Arc<DeliveryWorker>,
        handler: MsgHandler,
    },
}

impl Mailbox {
    fn handler(&self) -> Option<&MsgHandler> {
        match self {
            Self::Sync(_) => None,
            Self::Async { handler, .. } | Self::Pooled { handler, .. } => Some(handler),
        }
    }
}

#[derive(Default)]
struct SubState {
    pending_msgs: u64,
    pending_bytes: u64,
    pending_msgs_limit: i64,
    pending_bytes_limit: i64,
    max_pending_msgs: u64,
    max_pending_bytes: u64,
    received: u64,
    delivered: u64,
    dropped: u64,
    max: Option<u64>,
    slow_consumer: bool,
    draining: bool,
    closed: bool,
    filter: Option<MsgFilter>,
}

impl SubState {
    fn over_limit(&self) -> bool {
        let over = |pending: u64, limit: i64| limit > 0 && pending > limit as u64;
        over(self.pending_msgs, self.pending_msgs_limit)
            || over(self.pending_bytes, self.pending_bytes_limit)
    }

    fn max_reached(&self) -> bool {
        self.max.is_some_and(|max| self.delivered >= max)
    }
}

pub(crate) struct SubscriptionCore {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    conn: Weak<ConnInner>,
    mailbox: Mailbox,
    state: Mutex<SubState>,
    drained: Notify,
}

impl SubscriptionCore {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        conn: Weak<ConnInner>,
        mailbox: Mailbox,
        limits: (i64, i64),
    ) -> Self {
        Self {
            sid,
            subject,
            queue_group,
            conn,
            mailbox,
            state: Mutex::new(SubState {
                pending_msgs_limit: limits.0,
                pending_bytes_limit: limits.1,
                ..SubState::default()
            }),
            drained: Notify::new(),
        }
    }

    pub(crate) fn connection(&self) -> Option<Arc<ConnInner>> {
        self.conn.upgrade()
    }

    /// Own queue and handler for a subscription with a dedicated delivery task
    pub(crate) fn own_delivery(&self) -> Option<&MsgQueue<Msg>> {
        match &self.mailbox {
            Mailbox::Async { queue, .. } => Some(queue),
            _ => None,
        }
    }

    /// Offer a parsed message for delivery
    ///
    /// Called from the read task with the connection state lock held.
    pub(crate) fn enqueue(self: &Arc<Self>, msg: Msg) -> Enqueued {
        let filter = {
            let mut st = self.state.lock();
            if st.closed || st.draining {
                return Enqueued::Rejected;
            }
            st.received += 1;
            if st.max.is_some_and(|max| st.received > max) {
                return Enqueued::OverMax;
            }
            st.filter.clone()
        };
        if let Some(filter) = filter
            && !filter(&msg)
        {
            trace!("Filter rejected message on sid {}", self.sid);
            return Enqueued::Filtered;
        }

        let size = msg.size() as u64;
        let mut st = self.state.lock();
        if st.closed {
            return Enqueued::Rejected;
        }
        st.pending_msgs += 1;
        st.pending_bytes += size;
        if st.over_limit() {
            st.pending_msgs -= 1;
            st.pending_bytes -= size;
            st.dropped += 1;
            let first = !st.slow_consumer;
            st.slow_consumer = true;
            return Enqueued::Dropped { first };
        }
        st.max_pending_msgs = st.max_pending_msgs.max(st.pending_msgs);
        st.max_pending_bytes = st.max_pending_bytes.max(st.pending_bytes);

        let accepted = match &self.mailbox {
            Mailbox::Sync(queue) | Mailbox::Async { queue, .. } => queue.add(msg),
            Mailbox::Pooled { worker, .. } => worker.add(Arc::clone(self), msg),
        };
        if !accepted {
            st.pending_msgs -= 1;
            st.pending_bytes -= size;
            return Enqueued::Rejected;
        }
        st.slow_consumer = false;
        Enqueued::Queued
    }

    /// Account for one message taken off the queue
    ///
    /// Returns true once the auto-unsubscribe limit has been delivered.
    fn consumed(&self, size: usize) -> bool {
        let (done, empty) = {
            let mut st = self.state.lock();
            st.pending_msgs = st.pending_msgs.saturating_sub(1);
            st.pending_bytes = st.pending_bytes.saturating_sub(size as u64);
            st.delivered += 1;
            (st.max_reached(), st.pending_msgs == 0)
        };
        if empty {
            self.drained.notify_waiters();
        }
        done
    }

    /// Run the async handler for one message
    ///
    /// Returns false once the subscription is finished and its delivery task
    /// should stop.
    pub(crate) fn deliver(self: &Arc<Self>, msg: Msg) -> bool {
        let Some(handler) = self.mailbox.handler() else {
            return false;
        };
        if self.is_closed() {
            return false;
        }

        let size = msg.size();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| handler(msg))) {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "Message handler for subscription {} on {} panicked",
                    self.sid, self.subject
                );
                HandlerOutcome::Continue
            }
        };

        let max_reached = self.consumed(size);
        if max_reached || outcome == HandlerOutcome::Unsubscribe {
            self.unregister(outcome == HandlerOutcome::Unsubscribe && !max_reached);
            return false;
        }
        true
    }

    /// Wait for the next message of a sync subscription
    pub(crate) async fn next_msg(&self, timeout: Option<Duration>) -> Result<Msg> {
        let Mailbox::Sync(queue) = &self.mailbox else {
            return Err(NatsError::InvalidArgument(
                "next_msg called on an asynchronous subscription".into(),
            ));
        };
        if self.is_closed() {
            return Err(self.closed_error());
        }

        match queue.get(timeout).await {
            Ok(Some(msg)) => {
                if self.consumed(msg.size()) {
                    self.unregister(false);
                }
                Ok(msg)
            }
            Ok(None) => Err(self.closed_error()),
            Err(e) => Err(e.into()),
        }
    }

    fn closed_error(&self) -> NatsError {
        if self.state.lock().max_reached() {
            return NatsError::MaxMessagesDelivered;
        }
        match self.connection() {
            Some(conn) if !conn.is_closed() => NatsError::BadSubscription,
            _ => NatsError::ConnectionClosed,
        }
    }

    fn unregister(&self, send_unsub: bool) {
        match self.connection() {
            Some(conn) => {
                if let Err(e) = conn.remove_subscription(self.sid, send_unsub) {
                    debug!("Subscription {} already removed: {}", self.sid, e);
                }
            }
            None => self.close(),
        }
    }

    /// Stop accepting messages and discard anything queued
    pub(crate) fn close(&self) {
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.pending_msgs = 0;
            st.pending_bytes = 0;
        }
        match &self.mailbox {
            Mailbox::Sync(queue) | Mailbox::Async { queue, .. } => {
                queue.close();
            }
            // The worker skips messages for closed subscriptions
            Mailbox::Pooled { .. } => {}
        }
        self.drained.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Set the auto-unsubscribe limit
    ///
    /// Returns true if `max` messages have already been delivered.
    pub(crate) fn set_max(&self, max: u64) -> bool {
        let mut st = self.state.lock();
        st.max = Some(max);
        st.max_reached()
    }

    /// Messages the server may still send under the auto-unsubscribe limit
    ///
    /// `None` means unlimited. Used to replay `UNSUB <sid> <max>` after a
    /// reconnect.
    pub(crate) fn remaining(&self) -> Option<u64> {
        let st = self.state.lock();
        st.max.map(|max| max.saturating_sub(st.received))
    }

    /// Unsubscribe after everything already sent by the server is consumed
    pub(crate) async fn drain(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let conn = self.connection().ok_or(NatsError::ConnectionClosed)?;
        if self.is_closed() {
            return Err(NatsError::BadSubscription);
        }
        let deadline = Instant::now() + timeout;
        debug!("Draining subscription {} on {}", self.sid, self.subject);

        conn.send_unsub(self.sid, None)?;
        let flushed = conn.flush(timeout).await;
        self.state.lock().draining = true;

        let result = match flushed {
            Ok(()) => self.wait_drained(deadline).await,
            Err(e) => Err(e),
        };
        if let Err(e) = conn.remove_subscription(self.sid, false) {
            debug!("Drained subscription {} already removed: {}", self.sid, e);
        }
        result
    }

    async fn wait_drained(&self, deadline: Instant) -> Result<()> {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.state.lock();
                if st.closed || st.pending_msgs == 0 {
                    return Ok(());
                }
            }
            tokio::time::timeout_at(deadline, notified).await?;
        }
    }

    pub(crate) fn pending(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.pending_msgs, st.pending_bytes)
    }

    pub(crate) fn max_pending(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.max_pending_msgs, st.max_pending_bytes)
    }

    pub(crate) fn clear_max_pending(&self) {
        let mut st = self.state.lock();
        st.max_pending_msgs = 0;
        st.max_pending_bytes = 0;
    }

    pub(crate) fn pending_limits(&self) -> (i64, i64) {
        let st = self.state.lock();
        (st.pending_msgs_limit, st.pending_bytes_limit)
    }

    pub(crate) fn set_pending_limits(&self, msgs: i64, bytes: i64) -> Result<()> {
        for (value, name) in [(msgs, "message"), (bytes, "byte")] {
            if value == 0 || value < -1 {
                return Err(NatsError::InvalidArgument(format!(
                    "pending {name} limit must be positive or -1, got {value}"
                )));
            }
        }
        let mut st = self.state.lock();
        st.pending_msgs_limit = msgs;
        st.pending_bytes_limit = bytes;
        Ok(())
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub(crate) fn set_filter(&self, filter: Option<MsgFilter>) {
        self.state.lock().filter = filter;
    }
}
