//! Subscriptions
//!
//! A subscription owns a delivery queue fed by the connection's read task.
//! [`SyncSubscription`]s are drained by the caller through
//! [`SyncSubscription::next_msg`]; [`AsyncSubscription`]s run a handler on a
//! delivery task. Both deref to [`Subscription`] for introspection,
//! unsubscribe, and drain.
//!
//! Every subscription enforces pending message and byte limits. A message
//! that would exceed either limit is dropped, counted, and reported once as
//! a slow consumer through the connection's event callback.

mod state;
pub(crate) mod delivery;

pub(crate) use self::state::{Enqueued, HandlerOutcome, Mailbox, MsgHandler, SubscriptionCore};
pub use self::state::MsgFilter;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{NatsError, Result};
use crate::message::Msg;

/// Handle to a registered subscription
///
/// Cloning is cheap; dropping a handle does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) core: Arc<SubscriptionCore>,
}

impl Subscription {
    pub(crate) fn new(core: Arc<SubscriptionCore>) -> Self {
        Self { core }
    }

    /// Subscription id, unique for the lifetime of the connection
    #[must_use]
    pub fn sid(&self) -> u64 {
        self.core.sid
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.core.subject
    }

    #[must_use]
    pub fn queue_group(&self) -> Option<&str> {
        self.core.queue_group.as_deref()
    }

    /// Queued but not yet consumed (messages, bytes)
    #[must_use]
    pub fn pending(&self) -> (u64, u64) {
        self.core.pending()
    }

    /// Highest pending counts seen (messages, bytes)
    #[must_use]
    pub fn max_pending(&self) -> (u64, u64) {
        self.core.max_pending()
    }

    pub fn clear_max_pending(&self) {
        self.core.clear_max_pending();
    }

    /// Configured pending limits (messages, bytes); -1 is unlimited
    #[must_use]
    pub fn pending_limits(&self) -> (i64, i64) {
        self.core.pending_limits()
    }

    /// Change the pending limits; each must be positive or -1
    pub fn set_pending_limits(&self, msgs: i64, bytes: i64) -> Result<()> {
        self.core.set_pending_limits(msgs, bytes)
    }

    /// Messages handed to the caller or handler so far
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.core.delivered()
    }

    /// Messages discarded because a pending limit was hit
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.core.dropped()
    }

    /// Check the subscription is still registered with an open connection
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.core.is_closed() && self.core.connection().is_some_and(|c| !c.is_closed())
    }

    /// Install a predicate run before queueing; rejected messages are not
    /// counted against pending limits
    ///
    /// The predicate runs on the connection's read task and must not block.
    pub fn set_message_filter<F>(&self, filter: F)
    where
        F: Fn(&Msg) -> bool + Send + Sync + 'static,
    {
        self.core.set_filter(Some(Arc::new(filter)));
    }

    pub fn clear_message_filter(&self) {
        self.core.set_filter(None);
    }

    /// Remove interest immediately; queued messages are discarded
    pub fn unsubscribe(&self) -> Result<()> {
        let conn = self.core.connection().ok_or(NatsError::ConnectionClosed)?;
        conn.unsubscribe(self.core.sid)
    }

    /// Unsubscribe automatically once `max` messages have been received
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        if max == 0 {
            return Err(NatsError::InvalidArgument(
                "auto-unsubscribe limit must be greater than zero".into(),
            ));
        }
        let conn = self.core.connection().ok_or(NatsError::ConnectionClosed)?;
        if self.core.is_closed() {
            return Err(NatsError::BadSubscription);
        }
        if self.core.set_max(max) {
            return conn.unsubscribe(self.core.sid);
        }
        conn.send_unsub(self.core.sid, Some(max))
    }

    /// Stop interest, let queued messages be consumed, then unsubscribe,
    /// bounded by the connection's drain timeout
    pub async fn drain(&self) -> Result<()> {
        let conn = self.core.connection().ok_or(NatsError::ConnectionClosed)?;
        self.core.drain(conn.opts.drain_timeout).await
    }

    /// [`drain`](Self::drain) with an explicit timeout
    pub async fn drain_timeout(&self, timeout: Duration) -> Result<()> {
        self.core.drain(timeout).await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.core.sid)
            .field("subject", &self.core.subject)
            .field("queue_group", &self.core.queue_group)
            .finish()
    }
}

/// Subscription drained by the caller
#[derive(Debug, Clone)]
pub struct SyncSubscription(Subscription);

impl SyncSubscription {
    pub(crate) fn new(core: Arc<SubscriptionCore>) -> Self {
        Self(Subscription::new(core))
    }

    /// Wait up to `timeout` for the next message
    ///
    /// Returns [`NatsError::Timeout`] if nothing arrived,
    /// [`NatsError::MaxMessagesDelivered`] once an auto-unsubscribe limit was
    /// consumed, and [`NatsError::ConnectionClosed`] or
    /// [`NatsError::BadSubscription`] after the subscription ended.
    pub async fn next_msg(&self, timeout: Duration) -> Result<Msg> {
        self.0.core.next_msg(Some(timeout)).await
    }

    /// Wait for the next message without a timeout
    pub async fn recv(&self) -> Result<Msg> {
        self.0.core.next_msg(None).await
    }
}

impl Deref for SyncSubscription {
    type Target = Subscription;

    fn deref(&self) -> &Subscription {
        &self.0
    }
}

/// Subscription whose messages are delivered to a handler
#[derive(Debug, Clone)]
pub struct AsyncSubscription(Subscription);

impl AsyncSubscription {
    pub(crate) fn new(core: Arc<SubscriptionCore>) -> Self {
        Self(Subscription::new(core))
    }
}

impl Deref for AsyncSubscription {
    type Target = Subscription;

    fn deref(&self) -> &Subscription {
        &self.0
    }
}
