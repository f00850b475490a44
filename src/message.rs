//! Delivered messages

use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{NatsError, Result};
use crate::protocol::Headers;
use crate::subscription::SubscriptionCore;

/// A message received on a subscription
///
/// Immutable once built. Holds a weak back-reference to the subscription
/// that produced it so [`Msg::respond`] can reach the connection.
#[derive(Clone)]
pub struct Msg {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<Headers>,
    pub data: Bytes,
    pub(crate) sub: Option<Weak<SubscriptionCore>>,
}

impl Msg {
    /// Build a detached message (no subscription back-reference)
    pub fn new(subject: impl Into<String>, reply: Option<String>, data: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply,
            headers: None,
            data: data.into(),
            sub: None,
        }
    }

    /// Subscription id this message was delivered on
    #[must_use]
    pub fn sid(&self) -> Option<u64> {
        self.subscription().map(|s| s.sid)
    }

    pub(crate) fn subscription(&self) -> Option<Arc<SubscriptionCore>> {
        self.sub.as_ref().and_then(Weak::upgrade)
    }

    /// Payload size used for pending-byte accounting
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Header status code, if the message carried one
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.headers.as_ref().and_then(Headers::status)
    }

    /// Check for the server's "no responders" reply to a request
    #[must_use]
    pub fn is_no_responders(&self) -> bool {
        self.data.is_empty() && self.headers.as_ref().is_some_and(Headers::is_no_responders)
    }

    /// Publish `data` to this message's reply subject
    pub fn respond(&self, data: &[u8]) -> Result<()> {
        let reply = self
            .reply
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| NatsError::InvalidArgument("message has no reply subject".into()))?;
        let conn = self
            .subscription()
            .and_then(|s| s.connection())
            .ok_or(NatsError::BadSubscription)?;
        conn.publish(reply, None, None, data)
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("sid", &self.sid())
            .finish()
    }
}
