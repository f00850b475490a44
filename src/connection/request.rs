//! Request/reply over one shared inbox subscription
//!
//! The first request subscribes to `<inbox_prefix>.<nuid>.*`. Each request
//! publishes with reply subject `<inbox_prefix>.<nuid>.<token>` and waits on
//! a oneshot keyed by `token`; the subscription's handler resolves it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::inner::ConnInner;
use crate::error::{NatsError, Result};
use crate::message::Msg;
use crate::nuid;
use crate::protocol::Headers;
use crate::subscription::{HandlerOutcome, MsgHandler};

/// Response multiplexer state, guarded by the connection lock
pub(crate) struct RespMux {
    /// `<inbox_prefix>.<nuid>.`
    prefix: String,
    waiters: HashMap<String, oneshot::Sender<Result<Msg>>>,
}

impl RespMux {
    fn token<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject.strip_prefix(self.prefix.as_str())
    }

    pub(crate) fn into_waiters(self) -> Vec<oneshot::Sender<Result<Msg>>> {
        self.waiters.into_values().collect()
    }
}

impl ConnInner {
    /// Create the shared inbox subscription on first use
    ///
    /// Returns the reply-subject prefix.
    fn ensure_resp_mux(self: &Arc<Self>) -> Result<String> {
        let (prefix, core) = {
            let mut st = self.state.lock();
            if let Some(mux) = &st.resp_mux {
                return Ok(mux.prefix.clone());
            }
            let prefix = format!("{}.{}.", self.opts.inbox_prefix, nuid::next());
            let weak = Arc::downgrade(self);
            let handler: MsgHandler = Arc::new(move |msg| {
                if let Some(inner) = weak.upgrade() {
                    inner.resolve_response(msg);
                }
                HandlerOutcome::Continue
            });
            let core =
                self.register_subscription(&mut st, &format!("{prefix}*"), None, Some(handler))?;
            st.resp_mux = Some(RespMux {
                prefix: prefix.clone(),
                waiters: HashMap::new(),
            });
            (prefix, core)
        };
        debug!("Created response subscription {}*", prefix);
        self.start_delivery(&core);
        self.kick_flusher();
        Ok(prefix)
    }

    fn resolve_response(&self, msg: Msg) {
        let waiter = {
            let mut st = self.state.lock();
            let Some(mux) = st.resp_mux.as_mut() else {
                return;
            };
            let Some(token) = mux.token(&msg.subject) else {
                return;
            };
            let token = token.to_string();
            mux.waiters.remove(&token)
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(msg));
            }
            None => trace!("No waiter for response on {}", msg.subject),
        }
    }

    fn remove_waiter(&self, token: &str) {
        if let Some(mux) = self.state.lock().resp_mux.as_mut() {
            mux.waiters.remove(token);
        }
    }

    /// Publish a request and wait for the first response
    pub(crate) async fn request(
        self: &Arc<Self>,
        subject: &str,
        headers: Option<&Headers>,
        data: &[u8],
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Msg> {
        let prefix = self.ensure_resp_mux()?;
        let token = nuid::next();
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state.lock();
            let mux = st.resp_mux.as_mut().ok_or(NatsError::ConnectionClosed)?;
            mux.waiters.insert(token.clone(), tx);
        }

        let reply = format!("{prefix}{token}");
        if let Err(e) = self.publish(subject, Some(&reply), headers, data) {
            self.remove_waiter(&token);
            return Err(e);
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            response = rx => match response {
                Ok(Ok(msg)) if msg.is_no_responders() => Err(NatsError::NoResponders),
                Ok(result) => result,
                Err(_) => Err(NatsError::ConnectionClosed),
            },
            () = tokio::time::sleep(timeout) => {
                self.remove_waiter(&token);
                Err(NatsError::Timeout)
            }
            () = cancelled => {
                self.remove_waiter(&token);
                Err(NatsError::Cancelled)
            }
        }
    }
}
