//! Client connection
//!
//! [`Connection`] is a cheap, cloneable handle over shared state. The state
//! is driven by per-socket tasks (reader, flusher, pinger) plus a reconnect
//! task while the server is unreachable. The last handle to go away closes
//! the connection.
//!
//! # Example
//!
//! ```no_run
//! use nats_core_client::Connection;
//! use std::time::Duration;
//!
//! # async fn run() -> nats_core_client::Result<()> {
//! let nc = Connection::connect_url("nats://127.0.0.1:4222").await?;
//! let sub = nc.subscribe_sync("greet.*")?;
//! nc.publish("greet.joe", b"hello")?;
//! let msg = sub.next_msg(Duration::from_secs(1)).await?;
//! assert_eq!(&msg.data[..], b"hello");
//! nc.close().await;
//! # Ok(())
//! # }
//! ```

mod events;
mod handshake;
mod inner;
mod io;
mod lifecycle;
mod request;
mod stats;

pub use events::Event;
pub use stats::Stats;

pub(crate) use inner::ConnInner;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Options;
use crate::error::{NatsError, Result};
use crate::message::Msg;
use crate::nuid;
use crate::protocol::{Headers, ServerInfo};
use crate::subscription::{AsyncSubscription, HandlerOutcome, MsgHandler, SyncSubscription};

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Subscriptions are draining; publishing is still allowed
    DrainingSubs,
    /// Subscriptions are done; buffered publishes are being flushed
    DrainingPubs,
    Closed,
}

impl ConnectionState {
    /// Check if a socket is installed and serving traffic
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::DrainingSubs | Self::DrainingPubs)
    }

    #[must_use]
    pub const fn is_draining(self) -> bool {
        matches!(self, Self::DrainingSubs | Self::DrainingPubs)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::DrainingSubs => "draining subscriptions",
            Self::DrainingPubs => "draining publishes",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Closes the connection when the last [`Connection`] handle is dropped
struct DropGuard {
    inner: Arc<ConnInner>,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if self.inner.is_closed() {
            return;
        }
        debug!("Last connection handle dropped, closing");
        if Handle::try_current().is_ok() {
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(async move { inner.close_with(None).await });
        } else {
            self.inner.close_now();
        }
    }
}

/// Handle to a NATS connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
    _guard: Arc<DropGuard>,
}

impl Connection {
    /// Connect using `opts`, trying each server in the pool once
    ///
    /// Fails with the last server's error if none accepted the handshake.
    pub async fn connect(opts: Options) -> Result<Self> {
        let inner = ConnInner::connect(opts).await?;
        let guard = Arc::new(DropGuard {
            inner: Arc::clone(&inner),
        });
        Ok(Self {
            inner,
            _guard: guard,
        })
    }

    /// Connect to a single URL (or a comma-separated list) with default options
    pub async fn connect_url(url: &str) -> Result<Self> {
        let servers = url.split(',').map(str::trim).filter(|s| !s.is_empty());
        Self::connect(Options::with_servers(servers)).await
    }

    /// Publish `data` on `subject`
    ///
    /// The message is buffered and written by the flusher; use
    /// [`flush`](Self::flush) to wait until the server has processed it.
    pub fn publish(&self, subject: &str, data: &[u8]) -> Result<()> {
        self.inner.publish(subject, None, None, data)
    }

    pub fn publish_with_reply(&self, subject: &str, reply: &str, data: &[u8]) -> Result<()> {
        self.inner.publish(subject, Some(reply), None, data)
    }

    /// Publish with a header block (HPUB)
    pub fn publish_with_headers(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: &Headers,
        data: &[u8],
    ) -> Result<()> {
        self.inner.publish(subject, reply, Some(headers), data)
    }

    /// Publish `count` bytes of `data` starting at `offset`
    pub fn publish_slice(
        &self,
        subject: &str,
        reply: Option<&str>,
        data: &[u8],
        offset: usize,
        count: usize,
    ) -> Result<()> {
        let slice = offset
            .checked_add(count)
            .and_then(|end| data.get(offset..end))
            .ok_or_else(|| {
                NatsError::InvalidArgument(format!(
                    "range {offset}+{count} out of bounds for {} bytes",
                    data.len()
                ))
            })?;
        self.inner.publish(subject, reply, None, slice)
    }

    /// Round-trip a PING, waiting up to the configured flush timeout
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush(self.inner.opts.flush_timeout).await
    }

    pub async fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.flush(timeout).await
    }

    /// Subscribe with a caller-drained queue
    pub fn subscribe_sync(&self, subject: &str) -> Result<SyncSubscription> {
        let core = self.inner.subscribe(subject, None, None)?;
        Ok(SyncSubscription::new(core))
    }

    pub fn queue_subscribe_sync(&self, subject: &str, queue: &str) -> Result<SyncSubscription> {
        let core = self.inner.subscribe(subject, Some(queue), None)?;
        Ok(SyncSubscription::new(core))
    }

    /// Subscribe with a handler
    ///
    /// Messages for one subscription are handled in order, one at a time.
    /// A panicking handler is logged and delivery continues.
    pub fn subscribe<F>(&self, subject: &str, handler: F) -> Result<AsyncSubscription>
    where
        F: Fn(Msg) + Send + Sync + 'static,
    {
        let core = self.inner.subscribe(subject, None, Some(wrap_handler(handler)))?;
        Ok(AsyncSubscription::new(core))
    }

    pub fn queue_subscribe<F>(
        &self,
        subject: &str,
        queue: &str,
        handler: F,
    ) -> Result<AsyncSubscription>
    where
        F: Fn(Msg) + Send + Sync + 'static,
    {
        let core = self
            .inner
            .subscribe(subject, Some(queue), Some(wrap_handler(handler)))?;
        Ok(AsyncSubscription::new(core))
    }

    /// Send a request and wait for the first reply, up to the configured
    /// request timeout
    pub async fn request(&self, subject: &str, data: &[u8]) -> Result<Msg> {
        self.inner
            .request(subject, None, data, self.inner.opts.request_timeout, None)
            .await
    }

    pub async fn request_timeout(
        &self,
        subject: &str,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Msg> {
        self.inner.request(subject, None, data, timeout, None).await
    }

    pub async fn request_with_headers(
        &self,
        subject: &str,
        headers: &Headers,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Msg> {
        self.inner
            .request(subject, Some(headers), data, timeout, None)
            .await
    }

    /// Send a request that can be abandoned through `cancel`
    ///
    /// Returns [`NatsError::Cancelled`] if the token fires first.
    pub async fn request_with_cancel(
        &self,
        subject: &str,
        data: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Msg> {
        self.inner
            .request(subject, None, data, timeout, Some(cancel))
            .await
    }

    /// Generate a unique reply subject under the inbox prefix
    #[must_use]
    pub fn new_inbox(&self) -> String {
        format!("{}.{}", self.inner.opts.inbox_prefix, nuid::next())
    }

    /// Drain subscriptions, flush publishes, then close, within the
    /// configured drain timeout
    pub async fn drain(&self) -> Result<()> {
        self.inner.drain(self.inner.opts.drain_timeout).await
    }

    pub async fn drain_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.drain(timeout).await
    }

    /// Flush what is buffered (briefly) and close; idempotent
    pub async fn close(&self) {
        self.inner.close_with(None).await;
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.status()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.state() == ConnectionState::Reconnecting
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.state().is_draining()
    }

    /// URL of the server currently connected to
    #[must_use]
    pub fn connected_url(&self) -> Option<String> {
        let st = self.inner.state.lock();
        if st.status.is_connected() {
            st.connected_url.as_ref().map(ToString::to_string)
        } else {
            None
        }
    }

    #[must_use]
    pub fn connected_server_id(&self) -> Option<String> {
        let st = self.inner.state.lock();
        st.status.is_connected().then(|| st.info.server_id.clone())
    }

    /// Most recent INFO received from the server
    #[must_use]
    pub fn server_info(&self) -> ServerInfo {
        self.inner.state.lock().info.clone()
    }

    /// Every server in the pool
    #[must_use]
    pub fn servers(&self) -> Vec<String> {
        self.inner.state.lock().pool.server_list(false)
    }

    /// Servers learned from INFO `connect_urls`
    #[must_use]
    pub fn discovered_servers(&self) -> Vec<String> {
        self.inner.state.lock().pool.server_list(true)
    }

    /// Maximum payload accepted by the current server; 0 before connecting
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.inner.state.lock().info.max_payload
    }

    #[must_use]
    pub fn last_error(&self) -> Option<NatsError> {
        self.inner.state.lock().last_error.clone()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subs.len()
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.inner.opts
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("url", &self.connected_url())
            .finish()
    }
}

fn wrap_handler<F>(handler: F) -> MsgHandler
where
    F: Fn(Msg) + Send + Sync + 'static,
{
    Arc::new(move |msg| {
        handler(msg);
        HandlerOutcome::Continue
    })
}
