//! Connect, reconnect, and drain
//!
//! ```text
//! Connecting ──handshake──> Connected <──────────────┐
//!                              │ I/O error           │ handshake
//!                              v                     │
//!                         Reconnecting ──────────────┘
//!                              │ pool exhausted
//!                              v
//! Connected ─drain─> DrainingSubs ─> DrainingPubs ─> Closed
//! ```
//!
//! Handshakes run without the state lock; the status (`Connecting` or
//! `Reconnecting`) keeps other tasks away from the socket meanwhile. A drain
//! requested while reconnecting waits for the new session first.

use bytes::BytesMut;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::ConnectionState;
use super::events::Event;
use super::handshake::{self, Session};
use super::inner::ConnInner;
use super::io::{log_error, spawn_io};
use crate::config::Options;
use crate::constants::timing::CLOSE_FLUSH;
use crate::error::{NatsError, Result};
use crate::pool::ServerPool;
use crate::protocol::{put_sub, put_unsub};
use crate::tls::{TlsConfig, TlsManager};

enum AfterDisconnect {
    Ignore,
    Reconnect(Vec<oneshot::Sender<bool>>),
    Close,
}

/// Result of adopting a handshaken socket
pub(crate) enum Installed {
    /// Replay written; the I/O tasks own the socket
    Live,
    /// Writing the replay failed; the caller routes the error
    Lost { generation: u64, err: NatsError },
}

fn release_flushes(waiters: Vec<oneshot::Sender<bool>>) {
    for tx in waiters {
        let _ = tx.send(false);
    }
}

/// Errors that a fresh socket may cure
fn triggers_reconnect(err: &NatsError) -> bool {
    err.is_recoverable() || err.is_fatal()
}

impl ConnInner {
    /// Try each configured server once and return the connected state
    pub(crate) async fn connect(opts: Options) -> Result<Arc<Self>> {
        opts.validate()?;
        let pool = ServerPool::new(&opts.servers, opts.no_randomize)?;
        let tls = if opts.secure || pool.has_secure_server() {
            Some(TlsManager::new(&TlsConfig {
                verify_cert: opts.tls_verify_cert,
                ca_cert_path: opts.tls_ca_cert_path.clone(),
            })?)
        } else {
            None
        };

        let inner = Arc::new(Self::new(opts, pool, tls, Handle::current()));
        let ids = inner.state.lock().pool.ids();
        let mut last_err = NatsError::NoServers;
        for id in ids {
            let url = {
                let mut st = inner.state.lock();
                let Some(srv) = st.pool.get_mut(id) else {
                    continue;
                };
                srv.mark_attempt();
                srv.url.clone()
            };
            info!("Connecting to {}", url);
            match handshake::establish(&inner.opts, &url, inner.tls.as_ref()).await {
                Ok(session) => {
                    let installed = inner.install_session(id, session, false).await?;
                    info!("Connected to {}", url);
                    if let Installed::Lost { generation, err } = installed {
                        inner.handle_disconnect(generation, err).await;
                    }
                    return Ok(inner);
                }
                Err(err) => {
                    log_error(&format!("Connect to {url} failed"), &err);
                    last_err = err;
                }
            }
        }

        inner.close_with(Some(last_err.clone())).await;
        Err(last_err)
    }

    /// Adopt a handshaken socket: replay state and start the I/O tasks
    ///
    /// A failed replay write is returned rather than handled here so the
    /// reconnect loop can route it without re-entering itself.
    pub(crate) async fn install_session(
        self: &Arc<Self>,
        server_id: u64,
        session: Session,
        reconnect: bool,
    ) -> Result<Installed> {
        let Session {
            reader,
            mut writer,
            info,
            leftover,
            url,
        } = session;

        let mut socket = self.writer.lock().await;
        let (generation, cancel, replay, events) = {
            let mut st = self.state.lock();
            if st.status == ConnectionState::Closed {
                return Err(NatsError::ConnectionClosed);
            }
            st.generation += 1;
            st.io_cancel = CancellationToken::new();
            st.pool.set_current(server_id);
            if let Some(srv) = st.pool.current_mut() {
                srv.did_connect = true;
                srv.reconnects = 0;
            }
            let events = st.apply_info(info, self.opts.ignore_discovered_servers);
            st.connected_url = Some(url);
            st.pings_out = 0;
            st.status = ConnectionState::Connected;

            // Subscriptions first, then whatever was buffered during the outage
            let mut replay = BytesMut::new();
            if reconnect {
                let mut subs: Vec<_> = st.subs.values().cloned().collect();
                subs.sort_by_key(|core| core.sid);
                for core in subs {
                    let remaining = core.remaining();
                    if remaining == Some(0) {
                        continue;
                    }
                    put_sub(&mut replay, &core.subject, core.queue_group.as_deref(), core.sid);
                    if remaining.is_some() {
                        put_unsub(&mut replay, core.sid, remaining);
                    }
                }
            }
            replay.extend_from_slice(&st.outbound.split());
            st.unflushed_pings = 0;
            (st.generation, st.io_cancel.clone(), replay.freeze(), events)
        };

        let written = if replay.is_empty() {
            Ok(())
        } else {
            trace!("Replaying {} bytes", replay.len());
            tokio::select! {
                () = cancel.cancelled() => Ok(()),
                written = async {
                    writer.write_all(&replay).await?;
                    writer.flush().await
                } => written,
            }
        };
        if cancel.is_cancelled() {
            // Closed while replaying
            return Err(NatsError::ConnectionClosed);
        }
        *socket = Some(writer);
        drop(socket);

        spawn_io(self, generation, &cancel, reader, leftover);
        self.session_change.notify_waiters();
        for event in events {
            self.events.dispatch(event);
        }
        Ok(match written {
            Ok(()) => Installed::Live,
            Err(e) => Installed::Lost {
                generation,
                err: e.into(),
            },
        })
    }

    /// Record a lost socket and decide what happens next
    fn mark_lost(&self, generation: u64, err: &NatsError) -> AfterDisconnect {
        let mut st = self.state.lock();
        if st.generation != generation || !st.status.is_connected() {
            return AfterDisconnect::Ignore;
        }
        st.io_cancel.cancel();
        st.last_error = Some(err.clone());
        if self.opts.allow_reconnect && !st.status.is_draining() && triggers_reconnect(err) {
            st.status = ConnectionState::Reconnecting;
            st.pings_out = 0;
            AfterDisconnect::Reconnect(st.reset_pongs())
        } else {
            st.status = ConnectionState::Disconnected;
            AfterDisconnect::Close
        }
    }

    /// Central error path for the I/O tasks
    ///
    /// Errors from an older socket generation, or arriving while the
    /// connection is already closing or reconnecting, are ignored.
    pub(crate) async fn handle_disconnect(self: &Arc<Self>, generation: u64, err: NatsError) {
        match self.mark_lost(generation, &err) {
            AfterDisconnect::Ignore => trace!("Ignoring error from stale I/O task: {}", err),
            AfterDisconnect::Reconnect(released) => {
                info!("Connection lost ({}), reconnecting", err);
                release_flushes(released);
                self.events.dispatch(Event::Disconnected);
                self.runtime.spawn(Arc::clone(self).reconnect_loop());
            }
            AfterDisconnect::Close => {
                info!("Connection lost ({}), closing", err);
                self.events.dispatch(Event::Disconnected);
                self.close_with(Some(err)).await;
            }
        }
    }

    /// Sleep unless the connection closes first; returns false if it did
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.shutdown.is_cancelled();
        }
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn reconnect_delay(&self, since_last_attempt: Option<Duration>) -> Duration {
        let wait = self.opts.reconnect_wait;
        let Some(elapsed) = since_last_attempt.filter(|e| *e < wait) else {
            return Duration::ZERO;
        };
        let jitter = if self.tls.is_some() {
            self.opts.reconnect_jitter_tls
        } else {
            self.opts.reconnect_jitter
        };
        let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        wait - elapsed + extra
    }

    async fn reconnect_loop(self: Arc<Self>) {
        // The old socket is dead; dropping the write half releases it
        self.writer.lock().await.take();

        let mut tried_in_pass = 0usize;
        let mut passes = 0u32;
        loop {
            let (id, url, since, pool_len) = {
                let mut st = self.state.lock();
                if st.status != ConnectionState::Reconnecting {
                    return;
                }
                let Some(srv) = st.pool.select_next_server(self.opts.max_reconnect) else {
                    break;
                };
                let picked = (srv.id, srv.url.clone(), srv.since_last_attempt());
                (picked.0, picked.1, picked.2, st.pool.len())
            };

            let delay = match &self.opts.callbacks.reconnect_delay {
                Some(callback) if tried_in_pass >= pool_len => {
                    tried_in_pass = 0;
                    passes += 1;
                    callback(passes)
                }
                Some(_) => Duration::ZERO,
                None => self.reconnect_delay(since),
            };
            if !delay.is_zero() {
                debug!("Waiting {:?} before reconnecting to {}", delay, url);
            }
            if !self.pause(delay).await {
                return;
            }
            tried_in_pass += 1;

            {
                let mut st = self.state.lock();
                if let Some(srv) = st.pool.get_mut(id) {
                    srv.reconnects += 1;
                    srv.mark_attempt();
                }
            }
            info!("Reconnecting to {}", url);
            match handshake::establish(&self.opts, &url, self.tls.as_ref()).await {
                Ok(session) => match self.install_session(id, session, true).await {
                    Ok(Installed::Live) => {
                        self.stats.record_reconnect();
                        info!("Reconnected to {}", url);
                        self.events.dispatch(Event::Reconnected);
                        return;
                    }
                    Ok(Installed::Lost { generation, err }) => {
                        log_error(&format!("Replay to {url} failed"), &err);
                        match self.mark_lost(generation, &err) {
                            AfterDisconnect::Reconnect(released) => {
                                release_flushes(released);
                                self.writer.lock().await.take();
                            }
                            AfterDisconnect::Close => {
                                self.close_with(Some(err)).await;
                                return;
                            }
                            AfterDisconnect::Ignore => return,
                        }
                    }
                    Err(err) => {
                        debug!("Dropping session to {}: {}", url, err);
                        return;
                    }
                },
                Err(err) => {
                    log_error(&format!("Reconnect to {url} failed"), &err);
                    self.state.lock().last_error = Some(err);
                }
            }
        }

        warn!("Reconnect attempts exhausted, closing");
        self.close_with(Some(NatsError::NoServers)).await;
    }

    /// Drain every subscription, then stop publishing, flush, and close
    ///
    /// While reconnecting, the drain first waits (within `timeout`) for the
    /// new session so publishes buffered during the outage reach the server.
    /// If no session comes back in time the connection is closed.
    pub(crate) async fn drain(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let subs: Vec<_> = loop {
            let notified = self.session_change.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                match st.status {
                    ConnectionState::Closed | ConnectionState::Disconnected => {
                        return Err(NatsError::ConnectionClosed);
                    }
                    ConnectionState::DrainingSubs | ConnectionState::DrainingPubs => {
                        return Err(NatsError::Draining);
                    }
                    ConnectionState::Connected => {
                        st.status = ConnectionState::DrainingSubs;
                        break st.subs.values().cloned().collect();
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                }
            }
            debug!("Drain waiting for the reconnect to finish");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!("Still reconnecting when the drain timed out, closing");
                self.close_with(None).await;
                return Err(NatsError::Timeout);
            }
        };
        info!("Draining connection with {} subscription(s)", subs.len());

        let drained =
            tokio::time::timeout_at(deadline, join_all(subs.iter().map(|s| s.drain(timeout))))
                .await;
        let mut result = match drained {
            Ok(results) if results.iter().any(|r| matches!(r, Err(NatsError::Timeout))) => {
                Err(NatsError::Timeout)
            }
            Ok(_) => Ok(()),
            Err(_) => Err(NatsError::Timeout),
        };

        {
            let mut st = self.state.lock();
            if st.status != ConnectionState::DrainingSubs {
                return result;
            }
            st.status = ConnectionState::DrainingPubs;
        }
        debug!("Subscriptions drained, flushing publishes");

        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(err) = self.flush(remaining.max(CLOSE_FLUSH)).await
            && result.is_ok()
            && !err.is_closed()
        {
            result = Err(err);
        }
        self.close_with(None).await;
        result
    }
}
