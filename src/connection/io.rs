//! Per-socket I/O tasks
//!
//! Each installed socket gets three tasks sharing one cancellation token and
//! generation number:
//! - the read loop feeds bytes to the [`Parser`] and dispatches operations
//! - the flusher writes the outbound buffer when kicked, after a short
//!   coalescing delay
//! - the pinger sends keepalive PINGs and detects stale connections
//!
//! A task that hits an error reports it with its generation; errors from an
//! older socket are ignored.

use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::ConnectionState;
use super::inner::ConnInner;
use crate::constants::protocol::PONG;
use crate::error::{NatsError, Result, classify_server_error};
use crate::message::Msg;
use crate::protocol::{Headers, MsgArgs, Parser, ProtocolHandler, ServerInfo};
use crate::stream::ConnectionStream;
use crate::subscription::Enqueued;

/// Report a background error at its own level
pub(crate) fn log_error(context: &str, err: &NatsError) {
    match err.log_level() {
        tracing::Level::ERROR => error!("{}: {}", context, err),
        tracing::Level::WARN => warn!("{}: {}", context, err),
        _ => debug!("{}: {}", context, err),
    }
}

/// Parser callbacks bound to one connection
struct ReadHandler<'a> {
    inner: &'a Arc<ConnInner>,
}

impl ProtocolHandler for ReadHandler<'_> {
    fn process_info(&mut self, json: &[u8]) -> Result<()> {
        let info = ServerInfo::parse(json)?;
        debug!("Received INFO update from {}", info.server_id);
        let events = self
            .inner
            .state
            .lock()
            .apply_info(info, self.inner.opts.ignore_discovered_servers);
        for event in events {
            self.inner.events.dispatch(event);
        }
        Ok(())
    }

    fn process_msg(&mut self, args: &MsgArgs<'_>, payload: &[u8]) -> Result<()> {
        self.inner.stats.record_in(payload.len());
        let (headers, data) = if args.header_len > 0 {
            let (block, data) = payload.split_at(args.header_len);
            (Some(Headers::parse(block)?), data)
        } else {
            (None, payload)
        };
        let mut msg = Msg {
            subject: args.subject.to_string(),
            reply: args.reply.map(str::to_string),
            headers,
            data: Bytes::copy_from_slice(data),
            sub: None,
        };

        let mut st = self.inner.state.lock();
        let Some(core) = st.subs.get(&args.sid).cloned() else {
            trace!("Dropping message for unknown sid {}", args.sid);
            return Ok(());
        };
        msg.sub = Some(Arc::downgrade(&core));
        match core.enqueue(msg) {
            Enqueued::Queued | Enqueued::Filtered | Enqueued::Rejected => {}
            Enqueued::Dropped { first } => {
                if first {
                    warn!("Slow consumer on subscription {} ({})", core.sid, core.subject);
                    self.inner.events.dispatch_error(NatsError::SlowConsumer {
                        sid: core.sid,
                        subject: core.subject.clone(),
                    });
                }
            }
            Enqueued::OverMax => {
                st.subs.remove(&args.sid);
                drop(st);
                core.close();
                debug!("Subscription {} reached its message limit", args.sid);
            }
        }
        Ok(())
    }

    fn process_ping(&mut self) -> Result<()> {
        self.inner.state.lock().outbound.extend_from_slice(PONG);
        self.inner.kick_flusher();
        Ok(())
    }

    fn process_pong(&mut self) -> Result<()> {
        let waiter = {
            let mut st = self.inner.state.lock();
            st.pings_out = 0;
            st.pongs.pop_front().and_then(|slot| slot.tx)
        };
        if let Some(tx) = waiter {
            let _ = tx.send(true);
        }
        Ok(())
    }

    fn process_ok(&mut self) -> Result<()> {
        trace!("+OK");
        Ok(())
    }

    fn process_err(&mut self, text: &str) -> Result<()> {
        let err = classify_server_error(text);
        match err {
            NatsError::AuthViolation(_) => {
                warn!("Server reported: {}", err);
                self.inner.state.lock().last_error = Some(err.clone());
                self.inner.events.dispatch_error(err);
                Ok(())
            }
            _ => Err(err),
        }
    }
}

async fn read_until_error(
    inner: &Arc<ConnInner>,
    mut reader: ReadHalf<ConnectionStream>,
    leftover: Vec<u8>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut parser = Parser::new();
    let mut handler = ReadHandler { inner };
    if !leftover.is_empty() {
        parser.parse(&leftover, &mut handler)?;
    }

    let mut buf = vec![0u8; inner.opts.read_buffer_size];
    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )
            .into());
        }
        parser.parse(&buf[..n], &mut handler)?;
    }
}

pub(crate) async fn read_loop(
    inner: Arc<ConnInner>,
    generation: u64,
    reader: ReadHalf<ConnectionStream>,
    leftover: Vec<u8>,
    cancel: CancellationToken,
) {
    if let Err(err) = read_until_error(&inner, reader, leftover, &cancel).await {
        if err.is_fatal() {
            error!("Protocol error, dropping connection: {}", err);
        } else {
            log_error("Read loop ended", &err);
        }
        inner.handle_disconnect(generation, err).await;
    }
    trace!("Read loop for generation {} exited", generation);
}

impl ConnInner {
    /// Write everything buffered to the current socket
    ///
    /// A write blocked on a peer that stopped reading is abandoned once
    /// `cancel` fires, releasing the writer for reconnect or close.
    pub(crate) async fn flush_outbound(
        &self,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let pending = {
            let mut st = self.state.lock();
            if st.generation != generation
                || !st.status.is_connected()
                || st.outbound.is_empty()
            {
                return Ok(());
            }
            st.unflushed_pings = 0;
            st.outbound.split().freeze()
        };
        let Some(socket) = writer.as_mut() else {
            return Ok(());
        };
        trace!("Flushing {} bytes", pending.len());
        let written = tokio::select! {
            () = cancel.cancelled() => {
                debug!("Socket torn down with {} bytes unwritten", pending.len());
                return Ok(());
            }
            written = async {
                socket.write_all(&pending).await?;
                socket.flush().await
            } => written,
        };
        written?;
        Ok(())
    }
}

pub(crate) async fn flusher_loop(inner: Arc<ConnInner>, generation: u64, cancel: CancellationToken) {
    let coalesce = inner.opts.flusher_coalesce_interval;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = inner.flush_kick.notified() => {}
        }
        if !coalesce.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(coalesce) => {}
            }
        }
        if let Err(err) = inner.flush_outbound(generation, &cancel).await {
            log_error("Flush failed", &err);
            inner.handle_disconnect(generation, err).await;
            return;
        }
    }
}

pub(crate) async fn ping_loop(inner: Arc<ConnInner>, generation: u64, cancel: CancellationToken) {
    let period = inner.opts.ping_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let stale = {
            let mut st = inner.state.lock();
            if st.generation != generation {
                return;
            }
            if st.status != ConnectionState::Connected {
                continue;
            }
            st.pings_out += 1;
            if st.pings_out > inner.opts.max_pings_out {
                true
            } else {
                st.queue_ping(None);
                false
            }
        };
        if stale {
            warn!("No PONG for {} pings, connection is stale", inner.opts.max_pings_out);
            inner
                .handle_disconnect(generation, NatsError::StaleConnection)
                .await;
            return;
        }
        trace!("Keepalive PING");
        inner.kick_flusher();
    }
}

/// Start the read, flush, and ping tasks for a freshly installed socket
pub(crate) fn spawn_io(
    inner: &Arc<ConnInner>,
    generation: u64,
    cancel: &CancellationToken,
    reader: ReadHalf<ConnectionStream>,
    leftover: Vec<u8>,
) {
    inner.runtime.spawn(read_loop(
        Arc::clone(inner),
        generation,
        reader,
        leftover,
        cancel.clone(),
    ));
    inner
        .runtime
        .spawn(flusher_loop(Arc::clone(inner), generation, cancel.clone()));
    inner
        .runtime
        .spawn(ping_loop(Arc::clone(inner), generation, cancel.clone()));
}
