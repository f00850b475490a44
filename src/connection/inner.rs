//! Shared connection state and the operations that mutate it
//!
//! Locking:
//! - `writer` (async) serialises socket writes and is taken first; a holder
//!   blocked on the socket gives it up once the generation's `io_cancel` fires
//! - `state` (`parking_lot`) guards everything else and is never held
//!   across an `.await`
//! - a subscription's own lock is only taken after `state`

use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::events::{Event, EventDispatcher};
use super::request::RespMux;
use super::stats::Statistics;
use super::ConnectionState;
use crate::config::Options;
use crate::constants::buffer::OUTBOUND_INITIAL;
use crate::constants::protocol::{CRLF, PING};
use crate::constants::timing::CLOSE_FLUSH;
use crate::error::{NatsError, Result};
use crate::message::Msg;
use crate::pool::{ServerPool, ServerUrl};
use crate::protocol::{ControlLineEncoder, Headers, ServerInfo, put_sub, put_unsub};
use crate::stream::ConnectionStream;
use crate::subscription::delivery::{self, DeliveryPool};
use crate::subscription::{Mailbox, MsgHandler, SubscriptionCore};
use crate::tls::TlsManager;
use crate::types::{QueueGroup, Subject, is_valid_publish_subject};
use crate::queue::MsgQueue;

/// One outstanding PING; `tx` is `None` for keepalives and abandoned flushes
pub(crate) struct PongSlot {
    pub(crate) id: u64,
    pub(crate) tx: Option<oneshot::Sender<bool>>,
}

pub(crate) struct ConnState {
    pub(crate) status: ConnectionState,
    pub(crate) pool: ServerPool,
    pub(crate) info: ServerInfo,
    pub(crate) connected_url: Option<ServerUrl>,
    pub(crate) subs: HashMap<u64, Arc<SubscriptionCore>>,
    next_sid: u64,
    /// PINGs awaiting PONG, oldest first
    pub(crate) pongs: VecDeque<PongSlot>,
    next_pong_id: u64,
    pub(crate) pings_out: u32,
    /// PINGs sitting in `outbound`, not yet handed to the socket
    pub(crate) unflushed_pings: usize,
    /// Pending protocol bytes; doubles as the reconnect buffer
    pub(crate) outbound: BytesMut,
    encoder: ControlLineEncoder,
    pub(crate) last_error: Option<NatsError>,
    /// Bumped for every installed socket; stale I/O tasks compare against it
    pub(crate) generation: u64,
    pub(crate) io_cancel: CancellationToken,
    pub(crate) resp_mux: Option<RespMux>,
}

impl ConnState {
    fn new(pool: ServerPool) -> Self {
        Self {
            status: ConnectionState::Connecting,
            pool,
            info: ServerInfo::default(),
            connected_url: None,
            subs: HashMap::new(),
            next_sid: 0,
            pongs: VecDeque::new(),
            next_pong_id: 0,
            pings_out: 0,
            unflushed_pings: 0,
            outbound: BytesMut::with_capacity(OUTBOUND_INITIAL),
            encoder: ControlLineEncoder::new(),
            last_error: None,
            generation: 0,
            io_cancel: CancellationToken::new(),
            resp_mux: None,
        }
    }

    /// Append a PING and its pong slot
    pub(crate) fn queue_ping(&mut self, tx: Option<oneshot::Sender<bool>>) -> u64 {
        let id = self.next_pong_id;
        self.next_pong_id += 1;
        self.pongs.push_back(PongSlot { id, tx });
        self.outbound.extend_from_slice(PING);
        self.unflushed_pings += 1;
        id
    }

    /// Release every pong waiter as failed, keeping placeholders for PINGs
    /// still in the outbound buffer so replayed PINGs stay paired
    pub(crate) fn reset_pongs(&mut self) -> Vec<oneshot::Sender<bool>> {
        let released = self.pongs.drain(..).filter_map(|slot| slot.tx).collect();
        for _ in 0..self.unflushed_pings {
            let id = self.next_pong_id;
            self.next_pong_id += 1;
            self.pongs.push_back(PongSlot { id, tx: None });
        }
        released
    }

    /// Apply INFO contents; returns the events to fire
    pub(crate) fn apply_info(&mut self, info: ServerInfo, ignore_discovered: bool) -> Vec<Event> {
        let mut events = Vec::new();
        if !ignore_discovered && !info.connect_urls.is_empty() {
            let grew = self.pool.add(&info.connect_urls, true);
            self.pool.prune_out_of_date(&info.connect_urls);
            if grew {
                events.push(Event::ServersDiscovered(self.pool.server_list(true)));
            }
        }
        if info.lame_duck_mode {
            events.push(Event::LameDuckMode);
        }
        self.info = info;
        events
    }
}

/// Work left after the state flips to `Closed`
struct CloseWork {
    previous: ConnectionState,
    pongs: Vec<oneshot::Sender<bool>>,
    subs: Vec<Arc<SubscriptionCore>>,
    requests: Vec<oneshot::Sender<Result<Msg>>>,
}

pub(crate) struct ConnInner {
    pub(crate) opts: Options,
    pub(crate) state: Mutex<ConnState>,
    pub(crate) writer: tokio::sync::Mutex<Option<WriteHalf<ConnectionStream>>>,
    pub(crate) flush_kick: Notify,
    /// Woken when a session is installed or the connection closes
    pub(crate) session_change: Notify,
    pub(crate) stats: Statistics,
    pub(crate) events: EventDispatcher,
    delivery_pool: Option<DeliveryPool>,
    pub(crate) tls: Option<TlsManager>,
    pub(crate) runtime: Handle,
    /// Cancelled once the connection is closed
    pub(crate) shutdown: CancellationToken,
}

impl ConnInner {
    pub(crate) fn new(
        opts: Options,
        pool: ServerPool,
        tls: Option<TlsManager>,
        runtime: Handle,
    ) -> Self {
        let events = EventDispatcher::start(opts.callbacks.event.clone(), &runtime);
        let delivery_pool = (opts.subscriber_delivery_task_count > 0).then(|| {
            DeliveryPool::start(
                opts.subscriber_delivery_task_count,
                opts.subscription_batch_size,
                &runtime,
            )
        });
        Self {
            state: Mutex::new(ConnState::new(pool)),
            writer: tokio::sync::Mutex::new(None),
            flush_kick: Notify::new(),
            session_change: Notify::new(),
            stats: Statistics::default(),
            events,
            delivery_pool,
            tls,
            runtime,
            shutdown: CancellationToken::new(),
            opts,
        }
    }

    pub(crate) fn status(&self) -> ConnectionState {
        self.state.lock().status
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.status() == ConnectionState::Closed
    }

    /// Wake the flusher; it coalesces and writes shortly after
    pub(crate) fn kick_flusher(&self) {
        self.flush_kick.notify_one();
    }

    /// Encode a PUB/HPUB into the outbound buffer
    pub(crate) fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&Headers>,
        data: &[u8],
    ) -> Result<()> {
        if !is_valid_publish_subject(subject) {
            return Err(NatsError::BadSubject(subject.to_string()));
        }
        let reply = reply.filter(|r| !r.is_empty());
        if let Some(reply) = reply
            && !is_valid_publish_subject(reply)
        {
            return Err(NatsError::BadSubject(reply.to_string()));
        }
        let header_block = headers
            .filter(|h| !h.is_empty() || h.status().is_some())
            .map(Headers::to_bytes);
        let header_len = header_block.as_ref().map_or(0, Vec::len);
        let total = header_len + data.len();

        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            match st.status {
                ConnectionState::Closed => return Err(NatsError::ConnectionClosed),
                ConnectionState::DrainingPubs => return Err(NatsError::Draining),
                _ => {}
            }
            let max = st.info.max_payload;
            if max > 0 && total > max {
                return Err(NatsError::MaxPayload { size: total, max });
            }

            let line = match header_block {
                Some(_) => st.encoder.hpub_line(subject, reply, header_len, total),
                None => st.encoder.pub_line(subject, reply, total),
            };
            if st.status == ConnectionState::Reconnecting {
                let limit = self.opts.reconnect_buffer_size;
                let needed = st.outbound.len() + line.len() + total + CRLF.len();
                if limit >= 0 && needed as u64 > limit as u64 {
                    return Err(NatsError::ReconnectBufferExceeded);
                }
            }
            st.outbound.extend_from_slice(line);
            if let Some(block) = &header_block {
                st.outbound.extend_from_slice(block);
            }
            st.outbound.extend_from_slice(data);
            st.outbound.extend_from_slice(CRLF);
        }

        trace!("PUB {} ({} bytes)", subject, total);
        self.stats.record_out(total);
        self.kick_flusher();
        Ok(())
    }

    /// Register a subscription and start its delivery
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        queue: Option<&str>,
        handler: Option<MsgHandler>,
    ) -> Result<Arc<SubscriptionCore>> {
        let core = {
            let mut st = self.state.lock();
            self.register_subscription(&mut st, subject, queue, handler)?
        };
        self.start_delivery(&core);
        self.kick_flusher();
        Ok(core)
    }

    /// Insert a subscription and queue its SUB; the caller holds the state lock
    pub(crate) fn register_subscription(
        self: &Arc<Self>,
        st: &mut ConnState,
        subject: &str,
        queue: Option<&str>,
        handler: Option<MsgHandler>,
    ) -> Result<Arc<SubscriptionCore>> {
        let subject = Subject::new(subject)?;
        let queue = queue
            .filter(|q| !q.is_empty())
            .map(QueueGroup::new)
            .transpose()?;
        match st.status {
            ConnectionState::Closed => return Err(NatsError::ConnectionClosed),
            ConnectionState::DrainingSubs | ConnectionState::DrainingPubs => {
                return Err(NatsError::Draining);
            }
            _ => {}
        }

        st.next_sid += 1;
        let sid = st.next_sid;
        let mailbox = match handler {
            None => Mailbox::Sync(MsgQueue::new()),
            Some(handler) => match self.delivery_pool.as_ref().and_then(DeliveryPool::assign) {
                Some(worker) => Mailbox::Pooled { worker, handler },
                None => Mailbox::Async {
                    queue: MsgQueue::new(),
                    handler,
                },
            },
        };
        let core = Arc::new(SubscriptionCore::new(
            sid,
            subject.as_str().to_string(),
            queue.as_ref().map(|q| q.as_str().to_string()),
            Arc::downgrade(self),
            mailbox,
            (self.opts.pending_msg_limit, self.opts.pending_bytes_limit),
        ));
        st.subs.insert(sid, Arc::clone(&core));

        // While reconnecting, every registered subscription is replayed anyway
        if st.status != ConnectionState::Reconnecting {
            put_sub(&mut st.outbound, &core.subject, core.queue_group.as_deref(), sid);
        }
        debug!("Subscribed sid {} to {}", sid, core.subject);
        Ok(core)
    }

    /// Spawn the dedicated delivery task for an async subscription
    pub(crate) fn start_delivery(&self, core: &Arc<SubscriptionCore>) {
        if core.own_delivery().is_some() {
            self.runtime.spawn(delivery::run_subscription(
                Arc::clone(core),
                self.opts.subscription_batch_size,
            ));
        }
    }

    /// Queue `UNSUB <sid> [max]`
    pub(crate) fn send_unsub(&self, sid: u64, max: Option<u64>) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.status == ConnectionState::Closed {
                return Err(NatsError::ConnectionClosed);
            }
            if !st.subs.contains_key(&sid) {
                return Err(NatsError::BadSubscription);
            }
            put_unsub(&mut st.outbound, sid, max);
        }
        self.kick_flusher();
        Ok(())
    }

    /// User-initiated unsubscribe
    pub(crate) fn unsubscribe(&self, sid: u64) -> Result<()> {
        if self.is_closed() {
            return Err(NatsError::ConnectionClosed);
        }
        self.remove_subscription(sid, true)
    }

    /// Unregister a subscription and close its queue
    pub(crate) fn remove_subscription(&self, sid: u64, send_unsub: bool) -> Result<()> {
        let core = {
            let mut st = self.state.lock();
            let core = st.subs.remove(&sid).ok_or(NatsError::BadSubscription)?;
            if send_unsub && st.status != ConnectionState::Closed {
                put_unsub(&mut st.outbound, sid, None);
            }
            core
        };
        core.close();
        if send_unsub {
            self.kick_flusher();
        }
        debug!("Removed subscription {} on {}", sid, core.subject);
        Ok(())
    }

    /// Round-trip a PING and wait for its PONG
    pub(crate) async fn flush(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut st = self.state.lock();
            if st.status == ConnectionState::Closed {
                return Err(NatsError::ConnectionClosed);
            }
            st.queue_ping(Some(tx))
        };
        self.kick_flusher();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false) | Err(_)) => Err(if self.is_closed() {
                NatsError::ConnectionClosed
            } else {
                NatsError::Disconnected
            }),
            Err(_) => {
                // Keep the slot so later PONGs still pair with their PINGs
                let mut st = self.state.lock();
                if let Some(slot) = st.pongs.iter_mut().find(|slot| slot.id == id) {
                    slot.tx = None;
                }
                Err(NatsError::Timeout)
            }
        }
    }

    /// Mark closed and collect everything that must be released
    fn begin_close(&self, err: Option<NatsError>) -> Option<CloseWork> {
        let mut st = self.state.lock();
        if st.status == ConnectionState::Closed {
            return None;
        }
        let previous = st.status;
        st.status = ConnectionState::Closed;
        if let Some(err) = err {
            st.last_error = Some(err);
        }
        st.io_cancel.cancel();
        self.shutdown.cancel();
        self.session_change.notify_waiters();
        let pongs = st.pongs.drain(..).filter_map(|slot| slot.tx).collect();
        st.unflushed_pings = 0;
        let subs = st.subs.drain().map(|(_, core)| core).collect();
        let requests = st
            .resp_mux
            .take()
            .map(RespMux::into_waiters)
            .unwrap_or_default();
        Some(CloseWork {
            previous,
            pongs,
            subs,
            requests,
        })
    }

    fn finish_close(&self, work: CloseWork) {
        for tx in work.pongs {
            let _ = tx.send(false);
        }
        for tx in work.requests {
            let _ = tx.send(Err(NatsError::ConnectionClosed));
        }
        for core in work.subs {
            core.close();
        }
        if let Some(pool) = &self.delivery_pool {
            pool.close();
        }

        info!("Connection closed");
        if work.previous.is_connected() {
            self.events.dispatch(Event::Disconnected);
        }
        self.events.dispatch(Event::Closed);
        self.events.shutdown();
    }

    /// Close the connection, flushing what is buffered first
    ///
    /// Idempotent; later calls return immediately. The I/O tasks are
    /// cancelled before the writer is taken, and both the wait for the writer
    /// and the final flush are bounded by `CLOSE_FLUSH`.
    pub(crate) async fn close_with(&self, err: Option<NatsError>) {
        let Some(work) = self.begin_close(err) else {
            return;
        };
        match tokio::time::timeout(CLOSE_FLUSH, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(mut socket) = writer.take() {
                    let pending = self.state.lock().outbound.split().freeze();
                    let flushed = tokio::time::timeout(CLOSE_FLUSH, async {
                        if work.previous.is_connected() && !pending.is_empty() {
                            socket.write_all(&pending).await?;
                            socket.flush().await?;
                        }
                        socket.shutdown().await
                    })
                    .await;
                    if !matches!(flushed, Ok(Ok(()))) {
                        debug!("Final flush on close did not complete");
                    }
                }
            }
            Err(_) => debug!("Socket writer still busy, closing without a final flush"),
        }
        self.finish_close(work);
    }

    /// Close without touching the socket; for contexts with no runtime
    pub(crate) fn close_now(&self) {
        if let Some(work) = self.begin_close(None) {
            self.finish_close(work);
        }
    }
}
