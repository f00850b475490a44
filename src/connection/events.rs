//! Connection events and the callback scheduler
//!
//! User callbacks never run on the read, flush, or ping tasks. Events are
//! queued to a single scheduler task that invokes the callback in order and
//! survives callback panics.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::config::EventCallback;
use crate::constants::limits::{EVENT_BATCH, EVENT_QUEUE};
use crate::error::NatsError;
use crate::queue::MsgQueue;

/// Lifecycle and asynchronous error notifications
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// The socket to the current server was lost
    Disconnected,
    /// A reconnect attempt succeeded and subscriptions were replayed
    Reconnected,
    /// The connection is closed for good
    Closed,
    /// INFO advertised new servers; carries the discovered URLs
    ServersDiscovered(Vec<String>),
    /// The server announced it is shutting down
    LameDuckMode,
    /// A background error that did not end the connection
    AsyncError(NatsError),
}

enum Dispatch {
    Event(Event),
    Shutdown,
}

/// Feeds the callback scheduler; a no-op without a callback
pub(crate) struct EventDispatcher {
    queue: Option<Arc<MsgQueue<Dispatch>>>,
}

impl EventDispatcher {
    /// Spawn the scheduler task if a callback is configured
    pub(crate) fn start(callback: Option<EventCallback>, runtime: &Handle) -> Self {
        let Some(callback) = callback else {
            return Self { queue: None };
        };
        let queue = Arc::new(MsgQueue::new());
        runtime.spawn(run_scheduler(Arc::clone(&queue), callback));
        Self { queue: Some(queue) }
    }

    pub(crate) fn dispatch(&self, event: Event) {
        if let Some(queue) = &self.queue {
            trace!("Queueing event {:?}", event);
            queue.add(Dispatch::Event(event));
        }
    }

    /// Queue an async error unless the scheduler is badly backed up
    pub(crate) fn dispatch_error(&self, err: NatsError) {
        if let Some(queue) = &self.queue
            && queue
                .try_add(Dispatch::Event(Event::AsyncError(err)), EVENT_QUEUE)
                .is_err()
        {
            debug!("Event queue full, dropping async error");
        }
    }

    /// Let the scheduler finish queued events and exit
    pub(crate) fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            queue.add(Dispatch::Shutdown);
        }
    }
}

async fn run_scheduler(queue: Arc<MsgQueue<Dispatch>>, callback: EventCallback) {
    let mut batch = Vec::with_capacity(EVENT_BATCH);
    loop {
        batch.clear();
        match queue.get_batch(None, EVENT_BATCH, &mut batch).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return,
        }
        for item in batch.drain(..) {
            match item {
                Dispatch::Event(event) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                        warn!("Event callback panicked");
                    }
                }
                Dispatch::Shutdown => {
                    debug!("Event scheduler stopped");
                    queue.close();
                    return;
                }
            }
        }
    }
}
