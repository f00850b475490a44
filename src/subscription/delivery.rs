//! Delivery tasks for asynchronous subscriptions
//!
//! By default each async subscription gets its own task draining its queue
//! in batches. With `subscriber_delivery_task_count > 0` subscriptions are
//! instead assigned round-robin to a fixed set of shared workers; messages of
//! one subscription always go through the same worker, so per-subscription
//! order is kept.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tracing::{debug, trace};

use super::state::SubscriptionCore;
use crate::message::Msg;
use crate::queue::MsgQueue;

/// Drain a subscription's own queue until it closes or the handler ends it
pub(crate) async fn run_subscription(core: Arc<SubscriptionCore>, batch: usize) {
    let Some(queue) = core.own_delivery() else {
        return;
    };
    let mut msgs = Vec::with_capacity(batch);
    loop {
        msgs.clear();
        match queue.get_batch(None, batch, &mut msgs).await {
            Ok(Some(n)) => trace!("Delivering {} message(s) on sid {}", n, core.sid),
            Ok(None) | Err(_) => break,
        }
        for msg in msgs.drain(..) {
            if !core.deliver(msg) {
                debug!("Delivery task for subscription {} finished", core.sid);
                return;
            }
        }
    }
    debug!("Delivery task for subscription {} stopped", core.sid);
}

/// Shared delivery loop serving many subscriptions
pub(crate) struct DeliveryWorker {
    queue: MsgQueue<(Arc<SubscriptionCore>, Msg)>,
}

impl DeliveryWorker {
    pub(crate) fn add(&self, core: Arc<SubscriptionCore>, msg: Msg) -> bool {
        self.queue.add((core, msg))
    }

    async fn run(self: Arc<Self>, index: usize, batch: usize) {
        let mut items = Vec::with_capacity(batch);
        loop {
            items.clear();
            match self.queue.get_batch(None, batch, &mut items).await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
            for (core, msg) in items.drain(..) {
                // Returns false for closed subscriptions; their leftovers are skipped
                core.deliver(msg);
            }
        }
        debug!("Delivery worker {} stopped", index);
    }
}

/// Fixed set of shared delivery workers
pub(crate) struct DeliveryPool {
    workers: Vec<Arc<DeliveryWorker>>,
    /// Next worker in the round-robin rotation
    next: AtomicUsize,
}

impl DeliveryPool {
    /// Spawn `count` workers on `runtime`
    pub(crate) fn start(count: usize, batch: usize, runtime: &Handle) -> Self {
        let workers: Vec<_> = (0..count)
            .map(|index| {
                let worker = Arc::new(DeliveryWorker {
                    queue: MsgQueue::new(),
                });
                runtime.spawn(Arc::clone(&worker).run(index, batch));
                worker
            })
            .collect();
        debug!("Started {} shared delivery worker(s)", workers.len());
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    /// Pick the worker for a new subscription
    pub(crate) fn assign(&self) -> Option<Arc<DeliveryWorker>> {
        if self.workers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Some(Arc::clone(&self.workers[index]))
    }

    pub(crate) fn close(&self) {
        for worker in &self.workers {
            worker.queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::state::{HandlerOutcome, Mailbox, MsgHandler};
    use std::sync::Weak;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn counting_handler(counter: Arc<AtomicU64>) -> MsgHandler {
        Arc::new(move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Continue
        })
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let pool = DeliveryPool::start(3, 8, &Handle::current());
        let picks: Vec<_> = (0..6).map(|_| pool.assign().unwrap()).collect();
        assert!(Arc::ptr_eq(&picks[0], &picks[3]));
        assert!(Arc::ptr_eq(&picks[1], &picks[4]));
        assert!(!Arc::ptr_eq(&picks[0], &picks[1]));
        pool.close();
    }

    #[tokio::test]
    async fn test_empty_pool_assigns_nothing() {
        let pool = DeliveryPool::start(0, 8, &Handle::current());
        assert!(pool.assign().is_none());
    }

    #[tokio::test]
    async fn test_own_task_survives_handler_panic() {
        let counter = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&counter);
        let handler: MsgHandler = Arc::new(move |msg: Msg| {
            seen.fetch_add(1, Ordering::SeqCst);
            if &msg.data[..] == b"boom" {
                panic!("handler failure");
            }
            HandlerOutcome::Continue
        });
        let core = Arc::new(SubscriptionCore::new(
            7,
            "foo".into(),
            None,
            Weak::new(),
            Mailbox::Async {
                queue: MsgQueue::new(),
                handler,
            },
            (-1, -1),
        ));
        let task = tokio::spawn(run_subscription(Arc::clone(&core), 4));

        for data in [&b"a"[..], b"boom", b"c"] {
            core.enqueue(Msg::new("foo", None, data));
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while core.delivered() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(core.pending(), (0, 0));

        core.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pooled_delivery() {
        let pool = DeliveryPool::start(2, 4, &Handle::current());
        let counter = Arc::new(AtomicU64::new(0));
        let core = Arc::new(SubscriptionCore::new(
            1,
            "bar".into(),
            None,
            Weak::new(),
            Mailbox::Pooled {
                worker: pool.assign().unwrap(),
                handler: counting_handler(Arc::clone(&counter)),
            },
            (-1, -1),
        ));
        for _ in 0..10 {
            core.enqueue(Msg::new("bar", None, &b"x"[..]));
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(core.delivered(), 10);
        pool.close();
    }
}
