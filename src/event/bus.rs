//! In-process event bus
//!
//! Dispatch never takes a lock: both subscriber lists live behind
//! `ArcSwap` and registration swaps in a new list under a small mutex
//! (copy-on-write). Blocking subscribers run inline on the publishing
//! task and may veto; async subscribers get a clone of the event
//! through a bounded channel. Overflow drops the event and bumps a
//! counter; the producer never waits.
//!
//! A panicking blocking handler is caught and logged with its
//! subscriber ID; the subscription stays registered.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, warn};

use super::Event;

/// Queue depth for each async subscriber.
pub const ASYNC_QUEUE_CAPACITY: usize = 256;

/// A veto returned by a blocking subscriber. The connection is turned
/// into a disconnect carrying `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veto {
    pub message: String,
}

impl Veto {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

type BlockingHandler = Box<dyn Fn(&Event) -> Result<(), Veto> + Send + Sync>;

struct BlockingSubscriber {
    id: String,
    handler: BlockingHandler,
}

struct AsyncSubscriber {
    id: String,
    tx: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

/// The shared event bus. Cheap to clone; all clones publish to and
/// subscribe on the same subscriber lists.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    blocking: ArcSwap<Vec<Arc<BlockingSubscriber>>>,
    async_subs: ArcSwap<Vec<Arc<AsyncSubscriber>>>,
    /// Serialises copy-on-write updates of the subscriber lists.
    register_mu: Mutex<()>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                blocking: ArcSwap::from_pointee(Vec::new()),
                async_subs: ArcSwap::from_pointee(Vec::new()),
                register_mu: Mutex::new(()),
            }),
        }
    }

    /// Register a blocking subscriber. The handler runs inline on every
    /// publishing task; keep it fast. Returning `Err(Veto)` from a
    /// `PreConnConnecting` event aborts that connection.
    pub fn subscribe_blocking<F>(&self, id: impl Into<String>, handler: F)
    where
        F: Fn(&Event) -> Result<(), Veto> + Send + Sync + 'static,
    {
        let sub = Arc::new(BlockingSubscriber {
            id: id.into(),
            handler: Box::new(handler),
        });
        let _guard = self.inner.register_mu.lock();
        let mut list = (**self.inner.blocking.load()).clone();
        list.push(sub);
        self.inner.blocking.store(Arc::new(list));
    }

    /// Register an async subscriber and return its receiving end.
    /// Events are delivered best-effort: if the subscriber falls
    /// [`ASYNC_QUEUE_CAPACITY`] events behind, further events are
    /// dropped and counted.
    pub fn subscribe_async(&self, id: impl Into<String>) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(ASYNC_QUEUE_CAPACITY);
        let sub = Arc::new(AsyncSubscriber {
            id: id.into(),
            tx,
            dropped: AtomicU64::new(0),
        });
        let _guard = self.inner.register_mu.lock();
        let mut list = (**self.inner.async_subs.load()).clone();
        list.push(sub);
        self.inner.async_subs.store(Arc::new(list));
        rx
    }

    /// Remove all subscriptions registered under `id`.
    pub fn unsubscribe(&self, id: &str) {
        let _guard = self.inner.register_mu.lock();
        let blocking: Vec<_> = self
            .inner
            .blocking
            .load()
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        self.inner.blocking.store(Arc::new(blocking));
        let async_subs: Vec<_> = self
            .inner
            .async_subs
            .load()
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        self.inner.async_subs.store(Arc::new(async_subs));
    }

    /// Publish an event.
    ///
    /// Async subscribers receive a clone without blocking; blocking
    /// subscribers then run inline. The first veto short-circuits and
    /// is returned to the publisher.
    ///
    /// # Errors
    ///
    /// Returns the first [`Veto`] raised by a blocking subscriber.
    pub fn publish(&self, event: &Event) -> Result<(), Veto> {
        for sub in self.inner.async_subs.load().iter() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % 100 == 1 {
                        warn!(
                            subscriber = %sub.id,
                            dropped,
                            "async subscriber queue full, dropping events"
                        );
                    }
                }
                // Receiver gone; the subscription is dead weight but
                // harmless until the owner unsubscribes.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        for sub in self.inner.blocking.load().iter() {
            match catch_unwind(AssertUnwindSafe(|| (sub.handler)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(veto)) => return Err(veto),
                Err(_) => {
                    error!(
                        subscriber = %sub.id,
                        topic = event.topic(),
                        "blocking subscriber panicked, subscription retained"
                    );
                }
            }
        }
        Ok(())
    }

    /// Events dropped so far for the async subscriber with `id`.
    #[must_use]
    pub fn dropped_events(&self, id: &str) -> u64 {
        self.inner
            .async_subs
            .load()
            .iter()
            .filter(|s| s.id == id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
