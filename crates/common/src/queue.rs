//! Ordered, single-flight task queue.
//!
//! Every ordering guarantee in the bridge hangs off this primitive: outbound
//! socket writes, inbound stream reassembly, and per-user chat delivery each
//! run on their own `TaskQueue`. Items are consumed strictly in insertion
//! order and at most one execution is in flight per queue at any time.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use {anyhow::Result, async_trait::async_trait, tracing::warn};

/// The memoized outcome of the previous drain cycle.
#[derive(Debug, Clone)]
pub struct Cycle<P, R> {
    pub payload: P,
    pub result: R,
}

/// Front-of-queue view handed to [`QueueWorker::extract`].
///
/// A worker may consume zero or more items off the front; it never sees or
/// touches anything behind the head it has not popped yet.
#[derive(Debug)]
pub struct Backlog<T>(VecDeque<T>);

impl<T> Backlog<T> {
    fn new() -> Self {
        Self(VecDeque::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn peek(&self) -> Option<&T> {
        self.0.front()
    }

    pub fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }
}

/// A queue's domain logic: how to pull a payload off the backlog and how to
/// run it. Both steps may suspend; both steps may fail, and failure drops the
/// entire remaining backlog (no retry, no partial recovery).
#[async_trait]
pub trait QueueWorker: Send + Sync + 'static {
    type Item: Send + 'static;
    type Payload: Send + Sync + 'static;
    type Output: Send + Sync + 'static;

    /// Pull the next payload off the front of the backlog. May consume zero
    /// or more items. Called only when the backlog is non-empty.
    async fn extract(
        &self,
        backlog: &mut Backlog<Self::Item>,
        previous: Option<&Cycle<Self::Payload, Self::Output>>,
    ) -> Result<Self::Payload>;

    /// Run one extracted payload.
    async fn execute(
        &self,
        payload: &Self::Payload,
        previous: Option<&Cycle<Self::Payload, Self::Output>>,
    ) -> Result<Self::Output>;
}

struct Inner<W: QueueWorker> {
    backlog: Backlog<W::Item>,
    running: bool,
    previous: Option<Cycle<W::Payload, W::Output>>,
}

/// Ordered single-flight task runner.
///
/// `enqueue` may be called from any task; draining happens on one spawned
/// task at a time. The drain is an explicit loop, not self-rescheduling, so
/// long-lived queues never grow call depth.
pub struct TaskQueue<W: QueueWorker> {
    worker: Arc<W>,
    inner: Arc<Mutex<Inner<W>>>,
}

impl<W: QueueWorker> Clone for TaskQueue<W> {
    fn clone(&self) -> Self {
        Self {
            worker: Arc::clone(&self.worker),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: QueueWorker> TaskQueue<W> {
    pub fn new(worker: W) -> Self {
        Self {
            worker: Arc::new(worker),
            inner: Arc::new(Mutex::new(Inner {
                backlog: Backlog::new(),
                running: false,
                previous: None,
            })),
        }
    }

    /// Append items to the tail, preserving order, and start draining if the
    /// queue is idle.
    pub fn enqueue<I>(&self, items: I)
    where
        I: IntoIterator<Item = W::Item>,
    {
        let start = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.backlog.0.extend(items);
            if inner.running || inner.backlog.is_empty() {
                false
            } else {
                inner.running = true;
                true
            }
        };
        if start {
            let worker = Arc::clone(&self.worker);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(drain(worker, inner));
        }
    }
}

async fn drain<W: QueueWorker>(worker: Arc<W>, inner: Arc<Mutex<Inner<W>>>) {
    loop {
        // Take the backlog and previous outcome out so neither lock is held
        // across an await. Items enqueued while extract/execute run are
        // merged back behind whatever extract left unconsumed.
        let (mut backlog, previous) = {
            let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
            if guard.backlog.is_empty() {
                guard.running = false;
                return;
            }
            let backlog = std::mem::replace(&mut guard.backlog, Backlog::new());
            (backlog, guard.previous.take())
        };

        let payload = match worker.extract(&mut backlog, previous.as_ref()).await {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "task queue extract failed, dropping backlog");
                reset(&inner);
                return;
            },
        };

        requeue(&inner, backlog);

        match worker.execute(&payload, previous.as_ref()).await {
            Ok(result) => {
                let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                guard.previous = Some(Cycle { payload, result });
            },
            Err(error) => {
                warn!(%error, "task queue execute failed, dropping backlog");
                reset(&inner);
                return;
            },
        }
    }
}

/// Put extract's leftovers back in front of anything enqueued meanwhile.
fn requeue<W: QueueWorker>(inner: &Mutex<Inner<W>>, mut leftover: Backlog<W::Item>) {
    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
    leftover.0.extend(guard.backlog.0.drain(..));
    guard.backlog = leftover;
}

fn reset<W: QueueWorker>(inner: &Mutex<Inner<W>>) {
    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
    guard.backlog = Backlog::new();
    guard.running = false;
    guard.previous = None;
}
