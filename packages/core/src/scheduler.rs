//! A bounded, priority-ordered worker pool (spec §4.2).
//!
//! Two ways to run work:
//!
//! - [`Scheduler::spawn`] queues a future behind the bounded pool and returns
//!   immediately; used for view handler invocations, which may legitimately
//!   block for long periods (sleeping between UI pushes, waiting on input).
//! - [`Scheduler::run_inline`] runs a future on the caller's own task, with no
//!   queueing and no pool contention at all. Middleware dispatch uses this:
//!   spec §5 calls out that a synchronous, awaited middleware call from
//!   inside the dispatch path must not be able to deadlock against a pool
//!   saturated with long-lived view workers, and running inline on the
//!   dispatcher is exactly the mitigation spec §4.2/§5 suggest.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify, Semaphore};
use tokio::task::JoinSet;

/// Scheduling priority. Ordered so that `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("the scheduled item was cancelled before it ran")]
    Cancelled,

    #[error("the scheduled item panicked: {0}")]
    Panicked(String),
}

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Job {
    priority: Priority,
    seq: u64,
    run: BoxedJob,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, and among equal
        // priorities the earlier sequence number (FIFO) comes out first, so
        // we reverse the sequence comparison.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    queue: AsyncMutex<BinaryHeap<Job>>,
    notify: Notify,
    permits: Arc<Semaphore>,
    stopping: AtomicBool,
    seq: AtomicU64,
    in_flight: AsyncMutex<JoinSet<()>>,
}

/// A bounded worker pool sized for the expected count of *concurrently live
/// interactive views*, not requests per second (spec §4.2).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(max_workers: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: AsyncMutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            stopping: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            in_flight: AsyncMutex::new(JoinSet::new()),
        });

        let dispatcher = inner.clone();
        tokio::spawn(async move { Self::dispatch_loop(dispatcher).await });

        Self { inner }
    }

    async fn dispatch_loop(inner: Arc<Inner>) {
        loop {
            if inner.stopping.load(AtomicOrdering::Acquire) {
                return;
            }

            let job = {
                let mut queue = inner.queue.lock().await;
                queue.pop()
            };

            let Some(job) = job else {
                inner.notify.notified().await;
                continue;
            };

            let permits = inner.permits.clone();
            let Ok(permit) = permits.acquire_owned().await else {
                return;
            };

            let mut in_flight = inner.in_flight.lock().await;
            in_flight.spawn(async move {
                job.run.await;
                drop(permit);
            });
        }
    }

    /// Queue `fut` behind the bounded pool at `priority` and await its
    /// result. Exceptions (panics) never kill a worker: they're captured and
    /// surfaced as [`SchedulerError::Panicked`].
    pub async fn schedule<F, T>(&self, priority: Priority, fut: F) -> Result<T, SchedulerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        self.enqueue(priority, async move {
            let result = AssertUnwindSafe(fut).catch_unwind().await;
            let _ = tx.send(result.map_err(panic_message));
        });

        rx.await.map_err(|_| SchedulerError::Cancelled)?.map_err(SchedulerError::Panicked)
    }

    /// Queue `fut` behind the bounded pool and return immediately, without
    /// waiting for (or even caring about) its result. Used to start view
    /// handlers, which are expected to run — and potentially block — for the
    /// lifetime of the view.
    pub fn spawn<F>(&self, priority: Priority, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(priority, async move {
            let _ = AssertUnwindSafe(fut).catch_unwind().await;
        });
    }

    fn enqueue<F>(&self, priority: Priority, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.stopping.load(AtomicOrdering::Acquire) {
            return;
        }

        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let job = Job { priority, seq, run: Box::pin(fut) };
        let inner = self.inner.clone();

        tokio::spawn(async move {
            inner.queue.lock().await.push(job);
            inner.notify.notify_one();
        });
    }

    /// Run `fut` directly on the caller's task: no queueing, no pool permit,
    /// no contention with in-flight view workers. This is how middleware
    /// dispatch achieves spec §4.4's "synchronously awaited" semantics
    /// without the deadlock risk spec §5 calls out.
    pub async fn run_inline<F, T>(&self, priority: Priority, fut: F) -> Result<T, SchedulerError>
    where
        F: Future<Output = T>,
    {
        tracing::trace!(?priority, "running scheduled item inline on dispatcher");

        AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message).map_err(SchedulerError::Panicked)
    }

    /// Broadcast `ServerStop`: discard anything still queued and abort every
    /// in-flight job (spec §5, "Cancellation").
    pub async fn stop(&self) {
        self.inner.stopping.store(true, AtomicOrdering::Release);
        self.inner.queue.lock().await.clear();
        self.inner.notify.notify_waiters();
        self.inner.in_flight.lock().await.abort_all();
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
