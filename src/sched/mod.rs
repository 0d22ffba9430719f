//! All state shared between peer sessions is mutated from units of work submitted to a
//! [`Scheduler`], which replaces locking. Units are executed by a small pool of workers in
//! priority order (High, Normal, Low; FIFO within the same priority).

mod queue;


use derive_more::Display;
use queue::{Job, PriorityQueue};
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tokio::{runtime, select, task, time};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("task panicked")]
    Panicked,
    #[error("task cancelled")]
    Cancelled,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::ShuttingDown | Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Panicked => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Max number of units of work executed concurrently.
    pub workers: usize,
    /// Max number of queued units a worker executes before yielding.
    pub batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            batch: 4,
        }
    }
}

/// Completes when the submitted unit of work has finished.
#[must_use = "the handle is the only way to observe the result"]
pub struct TaskHandle<R>(oneshot::Receiver<Result<R, Error>>);

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Cancelled)))
    }
}

struct Shared {
    queue: Mutex<PriorityQueue>,
    available: Notify,
    closing: AtomicBool,
    stop_signal: CancellationToken,
    tracker: TaskTracker,
    runtime: runtime::Handle,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, PriorityQueue> {
        // jobs never run under the lock, so poisoning can't leave the queue inconsistent
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, priority: Priority, job: Job) -> Result<(), Error> {
        {
            let mut queue = self.lock_queue();
            if self.closing.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }
            queue.push(priority, job);
        }
        self.available.notify_one();
        Ok(())
    }

    fn enqueue_task<F, R>(&self, priority: Priority, action: F) -> Result<TaskHandle<R>, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_sender, result_receiver) = oneshot::channel();
        let job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(action)).map_err(|_| {
                log::error!("Scheduled task panicked");
                Error::Panicked
            });
            let _ = result_sender.send(result);
        });
        self.enqueue(priority, job)?;
        Ok(TaskHandle(result_receiver))
    }

    fn pop(&self) -> Option<Job> {
        self.lock_queue().pop()
    }
}

async fn run_worker(shared: Arc<Shared>, id: usize, batch: usize) {
    log::debug!("Scheduler worker {id} started");
    loop {
        let mut executed = 0;
        while executed < batch {
            let Some(job) = shared.pop() else {
                break;
            };
            job();
            executed += 1;
        }
        if executed == batch {
            task::yield_now().await;
            continue;
        }
        if shared.stop_signal.is_cancelled() && shared.lock_queue().is_empty() {
            break;
        }
        select! {
            _ = shared.available.notified() => (),
            _ = shared.stop_signal.cancelled() => (),
        }
    }
    log::debug!("Scheduler worker {id} stopped");
}

/// Cheaply cloneable handle to a pool of workers executing submitted units of work.
/// Workers are stopped by [`Scheduler::shutdown`] or when the last handle is dropped.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    _stop_on_drop: Arc<DropGuard>,
}

impl Scheduler {
    /// Start the workers on `runtime`.
    pub fn spawn(config: Config, runtime: runtime::Handle) -> Self {
        let stop_signal = CancellationToken::new();
        let shared = Arc::new(Shared {
            queue: Default::default(),
            available: Notify::new(),
            closing: AtomicBool::new(false),
            stop_signal: stop_signal.clone(),
            tracker: TaskTracker::new(),
            runtime,
        });
        let batch = config.batch.max(1);
        for id in 0..config.workers.max(1) {
            shared.tracker.spawn_on(run_worker(shared.clone(), id, batch), &shared.runtime);
        }
        Self {
            shared,
            _stop_on_drop: Arc::new(stop_signal.drop_guard()),
        }
    }

    /// Queue `action` for execution. Never blocks.
    pub fn submit<F, R>(&self, priority: Priority, action: F) -> Result<TaskHandle<R>, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.shared.enqueue_task(priority, action)
    }

    /// Execute `predicate` every `period` until it returns `false` or the scheduler shuts down.
    /// Each iteration is a separate unit of work, and the next one is never queued before
    /// the previous one has finished.
    pub fn submit_recurring<F>(
        &self,
        period: Duration,
        priority: Priority,
        mut predicate: F,
    ) -> Result<(), Error>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let shared = self.shared.clone();
        let recurring_loop = async move {
            loop {
                let iteration = shared.enqueue_task(priority, move || {
                    let keep_going = predicate();
                    (predicate, keep_going)
                });
                let Ok(iteration) = iteration else {
                    break;
                };
                match iteration.await {
                    Ok((returned, true)) => predicate = returned,
                    Ok((_, false)) => break,
                    Err(e) => {
                        log::error!("Recurring task stopped: {e}");
                        break;
                    }
                }
                select! {
                    biased;
                    _ = shared.stop_signal.cancelled() => break,
                    _ = time::sleep(period) => (),
                }
            }
        };
        self.shared.tracker.spawn_on(recurring_loop, &self.shared.runtime);
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Number of units of work waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock_queue().len()
    }

    /// Reject new work, let recurring loops exit and wait until the workers
    /// have drained the queue.
    pub async fn shutdown(&self) {
        {
            let _queue = self.shared.lock_queue();
            self.shared.closing.store(true, Ordering::Release);
        }
        self.shared.stop_signal.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        log::debug!("Scheduler stopped");
    }
}
