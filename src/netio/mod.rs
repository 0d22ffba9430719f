//! Transfers of complete buffers over a [`Connection`], split into rate-limited chunks.
//!
//! A transfer that runs out of limiter budget is parked on a per-direction queue. A recurring
//! unit of work on the [`Scheduler`] re-examines the queues every tick and resumes parked
//! transfers in arrival order, handing each one chunk of its limiter's budget until that
//! limiter runs dry.

mod frame;


pub use frame::{FrameError, MAX_MESSAGE_LENGTH};

use crate::conn::{Connection, Link};
use crate::monitor::{Direction, MonitorPair, TransferKind};
use crate::ratelimit::{CHUNK_LENGTH, RateLimiter};
use crate::sched::{self, Priority, Scheduler};
use futures_channel::oneshot;
use local_async_utils::prelude::*;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time;

#[derive(Debug, Error)]
pub enum Error {
    #[error("peer stopped transferring with {remaining} bytes remaining")]
    ZeroTransfer { remaining: usize },
    #[error("{0} already in progress")]
    Busy(Direction),
    #[error("connect timed out")]
    Timeout,
    #[error("network I/O stopped")]
    Stopped,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type TransportError = Error;

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::ZeroTransfer { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            Error::Busy(_) => io::Error::new(io::ErrorKind::ResourceBusy, e),
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, e),
            Error::Stopped => io::Error::new(io::ErrorKind::Interrupted, e),
            Error::Io(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Block size of the piece-transfer layer. Transfers larger than half of it count as data.
    pub block_size: usize,
    /// How often parked transfers are re-examined.
    pub tick_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 16 * 1024,
            tick_period: millisec!(50),
        }
    }
}

/// Optional throttling and accounting of a single transfer.
#[derive(Clone, Copy, Default)]
pub struct Shaping<'a> {
    pub limiter: Option<&'a Arc<RateLimiter>>,
    pub monitors: Option<&'a MonitorPair>,
}

impl<'a> Shaping<'a> {
    pub fn unlimited() -> Self {
        Default::default()
    }

    pub fn with_limiter(mut self, limiter: &'a Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_monitors(mut self, monitors: &'a MonitorPair) -> Self {
        self.monitors = Some(monitors);
        self
    }
}

struct Parked {
    limiter: Arc<RateLimiter>,
    spends: bool,
    resume: oneshot::Sender<()>,
}

/// Take one chunk from `limiter` on behalf of a transfer, or only check that budget is left
/// if the transfer doesn't spend any.
fn claim(limiter: &RateLimiter, spends: bool) -> bool {
    if spends {
        limiter.try_acquire()
    } else {
        limiter.has_budget()
    }
}

#[derive(Default)]
struct PendingQueue(Mutex<VecDeque<Parked>>);

impl PendingQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Parked>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `Ok(None)` if a chunk can be transferred right away, otherwise the receiver that
    /// completes once the tick has resumed the transfer. By the time the transfer may proceed,
    /// its chunk has been claimed from `limiter` if `spends` is set.
    fn admit(
        &self,
        limiter: &Arc<RateLimiter>,
        spends: bool,
        stopped: &AtomicBool,
    ) -> Result<Option<oneshot::Receiver<()>>, Error> {
        let mut queue = self.lock();
        let overtakes = queue.iter().any(|parked| Arc::ptr_eq(&parked.limiter, limiter));
        if !overtakes && claim(limiter, spends) {
            return Ok(None);
        }
        if stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let (resume, resumed) = oneshot::channel();
        queue.push_back(Parked {
            limiter: limiter.clone(),
            spends,
            resume,
        });
        Ok(Some(resumed))
    }

    fn resume_ready(&self) {
        let mut queue = self.lock();
        let mut still_parked = VecDeque::with_capacity(queue.len());
        // limiters that ran dry during this pass, later entries on them keep their place
        let mut exhausted: Vec<Arc<RateLimiter>> = Vec::new();
        for parked in queue.drain(..) {
            if parked.resume.is_canceled() {
                continue;
            }
            let blocked = exhausted.iter().any(|limiter| Arc::ptr_eq(limiter, &parked.limiter));
            if !blocked && claim(&parked.limiter, parked.spends) {
                if parked.resume.send(()).is_err() && parked.spends {
                    parked.limiter.adjust(1);
                }
            } else {
                if !blocked {
                    exhausted.push(parked.limiter.clone());
                }
                still_parked.push_back(parked);
            }
        }
        *queue = still_parked;
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

struct Inner {
    config: Config,
    pending_sends: PendingQueue,
    pending_receives: PendingQueue,
    half_opens: AtomicUsize,
    stopped: AtomicBool,
}

impl Inner {
    fn pending(&self, direction: Direction) -> &PendingQueue {
        match direction {
            Direction::Send => &self.pending_sends,
            Direction::Receive => &self.pending_receives,
        }
    }

    fn tick(&self) {
        self.pending_sends.resume_ready();
        self.pending_receives.resume_ready();
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.pending_sends.clear();
        self.pending_receives.clear();
    }

    /// Wait until the next I/O call is allowed and return its max length.
    async fn next_chunk(
        &self,
        direction: Direction,
        limiter: Option<&Arc<RateLimiter>>,
        remaining: usize,
    ) -> Result<usize, Error> {
        let Some(limiter) = limiter else {
            return Ok(remaining);
        };
        // small transfers wait for budget but don't spend it
        let spends = remaining > CHUNK_LENGTH / 2;
        if let Some(resumed) = self.pending(direction).admit(limiter, spends, &self.stopped)? {
            resumed.await.map_err(|_| Error::Stopped)?;
        }
        Ok(remaining.min(CHUNK_LENGTH))
    }

    fn account(
        &self,
        direction: Direction,
        count: usize,
        remaining: usize,
        total: usize,
        shaping: &Shaping<'_>,
    ) -> Result<(), Error> {
        if count == 0 {
            return Err(Error::ZeroTransfer { remaining });
        }
        if let Some(monitors) = shaping.monitors {
            let kind = if total > self.config.block_size / 2 {
                TransferKind::Data
            } else {
                TransferKind::Protocol
            };
            monitors.record(direction, count, kind);
        }
        Ok(())
    }
}

/// Stops the multiplexer when the recurring tick is dropped, e.g. on scheduler shutdown,
/// so that parked transfers fail instead of waiting forever.
struct TickGuard(Weak<Inner>);

impl TickGuard {
    fn inner(&self) -> Option<Arc<Inner>> {
        self.0.upgrade()
    }
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner() {
            inner.stop();
        }
    }
}

struct HalfOpen<'a>(&'a AtomicUsize);

impl<'a> HalfOpen<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for HalfOpen<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Network I/O multiplexer. Owns the queues of transfers waiting for limiter budget.
pub struct NetworkIo {
    inner: Arc<Inner>,
}

impl NetworkIo {
    /// Register the recurring tick on `scheduler`. The tick stops when the multiplexer is dropped.
    pub fn new(scheduler: &Scheduler, config: Config) -> Result<Self, sched::Error> {
        let tick_period = config.tick_period;
        let inner = Arc::new(Inner {
            config,
            pending_sends: Default::default(),
            pending_receives: Default::default(),
            half_opens: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        let guard = TickGuard(Arc::downgrade(&inner));
        scheduler.submit_recurring(tick_period, Priority::Normal, move || match guard.inner() {
            Some(inner) => {
                inner.tick();
                true
            }
            None => false,
        })?;
        Ok(Self { inner })
    }

    /// Send all of `buf`, returns the number of bytes sent.
    pub async fn send<C: Connection>(
        &self,
        link: &Link<C>,
        buf: &[u8],
        shaping: Shaping<'_>,
    ) -> Result<usize, Error> {
        let _in_flight = link.begin(Direction::Send).ok_or(Error::Busy(Direction::Send))?;
        let connection = link.connection();
        let total = buf.len();
        let mut transferred = 0;
        while transferred < total {
            let remaining = total - transferred;
            let len = self.inner.next_chunk(Direction::Send, shaping.limiter, remaining).await?;
            let count = connection
                .send(&buf[transferred..transferred + len])
                .await
                .inspect_err(|e| log::debug!("{} <= send failed: {e}", connection.uri()))?;
            self.inner.account(Direction::Send, count, remaining, total, &shaping)?;
            transferred += count;
        }
        Ok(transferred)
    }

    /// Fill all of `buf`, returns the number of bytes received.
    pub async fn receive<C: Connection>(
        &self,
        link: &Link<C>,
        buf: &mut [u8],
        shaping: Shaping<'_>,
    ) -> Result<usize, Error> {
        let _in_flight = link.begin(Direction::Receive).ok_or(Error::Busy(Direction::Receive))?;
        let connection = link.connection();
        let total = buf.len();
        let mut transferred = 0;
        while transferred < total {
            let remaining = total - transferred;
            let len = self.inner.next_chunk(Direction::Receive, shaping.limiter, remaining).await?;
            let count = connection
                .receive(&mut buf[transferred..transferred + len])
                .await
                .inspect_err(|e| log::debug!("{} => receive failed: {e}", connection.uri()))?;
            self.inner.account(Direction::Receive, count, remaining, total, &shaping)?;
            transferred += count;
        }
        Ok(transferred)
    }

    /// Connect within `deadline`. The connection is closed if the attempt fails or times out.
    pub async fn connect<C: Connection>(
        &self,
        link: &Link<C>,
        deadline: Duration,
    ) -> Result<(), Error> {
        let _half_open = HalfOpen::new(&self.inner.half_opens);
        let connection = link.connection();
        match time::timeout(deadline, connection.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                log::debug!("{} => connect failed: {e}", connection.uri());
                connection.close();
                Err(e.into())
            }
            Err(_) => {
                log::debug!("{} => connect timed out", connection.uri());
                connection.close();
                Err(Error::Timeout)
            }
        }
    }

    /// Number of connect attempts in progress.
    pub fn half_opens(&self) -> usize {
        self.inner.half_opens.load(Ordering::Relaxed)
    }

    /// Number of transfers waiting for limiter budget.
    pub fn pending(&self) -> usize {
        self.inner.pending_sends.len() + self.inner.pending_receives.len()
    }

    pub fn block_size(&self) -> usize {
        self.inner.config.block_size
    }
}
