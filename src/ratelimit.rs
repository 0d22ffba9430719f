use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Size of the unit in which rate-limited transfers are metered.
pub const CHUNK_LENGTH: usize = 2 * 1024;

/// Adaptive controller converting a desired maximum rate and the measured actual rate
/// into a budget of chunks that I/O operations can spend.
///
/// The budget is replenished by [`RateLimiter::update`], typically once per second,
/// and spent by any number of concurrent transfers via [`RateLimiter::try_acquire`].
#[derive(Debug, Default)]
pub struct RateLimiter {
    chunks: AtomicUsize,
    saved_error: AtomicI64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Current number of chunks that can be spent.
    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::Acquire)
    }

    /// Whether at least one chunk can be spent.
    pub fn has_budget(&self) -> bool {
        self.chunks() > 0
    }

    /// Claim one chunk if any is left.
    pub fn try_acquire(&self) -> bool {
        self.chunks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |chunks| chunks.checked_sub(1))
            .is_ok()
    }

    /// Spend one chunk. Never drives the budget below zero.
    pub fn decrement(&self) {
        let _ = self
            .chunks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |chunks| chunks.checked_sub(1));
    }

    /// Add `delta` chunks (or remove when negative), flooring at zero.
    pub fn adjust(&self, delta: isize) {
        let _ = self.chunks.fetch_update(Ordering::AcqRel, Ordering::Acquire, |chunks| {
            Some(chunks.saturating_add_signed(delta))
        });
    }

    /// Recompute the budget given the desired `max_rate` and the measured `actual_rate`
    /// (both in bytes per second). A `max_rate` of 0 blocks all throttled I/O.
    pub fn update(&self, max_rate: usize, actual_rate: usize) {
        if max_rate == 0 {
            self.chunks.store(0, Ordering::Release);
            return;
        }

        // 5% overshoot gives more accurate limiting of peer traffic
        let adjusted_max = (max_rate as f64 * 1.05) as i64;
        let error = adjusted_max - actual_rate as i64;
        let saved_error = self.saved_error.swap(error, Ordering::AcqRel);
        let delta = (0.4 * error as f64 + 0.6 * saved_error as f64) as i64;

        let increase = (adjusted_max + delta) / CHUNK_LENGTH as i64;
        let candidate = self.chunks() as i64 + increase;

        let min_chunks = (max_rate as f64 * 1.2 / CHUNK_LENGTH as f64) as i64;
        let max_chunks = (max_rate as f64 * 2.0 / CHUNK_LENGTH as f64) as i64;
        let new_chunks = candidate.clamp(min_chunks, max_chunks);

        log::trace!(
            "Rate limiter: max={max_rate} actual={actual_rate} error={error} chunks={new_chunks}"
        );
        self.chunks.store(new_chunks as usize, Ordering::Release);
    }
}
