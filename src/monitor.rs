use derive_more::Display;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;

/// Classification of transferred bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransferKind {
    /// Piece payload.
    Data,
    /// Protocol overhead (handshakes, control messages, keep-alives).
    Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Direction {
    #[display("send")]
    Send,
    #[display("receive")]
    Receive,
}

#[derive(Default)]
struct Counters {
    data: AtomicU64,
    protocol: AtomicU64,
}

impl Counters {
    fn add(&self, bytes: usize, kind: TransferKind) {
        let counter = match kind {
            TransferKind::Data => &self.data,
            TransferKind::Protocol => &self.protocol,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn total(&self) -> u64 {
        self.data.load(Ordering::Relaxed) + self.protocol.load(Ordering::Relaxed)
    }
}

struct SpeedState {
    last_tick: Instant,
    last_sent: u64,
    last_received: u64,
    upload_samples: VecDeque<usize>,
    download_samples: VecDeque<usize>,
}

/// Byte counters for one peer or one torrent, updated concurrently by any number of transfers.
/// Speeds are only recomputed by [`TransferMonitor::tick`].
pub struct TransferMonitor {
    sent: Counters,
    received: Counters,
    upload_speed: AtomicUsize,
    download_speed: AtomicUsize,
    speed_state: Mutex<SpeedState>,
}

impl TransferMonitor {
    /// Number of ticks the speed estimate is averaged over.
    const SAMPLES: usize = 12;

    pub fn new() -> Self {
        Self {
            sent: Default::default(),
            received: Default::default(),
            upload_speed: AtomicUsize::new(0),
            download_speed: AtomicUsize::new(0),
            speed_state: Mutex::new(SpeedState {
                last_tick: Instant::now(),
                last_sent: 0,
                last_received: 0,
                upload_samples: VecDeque::with_capacity(Self::SAMPLES),
                download_samples: VecDeque::with_capacity(Self::SAMPLES),
            }),
        }
    }

    pub fn bytes_sent(&self, bytes: usize, kind: TransferKind) {
        self.sent.add(bytes, kind);
    }

    pub fn bytes_received(&self, bytes: usize, kind: TransferKind) {
        self.received.add(bytes, kind);
    }

    pub fn record(&self, direction: Direction, bytes: usize, kind: TransferKind) {
        match direction {
            Direction::Send => self.bytes_sent(bytes, kind),
            Direction::Receive => self.bytes_received(bytes, kind),
        }
    }

    pub fn data_sent(&self) -> u64 {
        self.sent.data.load(Ordering::Relaxed)
    }

    pub fn protocol_sent(&self) -> u64 {
        self.sent.protocol.load(Ordering::Relaxed)
    }

    pub fn data_received(&self) -> u64 {
        self.received.data.load(Ordering::Relaxed)
    }

    pub fn protocol_received(&self) -> u64 {
        self.received.protocol.load(Ordering::Relaxed)
    }

    /// Average upload speed in bytes per second as of the last tick.
    pub fn upload_speed(&self) -> usize {
        self.upload_speed.load(Ordering::Relaxed)
    }

    /// Average download speed in bytes per second as of the last tick.
    pub fn download_speed(&self) -> usize {
        self.download_speed.load(Ordering::Relaxed)
    }

    /// Sample the counters and recompute the speeds.
    pub fn tick(&self) {
        let mut guard = self.speed_state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let now = Instant::now();
        let elapsed_sec = (now - state.last_tick).as_secs_f64();
        if elapsed_sec <= 0.0 {
            return;
        }
        let sent = self.sent.total();
        let received = self.received.total();

        fn push_sample(samples: &mut VecDeque<usize>, bytes: u64, elapsed_sec: f64) -> usize {
            if samples.len() == TransferMonitor::SAMPLES {
                samples.pop_front();
            }
            samples.push_back((bytes as f64 / elapsed_sec) as usize);
            samples.iter().sum::<usize>() / samples.len()
        }

        let upload = push_sample(&mut state.upload_samples, sent - state.last_sent, elapsed_sec);
        let download =
            push_sample(&mut state.download_samples, received - state.last_received, elapsed_sec);

        state.last_tick = now;
        state.last_sent = sent;
        state.last_received = received;
        self.upload_speed.store(upload, Ordering::Relaxed);
        self.download_speed.store(download, Ordering::Relaxed);
    }
}

impl Default for TransferMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Monitors updated by every chunk of a transfer: one for the peer, one for the torrent or engine.
#[derive(Clone)]
pub struct MonitorPair {
    pub peer: Arc<TransferMonitor>,
    pub manager: Arc<TransferMonitor>,
}

impl MonitorPair {
    pub fn record(&self, direction: Direction, bytes: usize, kind: TransferKind) {
        self.peer.record(direction, bytes, kind);
        self.manager.record(direction, bytes, kind);
    }
}
