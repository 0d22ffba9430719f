//! Peer wire transport core for Tokio-based BitTorrent clients: cooperative task scheduling,
//! rate-limited network I/O and the Message Stream Encryption handshake.

/// Serializable settings for the transport core.
pub mod config;

/// TCP peer connections and the connection capability used by the I/O layer.
pub mod conn;

/// Engine wiring the scheduler, network I/O and global rate limiting together.
pub mod engine;

/// Message Stream Encryption (obfuscation handshake negotiated before the peer wire protocol).
pub mod mse;

/// Byte counters and speed estimates for peer and torrent traffic.
pub mod monitor;

/// Chunked, rate-limited network I/O.
pub mod netio;

/// Adaptive chunk budget used to throttle network I/O.
pub mod ratelimit;

/// Priority-ordered cooperative task scheduler.
pub mod sched;

/// Dedicated threads hosting Tokio runtimes.
pub mod worker;

#[cfg(test)]
pub(crate) mod testutils;
