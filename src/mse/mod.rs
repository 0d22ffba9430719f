//! Message Stream Encryption: negotiation of an obfuscated and optionally encrypted
//! channel before the first byte of the peer wire protocol.
//!
//! Both sides exchange Diffie-Hellman public values, the initiator proves knowledge of the
//! info hash (SKEY) without revealing it, and the responder selects the cipher used afterwards.

mod crypto;
mod factory;
mod handshake;

#[cfg(test)]
mod tests;

pub use crypto::{Cipher, CipherPair};
pub use factory::EncryptorFactory;

use crate::conn::{Connection, Link};
use crate::netio::{self, NetworkIo, Shaping};
use bytes::Bytes;
use handshake::{Channel, Role};
use serde::{Deserialize, Serialize};
use std::io;
use std::ops::{BitAnd, BitOr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] netio::Error),
    #[error("synchronization marker not found within {0} bytes")]
    Synchronization(usize),
    #[error("no valid SKEY found")]
    KeyMatch,
    #[error("verification constant was invalid")]
    VerificationConstant,
    #[error("no common encryption method")]
    CryptoNegotiation,
    #[error("invalid padding length {0}")]
    InvalidPadding(usize),
    #[error("initial payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
    #[error("handshake timed out")]
    Timeout,
    #[error("plaintext connections are not allowed")]
    PlaintextRejected,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Transport(e) => e.into(),
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, e),
            Error::PlaintextRejected | Error::CryptoNegotiation => {
                io::Error::new(io::ErrorKind::ConnectionRefused, e)
            }
            Error::PayloadTooLarge(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
            _ => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

/// Set of connection types: plaintext BitTorrent, RC4 during the handshake only
/// (header), RC4 for the entire stream (full).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptionTypes(u8);

impl EncryptionTypes {
    pub const NONE: Self = Self(0);
    pub const PLAIN_TEXT: Self = Self(1);
    pub const RC4_HEADER: Self = Self(2);
    pub const RC4_FULL: Self = Self(4);
    pub const ALL: Self = Self(7);

    const CRYPTO_RC4_HEADER: u32 = 0x01;
    const CRYPTO_RC4_FULL: u32 = 0x02;

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn rc4_allowed(self) -> bool {
        self.intersects(Self(Self::RC4_HEADER.0 | Self::RC4_FULL.0))
    }

    /// Crypto-provide bitmask sent on the wire.
    fn crypto_provide(self) -> u32 {
        let mut bitmask = 0;
        if self.contains(Self::RC4_FULL) {
            bitmask |= Self::CRYPTO_RC4_FULL;
        }
        if self.contains(Self::RC4_HEADER) {
            bitmask |= Self::CRYPTO_RC4_HEADER;
        }
        bitmask
    }

    /// Strongest method present in both bitmasks.
    fn select(local_provide: u32, remote_provide: u32) -> Option<(Self, u32)> {
        let common = local_provide & remote_provide;
        if common & Self::CRYPTO_RC4_FULL != 0 {
            Some((Self::RC4_FULL, Self::CRYPTO_RC4_FULL))
        } else if common & Self::CRYPTO_RC4_HEADER != 0 {
            Some((Self::RC4_HEADER, Self::CRYPTO_RC4_HEADER))
        } else {
            None
        }
    }

    /// Method chosen by the responder, if it is one of the offered ones.
    fn from_crypto_select(crypto_select: u32, local_provide: u32) -> Option<Self> {
        if crypto_select & local_provide != crypto_select {
            return None;
        }
        match crypto_select {
            Self::CRYPTO_RC4_FULL => Some(Self::RC4_FULL),
            Self::CRYPTO_RC4_HEADER => Some(Self::RC4_HEADER),
            _ => None,
        }
    }
}

impl Default for EncryptionTypes {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for EncryptionTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for EncryptionTypes {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Result of a successful negotiation.
#[derive(Debug)]
pub struct Negotiated {
    pub ciphers: CipherPair,
    /// [`EncryptionTypes::PLAIN_TEXT`], [`EncryptionTypes::RC4_HEADER`] or
    /// [`EncryptionTypes::RC4_FULL`].
    pub selected: EncryptionTypes,
    /// SKEY of the torrent the connection is for.
    pub info_hash: [u8; 20],
    /// Application data received as part of the handshake, already decrypted.
    pub initial_payload: Vec<u8>,
}

/// Run the handshake as the connecting side, piggy-backing `initial_payload`.
pub async fn initiate<C: Connection>(
    netio: &NetworkIo,
    link: &Link<C>,
    shaping: Shaping<'_>,
    info_hash: &[u8; 20],
    allowed: EncryptionTypes,
    initial_payload: &[u8],
) -> Result<Negotiated, Error> {
    let role = Role::Initiator {
        info_hash,
        initial_payload,
    };
    handshake::run(Channel::new(netio, link, shaping, Bytes::new()), role, allowed).await
}

/// Run the handshake as the accepting side. `info_hashes` are the torrents that can be served,
/// `received` are the bytes already read from the connection.
pub async fn respond<C: Connection>(
    netio: &NetworkIo,
    link: &Link<C>,
    shaping: Shaping<'_>,
    info_hashes: &[[u8; 20]],
    allowed: EncryptionTypes,
    received: Bytes,
) -> Result<Negotiated, Error> {
    let role = Role::Responder { info_hashes };
    handshake::run(Channel::new(netio, link, shaping, received), role, allowed).await
}
