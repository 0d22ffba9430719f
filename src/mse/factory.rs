use super::{CipherPair, EncryptionTypes, Error, Negotiated, initiate, respond};
use crate::conn::{Connection, Link};
use crate::netio::{NetworkIo, Shaping};
use bytes::Bytes;
use local_async_utils::prelude::*;
use std::future::Future;
use std::time::Duration;
use tokio::time;

/// Length of a plaintext BitTorrent handshake.
const HANDSHAKE_LENGTH: usize = 68;

const PROTOCOL_STRING: &[u8] = b"\x13BitTorrent protocol";

/// Decides whether a connection is encrypted, and runs the handshake if it is.
#[derive(Debug, Clone)]
pub struct EncryptorFactory {
    pub allowed: EncryptionTypes,
    /// Try encryption first on outbound connections, even if plaintext is allowed.
    pub prefer_encryption: bool,
    pub deadline: Duration,
}

impl Default for EncryptorFactory {
    fn default() -> Self {
        Self {
            allowed: EncryptionTypes::ALL,
            prefer_encryption: true,
            deadline: sec!(30),
        }
    }
}

fn plaintext(info_hash: [u8; 20], initial_payload: Vec<u8>) -> Negotiated {
    Negotiated {
        ciphers: CipherPair::plaintext(),
        selected: EncryptionTypes::PLAIN_TEXT,
        info_hash,
        initial_payload,
    }
}

impl EncryptorFactory {
    /// Inspect the first bytes sent by a remote peer. A plaintext BitTorrent handshake for one
    /// of `info_hashes` is returned as the initial payload, anything else is taken as the start
    /// of an encrypted handshake.
    pub async fn negotiate_inbound<C: Connection>(
        &self,
        netio: &NetworkIo,
        link: &Link<C>,
        shaping: Shaping<'_>,
        info_hashes: &[[u8; 20]],
    ) -> Result<Negotiated, Error> {
        self.with_deadline(link, async {
            let mut first_bytes = vec![0u8; HANDSHAKE_LENGTH];
            netio.receive(link, &mut first_bytes, shaping).await?;

            if first_bytes.starts_with(PROTOCOL_STRING) {
                if !self.allowed.contains(EncryptionTypes::PLAIN_TEXT) {
                    return Err(Error::PlaintextRejected);
                }
                let mut info_hash = [0u8; 20];
                info_hash.copy_from_slice(&first_bytes[28..48]);
                if !info_hashes.contains(&info_hash) {
                    log::debug!(
                        "{} => plaintext handshake for unknown torrent",
                        link.connection().uri()
                    );
                    return Err(Error::KeyMatch);
                }
                return Ok(plaintext(info_hash, first_bytes));
            }
            if !self.allowed.rc4_allowed() {
                log::debug!(
                    "{} => invalid handshake and encryption disabled",
                    link.connection().uri()
                );
                return Err(Error::CryptoNegotiation);
            }
            respond(netio, link, shaping, info_hashes, self.allowed, Bytes::from(first_bytes)).await
        })
        .await
    }

    /// Pick encryption for a connection to a peer known to support `peer_supports`
    /// ([`EncryptionTypes::ALL`] if unknown), and run the handshake if needed.
    pub async fn negotiate_outbound<C: Connection>(
        &self,
        netio: &NetworkIo,
        link: &Link<C>,
        shaping: Shaping<'_>,
        info_hash: &[u8; 20],
        peer_supports: EncryptionTypes,
        initial_payload: &[u8],
    ) -> Result<Negotiated, Error> {
        let usable = self.allowed & peer_supports;
        let plaintext_allowed = self.allowed.contains(EncryptionTypes::PLAIN_TEXT);
        let encrypt = if self.prefer_encryption {
            usable.rc4_allowed()
        } else {
            !plaintext_allowed
        };
        match (encrypt, plaintext_allowed) {
            (false, true) => Ok(plaintext(*info_hash, Vec::new())),
            (true, _) if usable.rc4_allowed() => {
                self.with_deadline(
                    link,
                    initiate(netio, link, shaping, info_hash, usable, initial_payload),
                )
                .await
            }
            _ => Err(Error::CryptoNegotiation),
        }
    }

    async fn with_deadline<C: Connection>(
        &self,
        link: &Link<C>,
        negotiation: impl Future<Output = Result<Negotiated, Error>>,
    ) -> Result<Negotiated, Error> {
        match time::timeout(self.deadline, negotiation).await {
            Ok(result) => result,
            Err(_) => {
                log::debug!("{} <=> handshake timed out", link.connection().uri());
                link.connection().close();
                Err(Error::Timeout)
            }
        }
    }
}
