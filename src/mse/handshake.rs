use super::crypto::{self, CipherPair, KEY_LENGTH, KeyPair};
use super::{EncryptionTypes, Error, Negotiated};
use crate::conn::{Connection, Link};
use crate::netio::{NetworkIo, Shaping};
use bytes::Bytes;
use tokio::time::Instant;
use tokio::try_join;

const VERIFICATION_CONSTANT: [u8; 8] = [0u8; 8];

/// Max bytes received by the responder, counted from the start of the connection, before
/// HASH('req1', S) must have been found.
pub(super) const RESPONDER_SYNC_STOP_POINT: usize = 628;

/// Max bytes received by the initiator, counted from the start of the connection, before
/// the encrypted verification constant must have been found.
pub(super) const INITIATOR_SYNC_STOP_POINT: usize = 616;

const MAX_PAD_LENGTH: usize = 512;

pub(super) enum Role<'a> {
    Initiator {
        info_hash: &'a [u8; 20],
        initial_payload: &'a [u8],
    },
    Responder {
        info_hashes: &'a [[u8; 20]],
    },
}

struct Io<'a, C> {
    netio: &'a NetworkIo,
    link: &'a Link<C>,
    shaping: Shaping<'a>,
}

impl<C> Clone for Io<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Io<'_, C> {}

impl<C: Connection> Io<'_, C> {
    async fn send(self, data: &[u8]) -> Result<(), Error> {
        self.netio.send(self.link, data, self.shaping).await?;
        Ok(())
    }
}

/// Connection being negotiated, and the bytes received from it before the handshake started.
pub(super) struct Channel<'a, C> {
    io: Io<'a, C>,
    received: Bytes,
    /// Bytes handed out since the start of the connection, prefix included.
    delivered: usize,
}

impl<'a, C: Connection> Channel<'a, C> {
    pub(super) fn new(
        netio: &'a NetworkIo,
        link: &'a Link<C>,
        shaping: Shaping<'a>,
        received: Bytes,
    ) -> Self {
        Self {
            io: Io {
                netio,
                link,
                shaping,
            },
            received,
            delivered: 0,
        }
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let buffered = buf.len().min(self.received.len());
        buf[..buffered].copy_from_slice(&self.received.split_to(buffered));
        if buffered < buf.len() {
            self.io.netio.receive(self.io.link, &mut buf[buffered..], self.io.shaping).await?;
        }
        self.delivered += buf.len();
        Ok(())
    }

    fn remote(&self) -> String {
        self.io.link.connection().uri().to_string()
    }
}

pub(super) async fn run<C: Connection>(
    mut channel: Channel<'_, C>,
    role: Role<'_>,
    allowed: EncryptionTypes,
) -> Result<Negotiated, Error> {
    let started = Instant::now();
    let crypto_provide = allowed.crypto_provide();
    let keys = KeyPair::generate();

    let result = async {
        let secret = exchange_keys(&mut channel, &keys).await?;
        match role {
            Role::Initiator {
                info_hash,
                initial_payload,
            } => initiate(&mut channel, &secret, info_hash, crypto_provide, initial_payload).await,
            Role::Responder { info_hashes } => {
                respond(&mut channel, &secret, info_hashes, crypto_provide).await
            }
        }
    }
    .await;

    match &result {
        Ok(negotiated) => log::debug!(
            "{} <=> MSE handshake completed in {:?}, selected {:?}",
            channel.remote(),
            started.elapsed(),
            negotiated.selected
        ),
        Err(e) => log::debug!("{} <=> MSE handshake failed: {e}", channel.remote()),
    }
    result
}

async fn exchange_keys<C: Connection>(
    channel: &mut Channel<'_, C>,
    keys: &KeyPair,
) -> Result<[u8; KEY_LENGTH], Error> {
    let mut outgoing = keys.public_key().to_vec();
    outgoing.extend_from_slice(&crypto::random_pad());

    let mut remote_public = [0u8; KEY_LENGTH];
    let io = channel.io;
    try_join!(io.send(&outgoing), channel.receive(&mut remote_public))?;
    Ok(keys.shared_secret(&remote_public))
}

/// Read until the last `marker.len()` bytes equal `marker`. Gives up once more than
/// `stop_point` bytes have been received on the connection in total.
async fn synchronize<C: Connection>(
    channel: &mut Channel<'_, C>,
    marker: &[u8],
    stop_point: usize,
) -> Result<(), Error> {
    if channel.delivered > stop_point {
        return Err(Error::Synchronization(stop_point));
    }
    let mut window = vec![0u8; marker.len()];
    channel.receive(&mut window).await?;

    while window != marker {
        if channel.delivered > stop_point {
            return Err(Error::Synchronization(stop_point));
        }
        let shift = window[1..]
            .iter()
            .position(|&byte| byte == marker[0])
            .map_or(window.len(), |position| position + 1);
        window.copy_within(shift.., 0);
        let window_len = window.len();
        channel.receive(&mut window[window_len - shift..]).await?;
    }
    Ok(())
}

fn xor(lhs: &[u8; 20], rhs: &[u8; 20]) -> [u8; 20] {
    let mut result = *lhs;
    for (byte, other) in result.iter_mut().zip(rhs) {
        *byte ^= other;
    }
    result
}

fn pad_length(bytes: [u8; 2]) -> Result<usize, Error> {
    let length = u16::from_be_bytes(bytes) as usize;
    if length > MAX_PAD_LENGTH {
        Err(Error::InvalidPadding(length))
    } else {
        Ok(length)
    }
}

fn application_ciphers(selected: EncryptionTypes, handshake_ciphers: CipherPair) -> CipherPair {
    if selected == EncryptionTypes::RC4_FULL {
        handshake_ciphers
    } else {
        CipherPair::plaintext()
    }
}

async fn initiate<C: Connection>(
    channel: &mut Channel<'_, C>,
    secret: &[u8; KEY_LENGTH],
    info_hash: &[u8; 20],
    crypto_provide: u32,
    initial_payload: &[u8],
) -> Result<Negotiated, Error> {
    let initial_payload_len = u16::try_from(initial_payload.len())
        .map_err(|_| Error::PayloadTooLarge(initial_payload.len()))?;
    let mut ciphers = CipherPair::derive(secret, info_hash, b"keyA", b"keyB");

    // 3 A->B: HASH('req1', S), HASH('req2', SKEY) xor HASH('req3', S),
    // ENCRYPT(VC, crypto_provide, len(PadC), PadC, len(IA)), ENCRYPT(IA)
    let pad_c = crypto::random_pad();
    let mut message = Vec::with_capacity(40 + 16 + pad_c.len() + initial_payload.len());
    message.extend_from_slice(&crypto::hash(&[b"req1", secret]));
    message.extend_from_slice(&xor(
        &crypto::hash(&[b"req2", info_hash]),
        &crypto::hash(&[b"req3", secret]),
    ));
    let encrypted_start = message.len();
    message.extend_from_slice(&VERIFICATION_CONSTANT);
    message.extend_from_slice(&crypto_provide.to_be_bytes());
    message.extend_from_slice(&(pad_c.len() as u16).to_be_bytes());
    message.extend_from_slice(&pad_c);
    message.extend_from_slice(&initial_payload_len.to_be_bytes());
    message.extend_from_slice(initial_payload);
    ciphers.encryptor.apply(&mut message[encrypted_start..]);
    channel.io.send(&message).await?;

    // 4 B->A: ENCRYPT(VC, crypto_select, len(padD), padD)
    let mut encrypted_vc = VERIFICATION_CONSTANT;
    ciphers.decryptor.apply(&mut encrypted_vc);
    synchronize(channel, &encrypted_vc, INITIATOR_SYNC_STOP_POINT).await?;

    let mut header = [0u8; 6];
    channel.receive(&mut header).await?;
    ciphers.decryptor.apply(&mut header);
    let [s0, s1, s2, s3, l0, l1] = header;
    let crypto_select = u32::from_be_bytes([s0, s1, s2, s3]);

    let mut pad_d = vec![0u8; pad_length([l0, l1])?];
    channel.receive(&mut pad_d).await?;
    ciphers.decryptor.apply(&mut pad_d);

    let selected = EncryptionTypes::from_crypto_select(crypto_select, crypto_provide)
        .ok_or(Error::CryptoNegotiation)?;
    Ok(Negotiated {
        ciphers: application_ciphers(selected, ciphers),
        selected,
        info_hash: *info_hash,
        initial_payload: Vec::new(),
    })
}

async fn respond<C: Connection>(
    channel: &mut Channel<'_, C>,
    secret: &[u8; KEY_LENGTH],
    info_hashes: &[[u8; 20]],
    crypto_provide: u32,
) -> Result<Negotiated, Error> {
    // 3 A->B: HASH('req1', S), HASH('req2', SKEY) xor HASH('req3', S),
    // ENCRYPT(VC, crypto_provide, len(PadC), PadC, len(IA)), ENCRYPT(IA)
    synchronize(channel, &crypto::hash(&[b"req1", secret]), RESPONDER_SYNC_STOP_POINT).await?;

    let mut obfuscated_skey = [0u8; 20];
    channel.receive(&mut obfuscated_skey).await?;
    let req3 = crypto::hash(&[b"req3", secret]);
    let info_hash = info_hashes
        .iter()
        .find(|candidate| {
            xor(&crypto::hash(&[b"req2", candidate.as_slice()]), &req3) == obfuscated_skey
        })
        .ok_or(Error::KeyMatch)?;

    let mut ciphers = CipherPair::derive(secret, info_hash, b"keyB", b"keyA");
    let mut header = [0u8; 14];
    channel.receive(&mut header).await?;
    ciphers.decryptor.apply(&mut header);
    if header[..8] != VERIFICATION_CONSTANT {
        return Err(Error::VerificationConstant);
    }
    let remote_provide = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

    // PadC followed by len(IA)
    let pad_c_len = pad_length([header[12], header[13]])?;
    let mut pad_c = vec![0u8; pad_c_len + 2];
    channel.receive(&mut pad_c).await?;
    ciphers.decryptor.apply(&mut pad_c);

    let initial_payload_len = u16::from_be_bytes([pad_c[pad_c_len], pad_c[pad_c_len + 1]]);
    let mut initial_payload = vec![0u8; initial_payload_len as usize];
    channel.receive(&mut initial_payload).await?;
    ciphers.decryptor.apply(&mut initial_payload);

    // 4 B->A: ENCRYPT(VC, crypto_select, len(padD), padD)
    // select = 0 when nothing is common, so that the initiator fails the same way
    let selection = EncryptionTypes::select(crypto_provide, remote_provide);
    let crypto_select = selection.map_or(0, |(_, bitmask)| bitmask);
    let pad_d = crypto::random_pad();
    let mut message = Vec::with_capacity(14 + pad_d.len());
    message.extend_from_slice(&VERIFICATION_CONSTANT);
    message.extend_from_slice(&crypto_select.to_be_bytes());
    message.extend_from_slice(&(pad_d.len() as u16).to_be_bytes());
    message.extend_from_slice(&pad_d);
    ciphers.encryptor.apply(&mut message);
    channel.io.send(&message).await?;

    let (selected, _) = selection.ok_or(Error::CryptoNegotiation)?;
    Ok(Negotiated {
        ciphers: application_ciphers(selected, ciphers),
        selected,
        info_hash: *info_hash,
        initial_payload,
    })
}
