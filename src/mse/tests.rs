use super::*;
use crate::sched::Scheduler;
use crate::testutils::{PipeConnection, pipe};
use local_async_utils::prelude::*;
use tokio::{join, runtime, time};

struct Peers {
    _scheduler: Scheduler,
    netio: NetworkIo,
    initiator: Link<PipeConnection>,
    responder: Link<PipeConnection>,
}

fn setup() -> Peers {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Off)
        .with_module_level("mtorrent_wire::mse", log::LevelFilter::Debug)
        .init();
    let scheduler = Scheduler::spawn(Default::default(), runtime::Handle::current());
    let netio = NetworkIo::new(&scheduler, Default::default()).unwrap();
    let (outbound, inbound) = pipe();
    Peers {
        _scheduler: scheduler,
        netio,
        initiator: Link::new(outbound),
        responder: Link::new(inbound),
    }
}

fn info_hash(seed: u8) -> [u8; 20] {
    [seed; 20]
}

fn plaintext_handshake(info_hash: &[u8; 20]) -> Vec<u8> {
    let mut handshake = b"\x13BitTorrent protocol".to_vec();
    handshake.extend_from_slice(&[0u8; 8]);
    handshake.extend_from_slice(info_hash);
    handshake.extend_from_slice(b"-mt0001-000000000000");
    handshake
}

#[tokio::test]
async fn test_negotiated_ciphers_are_mutual_inverses() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let hash = info_hash(42);
    let known = [hash];

    let (a, b) = join!(
        initiate(&netio, &initiator, Shaping::unlimited(), &hash, EncryptionTypes::ALL, b"hello"),
        respond(
            &netio,
            &responder,
            Shaping::unlimited(),
            &known,
            EncryptionTypes::ALL,
            Bytes::new(),
        )
    );
    let mut a = a.unwrap();
    let mut b = b.unwrap();

    assert_eq!(EncryptionTypes::RC4_FULL, a.selected);
    assert_eq!(EncryptionTypes::RC4_FULL, b.selected);
    assert_eq!(hash, a.info_hash);
    assert_eq!(hash, b.info_hash);
    assert!(a.initial_payload.is_empty());
    assert_eq!(b"hello".as_slice(), b.initial_payload);
    assert!(!a.ciphers.encryptor.is_plaintext());

    for message in [b"".to_vec(), vec![0u8; 1], (0..=255u8).collect(), vec![0xff; 20_000]] {
        let mut data = message.clone();
        a.ciphers.encryptor.apply(&mut data);
        if message.len() > 1 {
            assert_ne!(message, data);
        }
        b.ciphers.decryptor.apply(&mut data);
        assert_eq!(message, data);

        b.ciphers.encryptor.apply(&mut data);
        a.ciphers.decryptor.apply(&mut data);
        assert_eq!(message, data);
    }

    // application messages go through the same stream
    let (sent, received) = join!(
        netio.send_frame(&initiator, &mut a.ciphers.encryptor, b"piece", Shaping::unlimited()),
        netio.receive_frame(&responder, &mut b.ciphers.decryptor, Shaping::unlimited())
    );
    sent.unwrap();
    assert_eq!(Some(b"piece".to_vec()), received.unwrap());
}

#[tokio::test]
async fn test_responder_finds_skey_among_candidates() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let candidates = [info_hash(1), info_hash(2), info_hash(3)];

    let (a, b) = join!(
        initiate(
            &netio,
            &initiator,
            Shaping::unlimited(),
            &candidates[2],
            EncryptionTypes::ALL,
            &[],
        ),
        respond(
            &netio,
            &responder,
            Shaping::unlimited(),
            &candidates,
            EncryptionTypes::ALL,
            Bytes::new(),
        )
    );
    assert_eq!(candidates[2], a.unwrap().info_hash);
    let b = b.unwrap();
    assert_eq!(candidates[2], b.info_hash);
    assert!(b.initial_payload.is_empty());
}

#[tokio::test]
async fn test_unknown_info_hash_fails_key_match() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let candidates = [info_hash(1), info_hash(2), info_hash(3)];
    let unknown = info_hash(4);
    let netio = &netio;

    let (a, b) = join!(
        initiate(netio, &initiator, Shaping::unlimited(), &unknown, EncryptionTypes::ALL, &[]),
        async move {
            let shaping = Shaping::unlimited();
            let result =
                respond(netio, &responder, shaping, &candidates, EncryptionTypes::ALL, Bytes::new())
                    .await;
            // caller tears down the connection
            drop(responder);
            result
        }
    );
    assert!(matches!(b, Err(Error::KeyMatch)), "{b:?}");
    assert!(matches!(a, Err(Error::Transport(_))), "{a:?}");
}

#[tokio::test]
async fn test_header_only_on_both_sides() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let hash = info_hash(7);
    let known = [hash];

    let (a, b) = join!(
        initiate(
            &netio,
            &initiator,
            Shaping::unlimited(),
            &hash,
            EncryptionTypes::RC4_HEADER,
            b"bt",
        ),
        respond(
            &netio,
            &responder,
            Shaping::unlimited(),
            &known,
            EncryptionTypes::RC4_HEADER,
            Bytes::new(),
        )
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(EncryptionTypes::RC4_HEADER, a.selected);
    assert_eq!(EncryptionTypes::RC4_HEADER, b.selected);
    assert!(a.ciphers.encryptor.is_plaintext() && a.ciphers.decryptor.is_plaintext());
    assert!(b.ciphers.encryptor.is_plaintext() && b.ciphers.decryptor.is_plaintext());
    assert_eq!(b"bt".as_slice(), b.initial_payload);
}

#[tokio::test]
async fn test_full_preferred_over_header() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let hash = info_hash(7);
    let known = [hash];
    let both = EncryptionTypes::RC4_HEADER | EncryptionTypes::RC4_FULL;

    let (a, b) = join!(
        initiate(&netio, &initiator, Shaping::unlimited(), &hash, both, &[]),
        respond(
            &netio,
            &responder,
            Shaping::unlimited(),
            &known,
            EncryptionTypes::ALL,
            Bytes::new(),
        )
    );
    assert_eq!(EncryptionTypes::RC4_FULL, a.unwrap().selected);
    assert_eq!(EncryptionTypes::RC4_FULL, b.unwrap().selected);

    let (outbound, inbound) = pipe();
    let (initiator, responder) = (Link::new(outbound), Link::new(inbound));
    let (a, b) = join!(
        initiate(&netio, &initiator, Shaping::unlimited(), &hash, both, &[]),
        respond(
            &netio,
            &responder,
            Shaping::unlimited(),
            &known,
            EncryptionTypes::RC4_HEADER,
            Bytes::new(),
        )
    );
    assert_eq!(EncryptionTypes::RC4_HEADER, a.unwrap().selected);
    assert_eq!(EncryptionTypes::RC4_HEADER, b.unwrap().selected);
}

#[tokio::test]
async fn test_no_common_method_fails_on_both_sides() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let hash = info_hash(9);
    let known = [hash];

    let (a, b) = join!(
        initiate(&netio, &initiator, Shaping::unlimited(), &hash, EncryptionTypes::RC4_FULL, &[]),
        respond(
            &netio,
            &responder,
            Shaping::unlimited(),
            &known,
            EncryptionTypes::PLAIN_TEXT,
            Bytes::new(),
        )
    );
    assert!(matches!(a, Err(Error::CryptoNegotiation)), "{a:?}");
    assert!(matches!(b, Err(Error::CryptoNegotiation)), "{b:?}");
}

#[tokio::test]
async fn test_responder_gives_up_on_garbage() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let garbage = vec![0x5a; 96 + 1000];
    let known = [info_hash(1)];

    let (sent, b) = join!(
        netio.send(&initiator, &garbage, Shaping::unlimited()),
        respond(
            &netio,
            &responder,
            Shaping::unlimited(),
            &known,
            EncryptionTypes::ALL,
            Bytes::new(),
        )
    );
    sent.unwrap();
    assert!(matches!(b, Err(Error::Synchronization(628))), "{b:?}");
}

#[tokio::test]
async fn test_factory_detects_plaintext_handshake() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let hash = info_hash(5);
    let handshake = plaintext_handshake(&hash);
    let factory = EncryptorFactory::default();
    let known = [info_hash(1), hash];

    let (sent, b) = join!(
        netio.send(&initiator, &handshake, Shaping::unlimited()),
        factory.negotiate_inbound(&netio, &responder, Shaping::unlimited(), &known)
    );
    sent.unwrap();
    let b = b.unwrap();
    assert_eq!(EncryptionTypes::PLAIN_TEXT, b.selected);
    assert_eq!(hash, b.info_hash);
    assert_eq!(handshake, b.initial_payload);
    assert!(b.ciphers.decryptor.is_plaintext());
}

#[tokio::test]
async fn test_factory_rejects_plaintext_handshake_for_unknown_torrent() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let handshake = plaintext_handshake(&info_hash(5));
    let factory = EncryptorFactory::default();
    let known = [info_hash(1), info_hash(2)];

    let (sent, b) = join!(
        netio.send(&initiator, &handshake, Shaping::unlimited()),
        factory.negotiate_inbound(&netio, &responder, Shaping::unlimited(), &known)
    );
    sent.unwrap();
    assert!(matches!(b, Err(Error::KeyMatch)), "{b:?}");
}

#[tokio::test]
async fn test_factory_rejects_plaintext_when_not_allowed() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let factory = EncryptorFactory {
        allowed: EncryptionTypes::RC4_FULL,
        ..Default::default()
    };

    let known = [info_hash(5)];
    let handshake = plaintext_handshake(&known[0]);

    let (_, b) = join!(
        netio.send(&initiator, &handshake, Shaping::unlimited()),
        factory.negotiate_inbound(&netio, &responder, Shaping::unlimited(), &known)
    );
    assert!(matches!(b, Err(Error::PlaintextRejected)), "{b:?}");
}

#[tokio::test]
async fn test_factory_negotiates_encrypted_connection() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        responder,
    } = setup();
    let hash = info_hash(11);
    let known = [info_hash(1), hash];
    let factory = EncryptorFactory::default();
    let handshake = plaintext_handshake(&hash);

    let (a, b) = join!(
        factory.negotiate_outbound(
            &netio,
            &initiator,
            Shaping::unlimited(),
            &hash,
            EncryptionTypes::ALL,
            &handshake
        ),
        factory.negotiate_inbound(&netio, &responder, Shaping::unlimited(), &known)
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(EncryptionTypes::RC4_FULL, a.selected);
    assert_eq!(EncryptionTypes::RC4_FULL, b.selected);
    assert_eq!(hash, b.info_hash);
    assert_eq!(handshake, b.initial_payload);
}

#[tokio::test]
async fn test_factory_outbound_plaintext_without_io() {
    let Peers {
        _scheduler,
        netio,
        initiator,
        ..
    } = setup();
    let hash = info_hash(3);

    let not_preferred = EncryptorFactory {
        prefer_encryption: false,
        ..Default::default()
    };
    let negotiated = not_preferred
        .negotiate_outbound(
            &netio,
            &initiator,
            Shaping::unlimited(),
            &hash,
            EncryptionTypes::ALL,
            &[],
        )
        .await
        .unwrap();
    assert_eq!(EncryptionTypes::PLAIN_TEXT, negotiated.selected);
    assert_eq!(hash, negotiated.info_hash);

    let preferred = EncryptorFactory::default();
    let negotiated = preferred
        .negotiate_outbound(
            &netio,
            &initiator,
            Shaping::unlimited(),
            &hash,
            EncryptionTypes::PLAIN_TEXT,
            &[],
        )
        .await
        .unwrap();
    assert_eq!(EncryptionTypes::PLAIN_TEXT, negotiated.selected);

    let nothing_usable = EncryptorFactory {
        allowed: EncryptionTypes::RC4_FULL,
        ..Default::default()
    };
    let result = nothing_usable
        .negotiate_outbound(
            &netio,
            &initiator,
            Shaping::unlimited(),
            &hash,
            EncryptionTypes::PLAIN_TEXT,
            &[],
        )
        .await;
    assert!(matches!(result, Err(Error::CryptoNegotiation)), "{result:?}");
}

#[tokio::test(start_paused = true)]
async fn test_handshake_deadline_closes_connection() {
    let Peers {
        _scheduler,
        netio,
        initiator: _silent_peer,
        responder,
    } = setup();
    let factory = EncryptorFactory {
        deadline: sec!(30),
        ..Default::default()
    };

    let started = time::Instant::now();
    let result =
        factory.negotiate_inbound(&netio, &responder, Shaping::unlimited(), &[info_hash(1)]).await;
    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
    assert!(started.elapsed() >= sec!(30));
    assert!(responder.connection().is_closed());
}

#[test]
fn test_encryption_types() {
    assert!(EncryptionTypes::ALL.contains(EncryptionTypes::RC4_FULL));
    assert!(EncryptionTypes::ALL.rc4_allowed());
    assert!(!EncryptionTypes::PLAIN_TEXT.rc4_allowed());
    assert!(EncryptionTypes::RC4_HEADER.rc4_allowed());
    assert_eq!(
        EncryptionTypes::RC4_HEADER,
        EncryptionTypes::ALL & (EncryptionTypes::RC4_HEADER | EncryptionTypes::PLAIN_TEXT)
            & EncryptionTypes::RC4_HEADER
    );

    assert_eq!(0x03, EncryptionTypes::ALL.crypto_provide());
    assert_eq!(0x01, EncryptionTypes::RC4_HEADER.crypto_provide());
    assert_eq!(0x00, EncryptionTypes::PLAIN_TEXT.crypto_provide());

    assert_eq!(Some((EncryptionTypes::RC4_FULL, 0x02)), EncryptionTypes::select(0x03, 0x03));
    assert_eq!(Some((EncryptionTypes::RC4_HEADER, 0x01)), EncryptionTypes::select(0x01, 0x03));
    assert_eq!(None, EncryptionTypes::select(0x02, 0x01));

    assert_eq!(Some(EncryptionTypes::RC4_FULL), EncryptionTypes::from_crypto_select(0x02, 0x03));
    assert_eq!(None, EncryptionTypes::from_crypto_select(0x02, 0x01));
    assert_eq!(None, EncryptionTypes::from_crypto_select(0x03, 0x03));
    assert_eq!(None, EncryptionTypes::from_crypto_select(0, 0x03));
}

#[test]
fn test_convert_to_io_error() {
    assert_eq!(io::ErrorKind::TimedOut, io::Error::from(Error::Timeout).kind());
    assert_eq!(io::ErrorKind::InvalidData, io::Error::from(Error::KeyMatch).kind());
    assert_eq!(
        io::ErrorKind::UnexpectedEof,
        io::Error::from(Error::Transport(netio::Error::ZeroTransfer { remaining: 1 })).kind()
    );
}
