use num_bigint::BigUint;
use rand::Rng;
use std::sync::LazyLock;

/// Length of the Diffie-Hellman public value and of the shared secret.
pub const KEY_LENGTH: usize = 96;

const PRIVATE_KEY_LENGTH: usize = 20;

/// Keystream bytes thrown away after key setup.
const RC4_DISCARD: usize = 1024;

#[rustfmt::skip]
const PRIME: [u8; KEY_LENGTH] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x3a, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

static P: LazyLock<BigUint> = LazyLock::new(|| BigUint::from_bytes_be(&PRIME));

fn to_key_bytes(value: &BigUint) -> [u8; KEY_LENGTH] {
    let bytes = value.to_bytes_be();
    let mut key = [0u8; KEY_LENGTH];
    key[KEY_LENGTH - bytes.len()..].copy_from_slice(&bytes);
    key
}

pub struct KeyPair {
    private: BigUint,
    public: [u8; KEY_LENGTH],
}

impl KeyPair {
    pub fn generate() -> Self {
        let x: [u8; PRIVATE_KEY_LENGTH] = rand::random();
        Self::from_private(&x)
    }

    fn from_private(x: &[u8]) -> Self {
        let private = BigUint::from_bytes_be(x);
        let public = to_key_bytes(&BigUint::from(2u32).modpow(&private, &P));
        Self { private, public }
    }

    pub fn public_key(&self) -> &[u8; KEY_LENGTH] {
        &self.public
    }

    /// S = Y^X mod P
    pub fn shared_secret(&self, remote_public: &[u8; KEY_LENGTH]) -> [u8; KEY_LENGTH] {
        let remote = BigUint::from_bytes_be(remote_public);
        to_key_bytes(&remote.modpow(&self.private, &P))
    }
}

/// SHA-1 of the concatenation of `parts`.
pub fn hash(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = sha1_smol::Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.digest().bytes()
}

/// 0..=511 random bytes.
pub fn random_pad() -> Vec<u8> {
    let mut rng = rand::rng();
    let mut pad = vec![0u8; rng.random_range(0..512)];
    rng.fill(&mut pad[..]);
    pad
}

#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        Self::with_discard(key, RC4_DISCARD)
    }

    fn with_discard(key: &[u8], discard: usize) -> Self {
        let mut state = [0u8; 256];
        for (i, byte) in state.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        let mut rc4 = Self { state, i: 0, j: 0 };
        for _ in 0..discard {
            rc4.next_byte();
        }
        rc4
    }

    fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        let index = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
        self.state[index as usize]
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            *byte ^= self.next_byte();
        }
    }
}

/// Stream cipher applied to everything sent or received after the handshake.
#[derive(derive_more::Debug, Clone)]
pub enum Cipher {
    PlainText,
    Rc4(#[debug(skip)] Box<Rc4>),
}

impl Cipher {
    pub fn rc4(key: &[u8]) -> Self {
        Self::Rc4(Box::new(Rc4::new(key)))
    }

    /// Encrypt or decrypt `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        if let Cipher::Rc4(rc4) = self {
            rc4.apply(data);
        }
    }

    pub fn is_plaintext(&self) -> bool {
        matches!(self, Cipher::PlainText)
    }
}

#[derive(Debug, Clone)]
pub struct CipherPair {
    pub encryptor: Cipher,
    pub decryptor: Cipher,
}

impl CipherPair {
    pub fn plaintext() -> Self {
        Self {
            encryptor: Cipher::PlainText,
            decryptor: Cipher::PlainText,
        }
    }

    /// RC4 pair derived from the shared secret and SKEY, `local_salt` keys the encryptor.
    pub fn derive(secret: &[u8], skey: &[u8], local_salt: &[u8], remote_salt: &[u8]) -> Self {
        Self {
            encryptor: Cipher::rc4(&hash(&[local_salt, secret, skey])),
            decryptor: Cipher::rc4(&hash(&[remote_salt, secret, skey])),
        }
    }
}
