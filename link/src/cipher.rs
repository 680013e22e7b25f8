//! Key derivation and the keystream applied to link traffic.

use crate::Error;
use chacha20::{
    cipher::{KeyIvInit, StreamCipher},
    ChaCha20,
};
use commonware_utils::union_unique;
use hkdf::Hkdf;
use rand::{CryptoRng, Rng};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Size of a session key (in bytes).
pub const KEY_LENGTH: usize = 32;

/// Size of the IV that prefixes each direction of a keyed link (in bytes).
pub const IV_LENGTH: usize = 12;

/// Size of the digest used to look up a session key (in bytes).
pub const KEY_HASH_LENGTH: usize = 32;

/// A constant prefix used for the salt hash in the HKDF key derivation.
/// This prevents key derivation collisions with other applications.
const BASE_KDF_PREFIX: &[u8] = b"commonware-link/KDF/v1/";

/// A symmetric key that is zeroed when dropped.
pub type Key = Zeroizing<[u8; KEY_LENGTH]>;

/// Digest of a [Key], safe to send (sealed) and to index by.
pub type KeyHash = [u8; KEY_HASH_LENGTH];

/// Derive a key from input key material (IKM) using HKDF-SHA256.
///
/// The `namespace` (length-prefixed behind a crate-specific prefix) and the ordered list of
/// fixed-width `salts` are hashed into the HKDF salt, so callers can bind the key to an
/// application and a handshake transcript.
pub fn derive(ikm: &[u8], namespace: &[u8], salts: &[&[u8]], info: &[u8]) -> Result<Key, Error> {
    let mut hasher = Sha256::new();
    hasher.update(union_unique(BASE_KDF_PREFIX, namespace));
    for salt in salts {
        hasher.update(salt);
    }
    let salt = hasher.finalize();

    let prk = Hkdf::<Sha256>::new(Some(salt.as_slice()), ikm);
    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    prk.expand(info, key.as_mut_slice())
        .map_err(|_| Error::CipherCreation)?;
    Ok(key)
}

/// Compute the lookup digest of a session key.
pub fn key_hash(key: &[u8; KEY_LENGTH]) -> KeyHash {
    Sha256::digest(key).into()
}

/// Hash an ordered list of fields (the `H(a‖b‖…)` of the handshake).
pub fn digest(fields: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field);
    }
    hasher.finalize().into()
}

/// Generate a fresh IV for one direction of a link.
pub fn iv<R: Rng + CryptoRng>(rng: &mut R) -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    rng.fill_bytes(&mut iv);
    iv
}

/// Stateful ChaCha20 keystream for one direction of a link.
///
/// Bytes are transformed in place and in order, so a keystream must see every byte that crosses
/// its direction exactly once.
pub struct Keystream {
    cipher: ChaCha20,
}

impl Keystream {
    pub fn new(key: &[u8; KEY_LENGTH], iv: &[u8; IV_LENGTH]) -> Result<Self, Error> {
        let cipher = ChaCha20::new_from_slices(key, iv).map_err(|_| Error::CipherCreation)?;
        Ok(Self { cipher })
    }

    /// Encrypt or decrypt `buf` in place.
    ///
    /// Fails (without transforming anything) once the 32-bit block counter would wrap.
    pub fn apply(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.cipher
            .try_apply_keystream(buf)
            .map_err(|_| Error::KeystreamExhausted)
    }
}
