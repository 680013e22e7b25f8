//! Long-term node keys.
//!
//! An [Identity] is the public half of a node: an Ed25519 public key (to check signatures) and an
//! X25519 key (to seal messages that only the node can open). An [Authentity] holds the matching
//! private halves.
//!
//! Sealing uses an ephemeral X25519 exchange against the recipient's static key, HKDF-SHA256, and
//! ChaCha20-Poly1305, so any modification of a sealed message is detected when it is opened.

use crate::{cipher, Error};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use commonware_cryptography::{ed25519, PrivateKeyExt as _, Signer as _, Verifier as _};
use commonware_utils::hex;
use rand::{rngs::StdRng, CryptoRng, Rng, SeedableRng};
use std::{
    fmt,
    hash::{Hash, Hasher},
};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const VERIFICATION_KEY_LENGTH: usize = 32;
const ENCRYPTION_KEY_LENGTH: usize = 32;

/// Size of an encoded [Identity] (in bytes).
pub const IDENTITY_LENGTH: usize = VERIFICATION_KEY_LENGTH + ENCRYPTION_KEY_LENGTH;

/// Size of a signature (in bytes).
pub const SIGNATURE_LENGTH: usize = 64;

/// Bytes added to a plaintext when it is sealed (ephemeral key + authentication tag).
pub const SEALED_OVERHEAD: usize = 32 + 16;

const SEALED_INFO: &[u8] = b"sealed";

fn sealing_cipher(
    shared: &x25519_dalek::SharedSecret,
    namespace: &[u8],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<ChaCha20Poly1305, Error> {
    if !shared.was_contributory() {
        return Err(Error::AuthenticationFailed("non-contributory sealing key"));
    }
    let key = cipher::derive(
        shared.as_bytes(),
        namespace,
        &[ephemeral.as_bytes(), recipient.as_bytes()],
        SEALED_INFO,
    )?;
    ChaCha20Poly1305::new_from_slice(key.as_slice()).map_err(|_| Error::CipherCreation)
}

/// Public half of a node's long-term keys.
#[derive(Clone)]
pub struct Identity {
    bytes: [u8; IDENTITY_LENGTH],
    verifier: ed25519::PublicKey,
    encryption: PublicKey,
}

impl Identity {
    /// Parse an encoded identity, rejecting public keys that are not valid points.
    pub fn decode(bytes: [u8; IDENTITY_LENGTH]) -> Result<Self, Error> {
        let verifier = ed25519::PublicKey::try_from(&bytes[..VERIFICATION_KEY_LENGTH])
            .map_err(|_| Error::AuthenticationFailed("invalid identity"))?;
        let mut encryption = [0u8; ENCRYPTION_KEY_LENGTH];
        encryption.copy_from_slice(&bytes[VERIFICATION_KEY_LENGTH..]);
        Ok(Self {
            bytes,
            verifier,
            encryption: PublicKey::from(encryption),
        })
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LENGTH] {
        &self.bytes
    }

    /// The Ed25519 key that checks this node's signatures.
    pub fn public_key(&self) -> &ed25519::PublicKey {
        &self.verifier
    }

    /// Check a signature produced by [Authentity::sign] over `message` in `namespace`.
    ///
    /// Anything that does not parse as a signature is rejected.
    pub fn verify(&self, namespace: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = ed25519::Signature::try_from(signature) else {
            return false;
        };
        self.verifier.verify(Some(namespace), message, &signature)
    }

    /// Seal `plaintext` so that only the holder of this identity's [Authentity] can open it.
    pub fn encrypt_to<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
        namespace: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let secret = EphemeralSecret::random_from_rng(&mut *rng);
        let ephemeral = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&self.encryption);
        let aead = sealing_cipher(&shared, namespace, &ephemeral, &self.encryption)?;

        // Every sealing key is used exactly once, so a fixed nonce is safe
        let ciphertext = aead
            .encrypt(&Nonce::default(), plaintext)
            .map_err(|_| Error::CipherCreation)?;
        let mut sealed = Vec::with_capacity(SEALED_OVERHEAD + plaintext.len());
        sealed.extend_from_slice(ephemeral.as_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.bytes[..8]))
    }
}

/// Private half of a node's long-term keys.
///
/// Never serialized; the [fmt::Debug] implementation only prints the public [Identity].
#[derive(Clone)]
pub struct Authentity {
    signer: ed25519::PrivateKey,
    decryption: StaticSecret,
    identity: Identity,
}

impl Authentity {
    pub fn new<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let signer = ed25519::PrivateKey::from_rng(rng);
        let decryption = StaticSecret::random_from_rng(&mut *rng);

        let verifier = signer.public_key();
        let encryption = PublicKey::from(&decryption);
        let mut bytes = [0u8; IDENTITY_LENGTH];
        bytes[..VERIFICATION_KEY_LENGTH].copy_from_slice(verifier.as_ref());
        bytes[VERIFICATION_KEY_LENGTH..].copy_from_slice(encryption.as_bytes());
        Self {
            signer,
            decryption,
            identity: Identity {
                bytes,
                verifier,
                encryption,
            },
        }
    }

    /// Deterministically derive keys from a seed (useful for tests and simulations).
    pub fn from_seed(seed: u64) -> Self {
        Self::new(&mut StdRng::seed_from_u64(seed))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn sign(&self, namespace: &[u8], message: &[u8]) -> ed25519::Signature {
        self.signer.sign(Some(namespace), message)
    }

    /// Open a message sealed with [Identity::encrypt_to].
    pub fn decrypt(&self, namespace: &[u8], sealed: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < SEALED_OVERHEAD {
            return Err(Error::AuthenticationFailed("sealed message too short"));
        }
        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(&sealed[..32]);
        let ephemeral = PublicKey::from(ephemeral);
        let shared = self.decryption.diffie_hellman(&ephemeral);
        let aead = sealing_cipher(&shared, namespace, &ephemeral, &self.identity.encryption)?;
        aead.decrypt(&Nonce::default(), &sealed[32..])
            .map_err(|_| Error::AuthenticationFailed("unable to open sealed message"))
    }
}

impl fmt::Debug for Authentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authentity")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
