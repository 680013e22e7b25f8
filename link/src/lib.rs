//! Authenticate peers over encrypted links and resume cached sessions without asymmetric cryptography.
//!
//! # Status
//!
//! `commonware-link` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.
//!
//! # Overview
//!
//! A [Link] turns a raw duplex connection (a [commonware_runtime::Sink] and
//! [commonware_runtime::Stream]) into an authenticated [Channel]. Every node holds a long-term [Authentity] whose public half, its
//! [Identity], is known to peers ahead of time.
//!
//! The first link between two nodes runs a full handshake:
//!
//! ```text
//! Initiator                                         Responder
//!   header(AUTHENTICATE), C_I, Seal(R, C_I)  ----->
//!                                                    (check Seal(R, C_I) opens to C_I)
//!                         <-----  CONTINUE, C_R, Sign_R(H(C_I ‖ C_R))
//!   (verify, derive k)
//!   IV_I, Enc_k(identity_I, Sign_I(H(identity_I ‖ C_I ‖ C_R)))  ----->
//!                                                    (verify, cache k)
//!                         <-----  IV_R
//! ```
//!
//! `C_I` and `C_R` are ephemeral X25519 keys and `k` is derived from their shared secret, so a
//! full handshake provides forward secrecy. Sealing `C_I` to the responder proves that the
//! initiator targeted this responder specifically: a node that is merely scanned never answers.
//!
//! Both sides then cache `k` in their [SessionRegistry]. A later link between the same nodes
//! offers `H(k)` (sealed to the responder) instead of repeating the key agreement:
//!
//! ```text
//! Initiator                                         Responder
//!   header(RESTART), Seal(R, H(k) ‖ safe)   ----->
//!                         <-----  CONTINUE, IV_R, Enc_k(CONTINUE)
//!   IV_I  ----->
//! ```
//!
//! A resumed link reuses `k` unchanged and therefore has no forward secrecy of its own. Cached
//! keys expire after [Config::token_lifetime] when dialing and after an additional
//! [Config::token_grace] when accepting, so a dialer racing its own expiry is still recognized.
//!
//! If the responder no longer recognizes `H(k)`, what happens depends on the `safe` flag. With it
//! set, the responder replies `HANGUP` and both sides fall back to a full handshake on the same
//! connection. Without it, the responder fails silently and the initiator (which started sending
//! without waiting for a reply) detects the lost session on its first read.
//!
//! # Security
//!
//! ## Provided
//!
//! * Mutual authentication of long-term identities.
//! * Confidentiality of all traffic after the first handshake message.
//! * Forward secrecy for links established by a full handshake.
//! * Resistance to scanning: a responder only answers initiators that know its identity.
//!
//! ## Not Provided
//!
//! * Integrity of individual application bytes: traffic is encrypted with a stream cipher, so
//!   framing above this crate must authenticate what it needs to.
//! * Forward secrecy for resumed links.
//! * Hiding that two nodes are communicating from an observer of the network.

pub mod channel;
mod cipher;
pub mod identity;
pub mod link;
pub mod manager;
pub mod metrics;
pub mod mocks;
mod mpi;
pub mod registry;
pub mod token;

pub use channel::{Channel, Receiver, Sender};
pub use cipher::{KeyHash, KEY_HASH_LENGTH};
pub use identity::{Authentity, Identity};
pub use link::{Link, State, Status};
pub use manager::LinkManager;
pub use registry::{Admission, SessionRegistry};
pub use token::SessionToken;

use std::{num::NonZeroU32, time::Duration};
use thiserror::Error;

/// Errors that can occur when negotiating or using a [Link].
#[derive(Error, Debug)]
pub enum Error {
    // Negotiation errors
    #[error("negotiation refused")]
    NegotiationRefused,
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),
    #[error("negotiation failed: {0}")]
    NegotiationFailed(&'static str),
    #[error("connect timed out")]
    ConnectTimedOut,
    #[error("cannot dial self")]
    DialSelf,

    // Link errors
    #[error("link closed")]
    Closed,
    #[error("link not ready")]
    NotReady,
    #[error("transport error: {0}")]
    Transport(commonware_runtime::Error),

    // Cipher errors
    #[error("keystream exhausted")]
    KeystreamExhausted,
    #[error("cipher creation failed")]
    CipherCreation,
}

const RECOMMENDED_MAX_INBOUND_NEGOTIATIONS: NonZeroU32 = match NonZeroU32::new(64) {
    Some(max) => max,
    None => panic!("ceiling must be non-zero"),
};

/// Configuration shared by every [Link] created by a [LinkManager].
///
/// # Warning
///
/// Peers must agree on `namespace`, or every handshake between them will fail.
#[derive(Clone, Debug)]
pub struct Config {
    /// Unique prefix for all signatures and derived keys. Should be application-specific.
    pub namespace: Vec<u8>,

    /// How long a negotiated session may be offered when dialing.
    pub token_lifetime: Duration,

    /// How much longer (after `token_lifetime`) a session is still accepted from a dialer.
    pub token_grace: Duration,

    /// Maximum number of inbound negotiations that may run concurrently. Inbound connections
    /// beyond this ceiling are refused without reading from them.
    pub max_inbound_negotiations: NonZeroU32,

    /// Whether a responder checks that a full handshake was addressed to it (by opening the
    /// initiator's sealed ephemeral key) before answering.
    pub check_target: bool,

    /// Maximum time a negotiation may take before it fails with [Error::ConnectTimedOut].
    pub negotiation_timeout: Duration,

    /// Whether outbound resume attempts wait for the responder to acknowledge the session (and
    /// fall back to a full handshake if it does not) before sending.
    pub safe_resume: bool,
}

impl Config {
    /// Generates a configuration with reasonable defaults for usage in production.
    pub fn recommended(namespace: &[u8]) -> Self {
        Self {
            namespace: namespace.to_vec(),
            token_lifetime: Duration::from_secs(30 * 60),
            token_grace: Duration::from_secs(60),
            max_inbound_negotiations: RECOMMENDED_MAX_INBOUND_NEGOTIATIONS,
            check_target: true,
            negotiation_timeout: Duration::from_secs(10),
            safe_resume: true,
        }
    }
}
