//! Cached session keys.

use crate::{
    cipher::{Key, KeyHash},
    Identity,
};
use std::{
    fmt,
    sync::Mutex,
    time::{Duration, SystemTime},
};
use zeroize::Zeroize;

/// A symmetric key negotiated with one peer, cached so a later link can skip the full handshake.
///
/// Everything but the key is immutable. The key is zeroed (and the token becomes unusable for
/// resumption) once the token is disposed of by its [crate::SessionRegistry].
pub struct SessionToken {
    peer: Identity,
    local: Identity,
    key_hash: KeyHash,
    created_at: SystemTime,
    lifetime: Duration,
    grace: Duration,
    key: Mutex<Option<Key>>,
}

impl SessionToken {
    pub(crate) fn new(
        peer: Identity,
        local: Identity,
        key: Key,
        created_at: SystemTime,
        lifetime: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            peer,
            local,
            key_hash: crate::cipher::key_hash(&key),
            created_at,
            lifetime,
            grace,
            key: Mutex::new(Some(key)),
        }
    }

    /// Identity of the peer the key was negotiated with.
    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    /// Identity we negotiated the key as.
    pub fn local(&self) -> &Identity {
        &self.local
    }

    pub fn key_hash(&self) -> &KeyHash {
        &self.key_hash
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Time after which we no longer offer this token when dialing.
    pub fn outbound_expiry(&self) -> SystemTime {
        self.created_at + self.lifetime
    }

    /// Time after which we no longer accept this token from a dialer.
    ///
    /// Always at or after [Self::outbound_expiry], so a dialer racing its own expiry is still
    /// recognized.
    pub fn inbound_expiry(&self) -> SystemTime {
        self.outbound_expiry() + self.grace
    }

    pub fn is_outbound_expired(&self, now: SystemTime) -> bool {
        now >= self.outbound_expiry()
    }

    pub fn is_inbound_expired(&self, now: SystemTime) -> bool {
        now >= self.inbound_expiry()
    }

    /// Copy of the key, or `None` if the token has been disposed of.
    pub(crate) fn key(&self) -> Option<Key> {
        self.key.lock().unwrap().clone()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.key.lock().unwrap().is_none()
    }

    /// Zero the key in place.
    pub(crate) fn dispose(&self) {
        if let Some(mut key) = self.key.lock().unwrap().take() {
            key.zeroize();
        }
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("created_at", &self.created_at)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
