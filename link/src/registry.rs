//! Process-wide store of [SessionToken]s and the inbound admission budget.

use crate::{
    cipher::{Key, KeyHash},
    metrics::Metrics,
    Config, Error, Identity, SessionToken,
};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tracing::debug;

/// Tokens indexed by the local identity they were negotiated as, so several identities (or
/// several managers) can share one registry.
#[derive(Default)]
struct Indices {
    by_peer: HashMap<(Identity, Identity), Arc<SessionToken>>,
    by_hash: HashMap<(Identity, KeyHash), Arc<SessionToken>>,
}

fn peer_key(token: &SessionToken) -> (Identity, Identity) {
    (token.local().clone(), token.peer().clone())
}

fn hash_key(token: &SessionToken) -> (Identity, KeyHash) {
    (token.local().clone(), *token.key_hash())
}

impl Indices {
    /// Unlink `token` from both indices, returning whether it was present in either.
    fn unlink(&mut self, token: &Arc<SessionToken>) -> bool {
        let mut removed = false;
        let by_peer = peer_key(token);
        if self
            .by_peer
            .get(&by_peer)
            .is_some_and(|existing| Arc::ptr_eq(existing, token))
        {
            self.by_peer.remove(&by_peer);
            removed = true;
        }
        let by_hash = hash_key(token);
        if self
            .by_hash
            .get(&by_hash)
            .is_some_and(|existing| Arc::ptr_eq(existing, token))
        {
            self.by_hash.remove(&by_hash);
            removed = true;
        }
        removed
    }
}

/// Indexed store of session tokens.
///
/// Tokens are looked up by peer when dialing and by key hash when accepting, always scoped to the
/// local identity asking. At most one token is held per (local, peer) pair: installing a new one
/// evicts (and zeroes) its predecessor. Every method holds the internal lock only for map
/// operations, never across I/O.
///
/// A registry is meant to be created once and shared (behind an [Arc]) by every
/// [crate::LinkManager] in the process.
pub struct SessionRegistry<E: Clock> {
    context: E,
    lifetime: Duration,
    grace: Duration,
    max_inbound: u32,

    indices: Mutex<Indices>,
    negotiations: Arc<AtomicU32>,

    metrics: Metrics,
}

impl<E: Clock> SessionRegistry<E> {
    /// Create an empty registry, registering its metrics with `context`.
    ///
    /// Token lifetimes and the admission ceiling are taken from `config`.
    pub fn new(context: E, config: &Config) -> Self
    where
        E: RuntimeMetrics,
    {
        let metrics = Metrics::init(context.clone());
        Self {
            context,
            lifetime: config.token_lifetime,
            grace: config.token_grace,
            max_inbound: config.max_inbound_negotiations.get(),
            indices: Mutex::new(Indices::default()),
            negotiations: Arc::new(AtomicU32::new(0)),
            metrics,
        }
    }

    /// Cache `key` as the session `local` shares with `peer`, replacing any previous session
    /// between them.
    pub fn add_link(&self, peer: Identity, local: Identity, key: Key) -> Arc<SessionToken> {
        let token = Arc::new(SessionToken::new(
            peer,
            local,
            key,
            self.context.current(),
            self.lifetime,
            self.grace,
        ));

        let evicted = {
            let mut indices = self.indices.lock().unwrap();
            let mut evicted = Vec::with_capacity(2);
            if let Some(previous) = indices.by_peer.get(&peer_key(&token)).cloned() {
                indices.unlink(&previous);
                evicted.push(previous);
            }

            // Only reachable if two peers somehow derived the same key
            if let Some(previous) = indices.by_hash.get(&hash_key(&token)).cloned() {
                indices.unlink(&previous);
                evicted.push(previous);
            }
            indices.by_peer.insert(peer_key(&token), token.clone());
            indices.by_hash.insert(hash_key(&token), token.clone());
            self.metrics.tokens.set(indices.by_peer.len() as i64);
            evicted
        };
        for previous in evicted {
            previous.dispose();
        }
        debug!(peer = ?token.peer(), local = ?token.local(), "cached session");
        token
    }

    /// Evict `token` and zero its key.
    ///
    /// Returns `false` (leaving the registry untouched) if `token` was already replaced or removed.
    pub fn remove_link(&self, token: &Arc<SessionToken>) -> bool {
        let removed = {
            let mut indices = self.indices.lock().unwrap();
            let removed = indices.unlink(token);
            self.metrics.tokens.set(indices.by_peer.len() as i64);
            removed
        };
        token.dispose();
        if removed {
            debug!(peer = ?token.peer(), local = ?token.local(), "evicted session");
        }
        removed
    }

    /// Find the session `local` should offer when dialing `peer`.
    pub fn search_outbound_links(
        &self,
        local: &Identity,
        peer: &Identity,
    ) -> Option<Arc<SessionToken>> {
        let now = self.context.current();
        let indices = self.indices.lock().unwrap();
        indices
            .by_peer
            .get(&(local.clone(), peer.clone()))
            .filter(|token| !token.is_outbound_expired(now))
            .cloned()
    }

    /// Find the session a dialer is offering to `local` by its key hash.
    pub fn search_inbound_links(
        &self,
        local: &Identity,
        key_hash: &KeyHash,
    ) -> Option<Arc<SessionToken>> {
        let now = self.context.current();
        let indices = self.indices.lock().unwrap();
        indices
            .by_hash
            .get(&(local.clone(), *key_hash))
            .filter(|token| !token.is_inbound_expired(now))
            .cloned()
    }

    /// Evict every token that can no longer be used in either direction.
    ///
    /// Returns the number of tokens evicted.
    pub fn cleanup_links(&self) -> usize {
        let now = self.context.current();
        let expired: Vec<_> = {
            let mut indices = self.indices.lock().unwrap();
            let expired: Vec<_> = indices
                .by_peer
                .values()
                .filter(|token| token.is_inbound_expired(now))
                .cloned()
                .collect();
            for token in &expired {
                indices.unlink(token);
            }
            self.metrics.tokens.set(indices.by_peer.len() as i64);
            expired
        };
        for token in &expired {
            token.dispose();
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired sessions");
        }
        expired.len()
    }

    /// Number of cached tokens.
    pub fn len(&self) -> usize {
        self.indices.lock().unwrap().by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a slot for an inbound negotiation.
    ///
    /// Fails with [Error::NegotiationRefused] if the ceiling has been reached. The slot is
    /// released when the returned [Admission] is dropped, however the negotiation ends.
    pub fn admit(&self) -> Result<Admission, Error> {
        self.negotiations
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |current| {
                (current < self.max_inbound).then_some(current + 1)
            })
            .map_err(|_| Error::NegotiationRefused)?;
        self.metrics.inbound_negotiations.inc();
        Ok(Admission {
            counter: self.negotiations.clone(),
            gauge: self.metrics.inbound_negotiations.clone(),
        })
    }

    /// Number of inbound negotiations currently admitted.
    pub fn negotiations(&self) -> u32 {
        self.negotiations.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Runtime context used to read the time and to bound negotiations.
    pub fn context(&self) -> &E {
        &self.context
    }
}

/// A reserved inbound negotiation slot (see [SessionRegistry::admit]).
pub struct Admission {
    counter: Arc<AtomicU32>,
    gauge: prometheus_client::metrics::gauge::Gauge,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Authentity;
    use commonware_runtime::{deterministic, Runner};
    use std::num::NonZeroU32;
    use zeroize::Zeroizing;

    const LIFETIME: Duration = Duration::from_secs(60);
    const GRACE: Duration = Duration::from_secs(20);

    fn registry(
        context: &deterministic::Context,
        max_inbound: u32,
    ) -> SessionRegistry<deterministic::Context> {
        let mut config = Config::recommended(b"registry_test");
        config.token_lifetime = LIFETIME;
        config.token_grace = GRACE;
        config.max_inbound_negotiations = NonZeroU32::new(max_inbound).unwrap();
        SessionRegistry::new(context.with_label("registry"), &config)
    }

    fn identity(seed: u64) -> Identity {
        Authentity::from_seed(seed).identity().clone()
    }

    fn key(byte: u8) -> Key {
        Zeroizing::new([byte; 32])
    }

    #[test]
    fn test_single_token_per_peer() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry(&context, 1);
            let (local, peer) = (identity(0), identity(1));
            let first = registry.add_link(peer.clone(), local.clone(), key(1));
            let second = registry.add_link(peer.clone(), local.clone(), key(2));
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.metrics().tokens.get(), 1);

            // The first token is gone from both indices and its key is zeroed
            assert!(first.key().is_none());
            assert!(registry
                .search_inbound_links(&local, first.key_hash())
                .is_none());
            let found = registry.search_outbound_links(&local, &peer).unwrap();
            assert!(Arc::ptr_eq(&found, &second));
            let found = registry
                .search_inbound_links(&local, second.key_hash())
                .unwrap();
            assert!(Arc::ptr_eq(&found, &second));
        });
    }

    #[test]
    fn test_lookups_are_scoped_to_local_identity() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry(&context, 1);
            let (a, b, c) = (identity(0), identity(1), identity(2));

            // Both ends of one session, cached in the same registry
            let a_side = registry.add_link(b.clone(), a.clone(), key(1));
            let b_side = registry.add_link(a.clone(), b.clone(), key(1));
            assert_eq!(registry.len(), 2);
            assert_eq!(a_side.key_hash(), b_side.key_hash());
            assert!(a_side.key().is_some());
            assert!(b_side.key().is_some());

            let found = registry.search_inbound_links(&b, a_side.key_hash()).unwrap();
            assert!(Arc::ptr_eq(&found, &b_side));
            let found = registry.search_outbound_links(&a, &b).unwrap();
            assert!(Arc::ptr_eq(&found, &a_side));

            // Nobody else can find them
            assert!(registry.search_outbound_links(&c, &b).is_none());
            assert!(registry
                .search_inbound_links(&c, a_side.key_hash())
                .is_none());
        });
    }

    #[test]
    fn test_remove_link() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry(&context, 1);
            let (local, peer) = (identity(0), identity(1));
            let token = registry.add_link(peer.clone(), local.clone(), key(1));
            assert!(registry.remove_link(&token));
            assert!(token.key().is_none());
            assert!(registry.is_empty());
            assert!(registry.search_outbound_links(&local, &peer).is_none());
            assert!(!registry.remove_link(&token));
        });
    }

    #[test]
    fn test_stale_remove_keeps_newer_token() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry(&context, 1);
            let stale = registry.add_link(identity(1), identity(0), key(1));
            let fresh = registry.add_link(identity(1), identity(0), key(2));
            assert!(!registry.remove_link(&stale));
            assert_eq!(registry.len(), 1);
            assert!(fresh.key().is_some());
        });
    }

    #[test]
    fn test_direction_expiry() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry(&context, 1);
            let (local, peer) = (identity(0), identity(1));
            let token = registry.add_link(peer.clone(), local.clone(), key(1));

            // Inside the grace period: no longer offered, still accepted
            context.sleep(LIFETIME + GRACE / 2).await;
            assert!(registry.search_outbound_links(&local, &peer).is_none());
            assert!(registry
                .search_inbound_links(&local, token.key_hash())
                .is_some());
            assert_eq!(registry.cleanup_links(), 0);

            // Past the grace period: gone in both directions
            context.sleep(GRACE).await;
            assert!(registry
                .search_inbound_links(&local, token.key_hash())
                .is_none());
            assert_eq!(registry.cleanup_links(), 1);
            assert!(registry.is_empty());
            assert!(token.key().is_none());
        });
    }

    #[test]
    fn test_cleanup_keeps_live_tokens() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry(&context, 1);
            registry.add_link(identity(1), identity(0), key(1));
            context.sleep(LIFETIME).await;
            registry.add_link(identity(2), identity(0), key(2));
            context.sleep(GRACE).await;

            assert_eq!(registry.cleanup_links(), 1);
            assert_eq!(registry.len(), 1);
            assert!(registry
                .search_outbound_links(&identity(0), &identity(2))
                .is_some());
        });
    }

    #[test]
    fn test_admission() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry(&context, 2);
            let first = registry.admit().unwrap();
            let second = registry.admit().unwrap();
            assert!(matches!(registry.admit(), Err(Error::NegotiationRefused)));
            assert_eq!(registry.negotiations(), 2);
            assert_eq!(registry.metrics().inbound_negotiations.get(), 2);

            drop(first);
            assert_eq!(registry.negotiations(), 1);
            let third = registry.admit().unwrap();
            drop(second);
            drop(third);
            assert_eq!(registry.negotiations(), 0);
            assert_eq!(registry.metrics().inbound_negotiations.get(), 0);
        });
    }

    #[test]
    fn test_metrics_registered() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let registry = registry(&context, 1);
            registry.add_link(identity(1), identity(0), key(1));
            let encoded = context.encode();
            assert!(encoded.contains("registry_tokens"));
            assert!(encoded.contains("registry_key_agreements"));
        });
    }
}
