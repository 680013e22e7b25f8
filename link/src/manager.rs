//! Entry point for creating links.

use crate::{
    metrics::Metrics, Authentity, Channel, Config, Error, Identity, Link, SessionRegistry,
};
use commonware_runtime::{Clock, Sink, Stream};
use rand::{CryptoRng, Rng};
use std::sync::Arc;
use tracing::debug;

/// Creates [Link]s backed by a [SessionRegistry].
///
/// Outbound links always proceed. Inbound links are subject to the admission ceiling of the
/// registry, checked before a single byte is read.
///
/// Any number of managers may share one registry; sessions are always scoped to the local
/// [Authentity] that negotiated them.
pub struct LinkManager<E: Clock> {
    config: Arc<Config>,
    registry: Arc<SessionRegistry<E>>,
}

impl<E: Clock> LinkManager<E> {
    pub fn new(config: Config, registry: Arc<SessionRegistry<E>>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    /// Wrap a raw connection in a [Link] that uses this manager's configuration and sessions.
    ///
    /// Use [Link::status] to observe (or abort) the negotiation before handing the link back to
    /// [LinkManager::accept_incoming] or [LinkManager::create_outgoing].
    pub fn link<Si: Sink, St: Stream>(&self, sink: Si, stream: St) -> Link<E, Si, St> {
        Link::new(self.config.clone(), self.registry.clone(), sink, stream)
    }

    /// Authenticate a connection some peer dialed.
    ///
    /// Fails with [Error::NegotiationRefused] (without reading from the connection) if too many
    /// inbound negotiations are already running.
    pub async fn accept_incoming<R: Rng + CryptoRng, Si: Sink, St: Stream>(
        &self,
        rng: &mut R,
        local: &Authentity,
        link: Link<E, Si, St>,
    ) -> Result<Channel<Si, St>, Error> {
        let _admission = match self.registry.admit() {
            Ok(admission) => admission,
            Err(err) => {
                self.registry.metrics().negotiations_refused.inc();
                debug!("maximum inbound negotiations reached");
                return Err(err);
            }
        };
        link.accept(rng, local).await
    }

    /// Authenticate to `peer` over a connection we dialed.
    pub async fn create_outgoing<R: Rng + CryptoRng, Si: Sink, St: Stream>(
        &self,
        rng: &mut R,
        local: &Authentity,
        peer: &Identity,
        link: Link<E, Si, St>,
    ) -> Result<Channel<Si, St>, Error> {
        link.solicit(rng, local, peer, self.config.safe_resume).await
    }

    /// Evict expired sessions, returning how many were evicted.
    ///
    /// Should be called periodically.
    pub fn cleanup_links(&self) -> usize {
        self.registry.cleanup_links()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<E>> {
        &self.registry
    }

    pub fn metrics(&self) -> &Metrics {
        self.registry.metrics()
    }
}
