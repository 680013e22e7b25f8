//! Per-connection handshake state machine.

use crate::{
    channel::{Channel, Inbound},
    cipher::{self, Key, Keystream, KEY_HASH_LENGTH},
    identity::{IDENTITY_LENGTH, SEALED_OVERHEAD, SIGNATURE_LENGTH},
    metrics::Metrics,
    mpi, Authentity, Config, Error, Identity, SessionRegistry, SessionToken,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Error as RuntimeError, Sink, Stream};
use futures::TryFutureExt as _;
use rand::{CryptoRng, Rng};
use std::{
    future::Future,
    sync::{Arc, Weak},
};
use tokio::sync::watch;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Protocol version carried in the top bits of every header.
const VERSION: u8 = 1;

/// Bit that must be clear in every header.
const RESERVED: u8 = 0b100;

/// Mask of the mode bits in a header.
const MODE: u8 = 0b11;

/// Sentinel acknowledging a message and signaling that more follows.
const CONTINUE: u8 = 0x00;

/// Sentinel signaling that the sender will not continue.
const HANGUP: u8 = 0xFF;

/// Size of an ephemeral public key (in bytes).
const EPHEMERAL_LENGTH: usize = 32;

/// Size of the initiator's sealed ephemeral key (in bytes).
const TARGET_LENGTH: usize = SEALED_OVERHEAD + EPHEMERAL_LENGTH;

/// Size of a sealed resume request (in bytes).
const RESUME_LENGTH: usize = SEALED_OVERHEAD + KEY_HASH_LENGTH + 1;

/// Info string for session key derivation.
const SESSION_INFO: &[u8] = b"session";

/// Negotiation requested by an initiator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Mode {
    Authenticate = 0,
    Restart = 1,
}

impl Mode {
    fn header(self) -> u8 {
        (VERSION << 3) | self as u8
    }

    fn parse(header: u8) -> Result<Self, Error> {
        if header >> 3 != VERSION {
            return Err(Error::NegotiationFailed("unsupported version"));
        }
        if header & RESERVED != 0 {
            return Err(Error::NegotiationFailed("reserved header bits set"));
        }
        match header & MODE {
            0 => Ok(Self::Authenticate),
            1 => Ok(Self::Restart),
            _ => Err(Error::NegotiationFailed("invalid mode")),
        }
    }
}

/// Lifecycle of a [Link].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    Unauthenticated,
    Negotiating,
    /// Both directions are keyed and the peer is authenticated.
    Ready(Identity),
    Closed,
}

/// Owner of a link's [State].
///
/// Shared by the link (and later, both halves of its [Channel]); the link is closed once the last
/// owner is dropped.
pub(crate) struct Lifecycle {
    state: watch::Sender<State>,
}

impl Lifecycle {
    fn new() -> Arc<Self> {
        let (state, _) = watch::channel(State::Unauthenticated);
        Arc::new(Self { state })
    }

    fn transition(&self, from: impl Fn(&State) -> bool, to: State) -> bool {
        self.state.send_if_modified(|state| {
            if !from(state) {
                return false;
            }
            *state = to;
            true
        })
    }

    fn begin(&self) -> bool {
        self.transition(|state| *state == State::Unauthenticated, State::Negotiating)
    }

    fn ready(&self, peer: Identity) -> bool {
        self.transition(|state| *state == State::Negotiating, State::Ready(peer))
    }

    pub(crate) fn close(&self) {
        self.transition(|state| *state != State::Closed, State::Closed);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run `fut` unless the link is closed first.
pub(crate) async fn abortable<T, F>(closed: &mut watch::Receiver<State>, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    select! {
        _ = closed.wait_for(|state| *state == State::Closed) => {
            Err(Error::Closed)
        },
        result = fut => {
            result
        },
    }
}

/// Fill `buf` from `stream`.
pub(crate) async fn recv_exact<St: Stream>(
    stream: &mut St,
    buf: &mut [u8],
) -> Result<(), RuntimeError> {
    if buf.is_empty() {
        return Ok(());
    }
    let received = stream.recv(vec![0u8; buf.len()]).await?;
    let received: &[u8] = received.as_ref();
    if received.len() != buf.len() {
        return Err(RuntimeError::RecvFailed);
    }
    buf.copy_from_slice(received);
    Ok(())
}

/// Observe (and abort) a [Link] from anywhere.
#[derive(Clone)]
pub struct Status {
    state: watch::Receiver<State>,
    lifecycle: Weak<Lifecycle>,
}

impl Status {
    pub(crate) fn new(lifecycle: &Arc<Lifecycle>) -> Self {
        Self {
            state: lifecycle.subscribe(),
            lifecycle: Arc::downgrade(lifecycle),
        }
    }

    /// Current state of the link.
    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    /// Wait until the link is ready, returning the authenticated peer.
    ///
    /// Any number of callers may wait at once; all of them are woken when the link becomes ready
    /// or closes (which returns [Error::Closed]).
    pub async fn ready(&self) -> Result<Identity, Error> {
        let mut state = self.state.clone();
        let result = state
            .wait_for(|state| matches!(state, State::Ready(_) | State::Closed))
            .await;
        match result.as_deref() {
            Ok(State::Ready(peer)) => Ok(peer.clone()),
            _ => Err(Error::Closed),
        }
    }

    /// Close the link, failing any read or write blocked on it.
    pub fn close(&self) {
        if let Some(lifecycle) = self.lifecycle.upgrade() {
            lifecycle.close();
        }
    }
}

/// Outcome of a resume attempt.
pub(crate) enum ResumeOutcome<T> {
    /// The cached session was reused.
    Resumed(T),
    /// The responder does not recognize the session but the connection is still usable.
    NotApplicable,
    /// The connection must be abandoned.
    Failed(Error),
}

/// How a negotiation keyed the link.
enum Session {
    /// A full handshake agreed on this key. It is cached once the link is ready.
    Fresh(Key),
    /// A cached session was reused.
    Resumed,
}

/// A negotiation that succeeded on the wire.
struct Established {
    peer: Identity,
    inbound: Inbound,
    session: Session,
}

/// Map a transport failure during negotiation.
fn lost(err: RuntimeError) -> Error {
    match err {
        RuntimeError::Timeout => Error::ConnectTimedOut,
        _ => Error::NegotiationFailed("connection lost"),
    }
}

/// Raw connection used while negotiating.
///
/// Writes are buffered until [Handshake::flush]. Once a direction's keystream is installed, every
/// byte crossing that direction is transformed by it.
struct Handshake<Si: Sink, St: Stream> {
    sink: Si,
    stream: St,
    closed: watch::Receiver<State>,

    outbox: Vec<u8>,
    send: Option<Keystream>,
    recv: Option<Keystream>,
}

impl<Si: Sink, St: Stream> Handshake<Si, St> {
    fn new(sink: Si, stream: St, closed: watch::Receiver<State>) -> Self {
        Self {
            sink,
            stream,
            closed,
            outbox: Vec::new(),
            send: None,
            recv: None,
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let start = self.outbox.len();
        self.outbox.extend_from_slice(bytes);
        if let Some(keystream) = &mut self.send {
            keystream.apply(&mut self.outbox[start..])?;
        }
        Ok(())
    }

    fn write_u8(&mut self, value: u8) -> Result<(), Error> {
        self.write(&[value])
    }

    fn write_mpi(&mut self, value: &[u8]) -> Result<(), Error> {
        let mut encoded = Vec::with_capacity(mpi::encoded_len(value));
        mpi::encode(value, &mut encoded);
        self.write(&encoded)
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        let outbox = std::mem::take(&mut self.outbox);
        abortable(&mut self.closed, self.sink.send(outbox).map_err(lost)).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        abortable(
            &mut self.closed,
            recv_exact(&mut self.stream, buf).map_err(lost),
        )
        .await?;
        if let Some(keystream) = &mut self.recv {
            keystream.apply(buf)?;
        }
        Ok(())
    }

    async fn read_u8(&mut self) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    async fn read_mpi<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut prefix = [0u8; mpi::PREFIX_LENGTH];
        self.read_exact(&mut prefix).await?;
        let len = mpi::magnitude_len::<N>(prefix)?;
        let mut magnitude = [0u8; N];
        self.read_exact(&mut magnitude[..len]).await?;
        mpi::decode::<N>(prefix, &magnitude[..len])
    }

    /// Key our direction: queue a fresh IV (in the clear), then encrypt everything after it.
    fn install_send<R: Rng + CryptoRng>(&mut self, rng: &mut R, key: &Key) -> Result<(), Error> {
        let iv = cipher::iv(rng);
        self.write(&iv)?;
        self.send = Some(Keystream::new(key, &iv)?);
        Ok(())
    }

    /// Key the peer's direction from the IV it sends (in the clear).
    async fn install_recv(&mut self, key: &Key) -> Result<(), Error> {
        let mut iv = [0u8; cipher::IV_LENGTH];
        self.read_exact(&mut iv).await?;
        self.recv = Some(Keystream::new(key, &iv)?);
        Ok(())
    }
}

/// A raw connection that has not yet been authenticated.
///
/// Consumed by [Link::solicit] or [Link::accept], which return a [Channel] once both sides are
/// authenticated and both directions are keyed. Either fails with [Error::ConnectTimedOut] if the
/// negotiation outlasts [Config::negotiation_timeout].
pub struct Link<E: Clock, Si: Sink, St: Stream> {
    config: Arc<Config>,
    registry: Arc<SessionRegistry<E>>,
    lifecycle: Arc<Lifecycle>,
    sink: Si,
    stream: St,
}

impl<E: Clock, Si: Sink, St: Stream> Link<E, Si, St> {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry<E>>,
        sink: Si,
        stream: St,
    ) -> Self {
        Self {
            config,
            registry,
            lifecycle: Lifecycle::new(),
            sink,
            stream,
        }
    }

    /// Handle to wait for (or abort) this link from another task.
    pub fn status(&self) -> Status {
        Status::new(&self.lifecycle)
    }

    /// Authenticate to `peer`, resuming a cached session if one exists.
    ///
    /// With `safe` set, a resume attempt waits for the peer to recognize the session and falls
    /// back to a full handshake if it does not. Without it, data is sent optimistically and a
    /// lost session is reported by the first read on the returned [Channel].
    pub async fn solicit<R: Rng + CryptoRng>(
        self,
        rng: &mut R,
        local: &Authentity,
        peer: &Identity,
        safe: bool,
    ) -> Result<Channel<Si, St>, Error> {
        if peer == local.identity() {
            return Err(Error::DialSelf);
        }
        let context = self.registry.context().clone();
        let deadline = context.current() + self.config.negotiation_timeout;
        let (mut negotiation, lifecycle) = self.begin(local);
        let result = select! {
            _ = context.sleep_until(deadline) => {
                Err(Error::ConnectTimedOut)
            },
            result = negotiation.solicit(rng, peer, safe) => {
                result
            },
        };
        negotiation.finish(lifecycle, result)
    }

    /// Authenticate whichever peer dialed us.
    pub async fn accept<R: Rng + CryptoRng>(
        self,
        rng: &mut R,
        local: &Authentity,
    ) -> Result<Channel<Si, St>, Error> {
        let context = self.registry.context().clone();
        let deadline = context.current() + self.config.negotiation_timeout;
        let (mut negotiation, lifecycle) = self.begin(local);
        let result = select! {
            _ = context.sleep_until(deadline) => {
                Err(Error::ConnectTimedOut)
            },
            result = negotiation.accept(rng) => {
                result
            },
        };
        negotiation.finish(lifecycle, result)
    }

    fn begin(self, local: &Authentity) -> (Negotiation<'_, E, Si, St>, Arc<Lifecycle>) {
        self.lifecycle.begin();
        let handshake = Handshake::new(self.sink, self.stream, self.lifecycle.subscribe());
        (
            Negotiation {
                config: self.config,
                registry: self.registry,
                local,
                handshake,
            },
            self.lifecycle,
        )
    }
}

/// State of one negotiation.
struct Negotiation<'a, E: Clock, Si: Sink, St: Stream> {
    config: Arc<Config>,
    registry: Arc<SessionRegistry<E>>,
    local: &'a Authentity,
    handshake: Handshake<Si, St>,
}

impl<E: Clock, Si: Sink, St: Stream> Negotiation<'_, E, Si, St> {
    fn metrics(&self) -> &Metrics {
        self.registry.metrics()
    }

    /// Hand over the receive keystream installed during the handshake.
    fn keyed(&mut self) -> Result<Inbound, Error> {
        self.handshake
            .recv
            .take()
            .map(Inbound::Keyed)
            .ok_or(Error::NotReady)
    }

    fn namespace(&self) -> &[u8] {
        &self.config.namespace
    }

    /// Mark the link ready and, only then, cache a freshly agreed key.
    fn finish(
        self,
        lifecycle: Arc<Lifecycle>,
        result: Result<Established, Error>,
    ) -> Result<Channel<Si, St>, Error> {
        let registry = self.registry;
        let failed = |err: Error| {
            debug!(?err, "negotiation failed");
            registry.metrics().negotiation_failures.inc();
            lifecycle.close();
            err
        };
        let Established {
            peer,
            inbound,
            session,
        } = result.map_err(failed)?;
        let Handshake {
            sink,
            stream,
            closed,
            send,
            ..
        } = self.handshake;
        let Some(send) = send else {
            return Err(failed(Error::NotReady));
        };
        if !lifecycle.ready(peer.clone()) {
            return Err(failed(Error::Closed));
        }
        match session {
            Session::Fresh(key) => {
                registry.add_link(peer.clone(), self.local.identity().clone(), key);
                registry.metrics().full_handshakes.inc();
                debug!(?peer, "established link");
            }
            Session::Resumed => {
                registry.metrics().resumes.inc();
                debug!(?peer, "resumed link");
            }
        }
        Ok(Channel::new(peer, sink, send, stream, inbound, lifecycle, closed))
    }

    async fn solicit<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        peer: &Identity,
        safe: bool,
    ) -> Result<Established, Error> {
        // A token is only usable if it has not been disposed of
        let cached = self
            .registry
            .search_outbound_links(self.local.identity(), peer)
            .and_then(|token| token.key().map(|key| (token, key)));
        if let Some((token, key)) = cached {
            match self.try_resume_initiator(rng, &token, key, safe).await {
                ResumeOutcome::Resumed(inbound) => {
                    return Ok(Established {
                        peer: peer.clone(),
                        inbound,
                        session: Session::Resumed,
                    });
                }
                ResumeOutcome::NotApplicable => {
                    debug!(?peer, "session not recognized, falling back to full handshake");
                    self.registry.remove_link(&token);
                    self.metrics().resume_fallbacks.inc();
                }
                ResumeOutcome::Failed(err) => {
                    if matches!(err, Error::AuthenticationFailed(_)) {
                        self.registry.remove_link(&token);
                    }
                    return Err(err);
                }
            }
        }
        let key = self.full_initiator(rng, peer).await?;
        Ok(Established {
            peer: peer.clone(),
            inbound: self.keyed()?,
            session: Session::Fresh(key),
        })
    }

    async fn accept<R: Rng + CryptoRng>(&mut self, rng: &mut R) -> Result<Established, Error> {
        let mut declined = false;
        loop {
            let mode = Mode::parse(self.handshake.read_u8().await?)?;
            match mode {
                Mode::Authenticate => {
                    let (peer, key) = self.full_responder(rng).await?;
                    return Ok(Established {
                        peer,
                        inbound: self.keyed()?,
                        session: Session::Fresh(key),
                    });
                }
                Mode::Restart if declined => {
                    return Err(Error::NegotiationFailed("repeated resume attempt"));
                }
                Mode::Restart => match self.try_resume_responder(rng).await {
                    ResumeOutcome::Resumed((peer, inbound)) => {
                        return Ok(Established {
                            peer,
                            inbound,
                            session: Session::Resumed,
                        });
                    }
                    ResumeOutcome::NotApplicable => {
                        debug!("declined resume, awaiting full handshake");
                        declined = true;
                    }
                    ResumeOutcome::Failed(err) => return Err(err),
                },
            }
        }
    }

    /// Agree on an ephemeral key with the peer, rejecting low-order points.
    fn agree(&self, secret: EphemeralSecret, peer: &[u8; EPHEMERAL_LENGTH]) -> Result<Key, Error> {
        self.metrics().key_agreements.inc();
        let shared = secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return Err(Error::AuthenticationFailed("non-contributory key agreement"));
        }
        Ok(shared.to_bytes().into())
    }

    fn session_key(&self, shared: &Key, transcript: &[u8]) -> Result<Key, Error> {
        cipher::derive(
            shared.as_slice(),
            self.namespace(),
            &[transcript],
            SESSION_INFO,
        )
    }

    /// Run the initiator's side of a full handshake, returning the agreed key.
    async fn full_initiator<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        peer: &Identity,
    ) -> Result<Key, Error> {
        // Send our ephemeral key, sealed to the peer to prove we know who we are talking to
        let secret = EphemeralSecret::random_from_rng(&mut *rng);
        let ephemeral = PublicKey::from(&secret).to_bytes();
        let target = peer.encrypt_to(rng, self.namespace(), &ephemeral)?;
        self.metrics().asymmetric_encryptions.inc();
        self.handshake.write_u8(Mode::Authenticate.header())?;
        self.handshake.write_mpi(&ephemeral)?;
        self.handshake.write_mpi(&target)?;
        self.handshake.flush().await?;

        // Read the responder's ephemeral key and check that the peer signed it (a responder that
        // rejects us stays silent, so only CONTINUE is valid here)
        if self.handshake.read_u8().await? != CONTINUE {
            return Err(Error::NegotiationFailed("unexpected sentinel"));
        }
        let responder = self.handshake.read_mpi::<EPHEMERAL_LENGTH>().await?;
        let signature = self.handshake.read_mpi::<SIGNATURE_LENGTH>().await?;
        let transcript = cipher::digest(&[&ephemeral, &responder]);
        self.metrics().verifications.inc();
        if !peer.verify(self.namespace(), &transcript, &signature) {
            return Err(Error::AuthenticationFailed("invalid responder signature"));
        }
        let shared = self.agree(secret, &responder)?;
        let key = self.session_key(&shared, &transcript)?;

        // Reveal our identity only under the session key
        let identity = self.local.identity().as_bytes();
        let binding = cipher::digest(&[identity, &ephemeral, &responder]);
        let signature = self.local.sign(self.namespace(), &binding);
        self.metrics().signatures.inc();
        self.handshake.install_send(rng, &key)?;
        self.handshake.write_mpi(identity)?;
        self.handshake.write_mpi(signature.as_ref())?;
        self.handshake.flush().await?;

        // The responder only keys its direction once it has accepted us
        self.handshake.install_recv(&key).await?;
        Ok(key)
    }

    /// Run the responder's side of a full handshake, returning the initiator and the agreed key.
    async fn full_responder<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<(Identity, Key), Error> {
        let initiator = self.handshake.read_mpi::<EPHEMERAL_LENGTH>().await?;
        let target = self.handshake.read_mpi::<TARGET_LENGTH>().await?;

        // Stay silent unless the initiator sealed its ephemeral key to us
        if self.config.check_target {
            self.metrics().asymmetric_decryptions.inc();
            let opened = self.local.decrypt(self.namespace(), &target);
            if !opened.is_ok_and(|opened| opened == initiator) {
                return Err(Error::AuthenticationFailed("handshake not addressed to us"));
            }
        }

        // Answer with our own ephemeral key, signed
        let secret = EphemeralSecret::random_from_rng(&mut *rng);
        let ephemeral = PublicKey::from(&secret).to_bytes();
        let shared = self.agree(secret, &initiator)?;
        let transcript = cipher::digest(&[&initiator, &ephemeral]);
        let key = self.session_key(&shared, &transcript)?;
        let signature = self.local.sign(self.namespace(), &transcript);
        self.metrics().signatures.inc();
        self.handshake.write_u8(CONTINUE)?;
        self.handshake.write_mpi(&ephemeral)?;
        self.handshake.write_mpi(signature.as_ref())?;
        self.handshake.flush().await?;

        // Learn (and authenticate) the initiator
        self.handshake.install_recv(&key).await?;
        let identity = self.handshake.read_mpi::<IDENTITY_LENGTH>().await?;
        let peer = Identity::decode(identity)?;
        if &peer == self.local.identity() {
            return Err(Error::AuthenticationFailed("peer uses our identity"));
        }
        let signature = self.handshake.read_mpi::<SIGNATURE_LENGTH>().await?;
        let binding = cipher::digest(&[&identity, &initiator, &ephemeral]);
        self.metrics().verifications.inc();
        if !peer.verify(self.namespace(), &binding, &signature) {
            return Err(Error::AuthenticationFailed("invalid initiator signature"));
        }

        // Key our direction to signal acceptance
        self.handshake.install_send(rng, &key)?;
        self.handshake.flush().await?;
        Ok((peer, key))
    }

    async fn try_resume_initiator<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        token: &Arc<SessionToken>,
        key: Key,
        safe: bool,
    ) -> ResumeOutcome<Inbound> {
        self.resume_initiator(rng, token, key, safe)
            .await
            .unwrap_or_else(ResumeOutcome::Failed)
    }

    async fn resume_initiator<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        token: &Arc<SessionToken>,
        key: Key,
        safe: bool,
    ) -> Result<ResumeOutcome<Inbound>, Error> {
        let mut request = [0u8; KEY_HASH_LENGTH + 1];
        request[..KEY_HASH_LENGTH].copy_from_slice(token.key_hash());
        request[KEY_HASH_LENGTH] = safe as u8;
        let sealed = token.peer().encrypt_to(rng, self.namespace(), &request)?;
        self.metrics().asymmetric_encryptions.inc();
        self.handshake.write_u8(Mode::Restart.header())?;
        self.handshake.write_mpi(&sealed)?;

        if !safe {
            // Start sending right away and check the acknowledgement on the first read
            self.handshake.install_send(rng, &key)?;
            self.handshake.flush().await?;
            let registry = self.registry.clone();
            let token = token.clone();
            return Ok(ResumeOutcome::Resumed(Inbound::AwaitingConfirmation {
                key,
                evict: Box::new(move || {
                    registry.remove_link(&token);
                }),
            }));
        }

        self.handshake.flush().await?;
        match self.handshake.read_u8().await? {
            CONTINUE => {}
            HANGUP => return Ok(ResumeOutcome::NotApplicable),
            _ => return Err(Error::NegotiationFailed("unexpected sentinel")),
        }
        self.handshake.install_recv(&key).await?;
        if self.handshake.read_u8().await? != CONTINUE {
            return Err(Error::AuthenticationFailed("resume not confirmed"));
        }
        self.handshake.install_send(rng, &key)?;
        self.handshake.flush().await?;
        Ok(ResumeOutcome::Resumed(self.keyed()?))
    }

    async fn try_resume_responder<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> ResumeOutcome<(Identity, Inbound)> {
        self.resume_responder(rng)
            .await
            .unwrap_or_else(ResumeOutcome::Failed)
    }

    async fn resume_responder<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ResumeOutcome<(Identity, Inbound)>, Error> {
        let sealed = self.handshake.read_mpi::<RESUME_LENGTH>().await?;
        self.metrics().asymmetric_decryptions.inc();
        let request = self.local.decrypt(self.namespace(), &sealed)?;
        let (key_hash, flag) = match request.as_slice() {
            [key_hash @ .., flag] if key_hash.len() == KEY_HASH_LENGTH => (key_hash, *flag),
            _ => return Err(Error::NegotiationFailed("malformed resume request")),
        };
        let safe = match flag {
            0 => false,
            1 => true,
            _ => return Err(Error::NegotiationFailed("malformed resume request")),
        };

        let mut lookup = [0u8; KEY_HASH_LENGTH];
        lookup.copy_from_slice(key_hash);
        let cached = self
            .registry
            .search_inbound_links(self.local.identity(), &lookup)
            .and_then(|token| token.key().map(|key| (token, key)));
        let Some((token, key)) = cached else {
            if !safe {
                return Err(Error::NegotiationFailed("unknown session"));
            }
            self.handshake.write_u8(HANGUP)?;
            self.handshake.flush().await?;
            return Ok(ResumeOutcome::NotApplicable);
        };

        // The plaintext sentinel must precede everything else we send
        self.handshake.write_u8(CONTINUE)?;
        self.handshake.install_send(rng, &key)?;
        self.handshake.write_u8(CONTINUE)?;
        self.handshake.flush().await?;
        Ok(ResumeOutcome::Resumed((
            token.peer().clone(),
            Inbound::AwaitingIv(key),
        )))
    }
}
