//! Authenticated duplex channels returned by a ready [crate::Link].

use crate::{
    cipher::{Key, Keystream, IV_LENGTH},
    link::{abortable, recv_exact, Lifecycle, State, Status},
    Error, Identity,
};
use commonware_runtime::{Sink, Stream};
use futures::TryFutureExt as _;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Acknowledgement a resuming responder sends before anything else.
const CONFIRMATION: u8 = 0x00;

/// Keying of the inbound direction.
pub(crate) enum Inbound {
    /// Keyed during the handshake.
    Keyed(Keystream),
    /// The peer's first bytes are the IV of its direction.
    AwaitingIv(Key),
    /// An optimistic resume: the peer's first bytes must acknowledge the session before its IV,
    /// and `evict` forgets the session if they do not.
    AwaitingConfirmation {
        key: Key,
        evict: Box<dyn FnOnce() + Send>,
    },
    /// The inbound direction can never be keyed.
    Failed,
}

/// An authenticated, encrypted connection to a peer.
pub struct Channel<Si: Sink, St: Stream> {
    peer: Identity,
    status: Status,
    sender: Sender<Si>,
    receiver: Receiver<St>,
}

impl<Si: Sink, St: Stream> Channel<Si, St> {
    pub(crate) fn new(
        peer: Identity,
        sink: Si,
        send: Keystream,
        stream: St,
        inbound: Inbound,
        lifecycle: Arc<Lifecycle>,
        closed: watch::Receiver<State>,
    ) -> Self {
        Self {
            peer,
            status: Status::new(&lifecycle),
            sender: Sender {
                sink,
                keystream: send,
                lifecycle: lifecycle.clone(),
                closed: closed.clone(),
            },
            receiver: Receiver {
                stream,
                inbound,
                lifecycle,
                closed,
            },
        }
    }

    /// The authenticated identity of the peer.
    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    /// Handle to observe (or close) this channel from another task.
    pub fn status(&self) -> Status {
        self.status.clone()
    }

    /// Split the channel so each direction can be driven by its own task.
    ///
    /// The channel stays open until both halves are dropped (or it is closed).
    pub fn split(self) -> (Sender<Si>, Receiver<St>) {
        (self.sender, self.receiver)
    }

    /// Close the channel, failing any read or write blocked on it.
    pub fn close(&self) {
        self.sender.lifecycle.close();
    }

    pub async fn send(&mut self, msg: &[u8]) -> Result<(), Error> {
        self.sender.send(msg).await
    }

    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.receiver.recv(buf).await
    }
}

/// The sending half of a [Channel].
pub struct Sender<Si: Sink> {
    sink: Si,
    keystream: Keystream,
    lifecycle: Arc<Lifecycle>,
    closed: watch::Receiver<State>,
}

impl<Si: Sink> Sender<Si> {
    /// Encrypt `buf` in place.
    ///
    /// The result must be sent with [Sender::send_encrypted] before anything else is encrypted
    /// or sent, as the keystream only moves forward.
    pub fn encrypt_bytes(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.keystream.apply(buf)
    }

    /// Send bytes already encrypted with [Sender::encrypt_bytes].
    pub async fn send_encrypted(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.send_raw(buf.to_vec()).await
    }

    /// Encrypt and send `msg`.
    pub async fn send(&mut self, msg: &[u8]) -> Result<(), Error> {
        let mut buf = msg.to_vec();
        self.keystream.apply(&mut buf)?;
        self.send_raw(buf).await
    }

    async fn send_raw(&mut self, buf: Vec<u8>) -> Result<(), Error> {
        abortable(
            &mut self.closed,
            self.sink.send(buf).map_err(Error::Transport),
        )
        .await
        .inspect_err(|_| self.lifecycle.close())
    }
}

/// The receiving half of a [Channel].
pub struct Receiver<St: Stream> {
    stream: St,
    inbound: Inbound,
    lifecycle: Arc<Lifecycle>,
    closed: watch::Receiver<State>,
}

impl<St: Stream> Receiver<St> {
    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        abortable(
            &mut self.closed,
            recv_exact(&mut self.stream, buf).map_err(Error::Transport),
        )
        .await
    }

    /// Key the inbound direction if that has not happened yet.
    ///
    /// Any failure leaves the direction unusable and closes the channel.
    async fn establish(&mut self) -> Result<(), Error> {
        let keystream = match std::mem::replace(&mut self.inbound, Inbound::Failed) {
            Inbound::Keyed(keystream) => Ok(keystream),
            Inbound::AwaitingIv(key) => self.read_iv(&key).await,
            Inbound::AwaitingConfirmation { key, evict } => {
                let result = self.confirm(&key).await;
                if let Err(err) = &result {
                    debug!(?err, "resumed session was not confirmed");
                    evict();
                }
                result
            }
            Inbound::Failed => Err(Error::Closed),
        };
        let keystream = keystream.inspect_err(|_| self.lifecycle.close())?;
        self.inbound = Inbound::Keyed(keystream);
        Ok(())
    }

    async fn read_iv(&mut self, key: &Key) -> Result<Keystream, Error> {
        let mut iv = [0u8; IV_LENGTH];
        self.read_raw(&mut iv).await?;
        Keystream::new(key, &iv)
    }

    async fn confirm(&mut self, key: &Key) -> Result<Keystream, Error> {
        let mut status = [0u8; 1];
        self.read_raw(&mut status).await?;
        if status[0] != CONFIRMATION {
            return Err(Error::AuthenticationFailed("resume not confirmed"));
        }
        let mut keystream = self.read_iv(key).await?;
        let mut confirmation = [0u8; 1];
        self.read_raw(&mut confirmation).await?;
        keystream.apply(&mut confirmation)?;
        if confirmation[0] != CONFIRMATION {
            return Err(Error::AuthenticationFailed("resume not confirmed"));
        }
        Ok(keystream)
    }

    /// Receive exactly `buf.len()` encrypted bytes without decrypting them.
    ///
    /// The bytes must be passed to [Receiver::decrypt_bytes] before anything else is received or
    /// decrypted.
    pub async fn recv_encrypted(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.establish().await?;
        self.read_raw(buf)
            .await
            .inspect_err(|_| self.lifecycle.close())
    }

    /// Decrypt `buf` in place.
    pub fn decrypt_bytes(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        match &mut self.inbound {
            Inbound::Keyed(keystream) => keystream.apply(buf),
            _ => Err(Error::NotReady),
        }
    }

    /// Receive and decrypt exactly `buf.len()` bytes.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.recv_encrypted(buf).await?;
        self.decrypt_bytes(buf)
    }
}
