//! In-memory connections for testing.
//!
//! Built on [commonware_runtime::mocks::Channel], with two additions: every byte read is counted,
//! and dropping a [Sink] fails any read (pending or later) on the matching [Stream], like closing
//! one side of a socket.

use commonware_macros::select;
use commonware_runtime::{mocks, Error, Sink as _, Stream as _};
use commonware_utils::StableBuf;
use futures::channel::oneshot;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Outbound half of an in-memory connection.
pub struct Sink {
    inner: mocks::Sink,
    _hangup: oneshot::Sender<()>,
}

impl commonware_runtime::Sink for Sink {
    async fn send(&mut self, msg: impl Into<StableBuf> + Send) -> Result<(), Error> {
        self.inner.send(msg).await.map_err(|_| Error::SendFailed)
    }
}

/// Inbound half of an in-memory connection.
pub struct Stream {
    inner: mocks::Stream,
    hangup: oneshot::Receiver<()>,
    closed: bool,
    read: Arc<AtomicUsize>,
}

impl Stream {
    /// Handle reporting the number of bytes read so far.
    pub fn meter(&self) -> Arc<AtomicUsize> {
        self.read.clone()
    }
}

impl commonware_runtime::Stream for Stream {
    async fn recv(&mut self, buf: impl Into<StableBuf> + Send) -> Result<StableBuf, Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        // Bytes already sent are delivered before the hangup is noticed
        let received = select! {
            result = self.inner.recv(buf) => {
                result.map_err(|_| Error::RecvFailed)
            },
            _ = &mut self.hangup => {
                Err(Error::Closed)
            },
        };
        match received {
            Ok(received) => {
                self.read.fetch_add(received.len(), Ordering::Relaxed);
                Ok(received)
            }
            Err(err) => {
                self.closed = true;
                Err(err)
            }
        }
    }
}

/// Create a one-way pipe: bytes sent into the [Sink] come out of the [Stream].
pub fn pipe() -> (Sink, Stream) {
    let (sink, stream) = mocks::Channel::init();
    let (hangup_sender, hangup) = oneshot::channel();
    (
        Sink {
            inner: sink,
            _hangup: hangup_sender,
        },
        Stream {
            inner: stream,
            hangup,
            closed: false,
            read: Arc::new(AtomicUsize::new(0)),
        },
    )
}

/// Create a connected pair of endpoints.
pub fn duplex() -> ((Sink, Stream), (Sink, Stream)) {
    let (a_sink, b_stream) = pipe();
    let (b_sink, a_stream) = pipe();
    ((a_sink, a_stream), (b_sink, b_stream))
}
