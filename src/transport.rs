//! The non-blocking line transport underneath a [`Session`](crate::session::Session).
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("the transport cannot make progress right now")]
    WouldBlock,
    #[error("the transport has been closed")]
    Closed,
}

/// A source and sink of protocol lines.
///
/// Neither operation may block. [`Error::WouldBlock`] from `try_read_line` means no more
/// lines are available right now; from `try_write_line` it means the line was not queued and
/// should be retried later.
pub trait Transport {
    fn try_read_line(&mut self) -> Result<String, Error>;
    fn try_write_line(&mut self, text: &str) -> Result<(), Error>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn try_read_line(&mut self) -> Result<String, Error> {
        (**self).try_read_line()
    }
    fn try_write_line(&mut self, text: &str) -> Result<(), Error> {
        (**self).try_write_line(text)
    }
}

/// The engine end of a pair of bounded single-producer single-consumer queues.
///
/// Both ends may be used from outside of the tokio runtime.
pub struct ChannelTransport {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
}

/// The device end of a [`ChannelTransport`].
pub struct Peer {
    pub inbound: mpsc::Sender<String>,
    pub outbound: mpsc::Receiver<String>,
}

/// Create a connected transport/peer pair, each queue holding up to `capacity` lines.
pub fn channel(capacity: usize) -> (ChannelTransport, Peer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    (
        ChannelTransport { inbound: inbound_rx, outbound: outbound_tx },
        Peer { inbound: inbound_tx, outbound: outbound_rx },
    )
}

impl Transport for ChannelTransport {
    fn try_read_line(&mut self) -> Result<String, Error> {
        self.inbound.try_recv().map_err(|e| match e {
            TryRecvError::Empty => Error::WouldBlock,
            TryRecvError::Disconnected => Error::Closed,
        })
    }

    fn try_write_line(&mut self, text: &str) -> Result<(), Error> {
        self.outbound.try_send(text.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => Error::WouldBlock,
            TrySendError::Closed(_) => Error::Closed,
        })
    }
}

impl Peer {
    /// Queue a line as if the device had sent it. Returns `false` if the queue is full or
    /// the engine end is gone.
    pub fn send_line(&self, line: &str) -> bool {
        self.inbound.try_send(line.to_string()).is_ok()
    }

    /// Everything the engine has written so far.
    pub fn drain_sent(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.outbound.try_recv().ok()).collect()
    }
}
