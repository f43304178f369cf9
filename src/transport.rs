//! Async transport primitives: a shared [`Context`] and an [`AsyncSocket`]
//! wrapper that lets the synchronous `zmq` crate's sockets be awaited from
//! tokio tasks instead of blocking a worker thread.
//!
//! Grounded in `other_examples/c00a19f9_clchiou-garage__rust-g1-zmq-src-lib.rs.rs`:
//! the socket's raw `ZMQ_FD` is registered with [`tokio::io::unix::AsyncFd`],
//! and `DONTWAIT` operations that come back `EAGAIN` await the fd becoming
//! readable before retrying, rather than spawning a dedicated OS thread per
//! socket (design note, §5).

use std::os::fd::{AsRawFd, RawFd};

use thiserror::Error;
use tokio::io::unix::AsyncFd;
use zmq::DONTWAIT;

/// Transport-layer errors: everything that can go wrong registering a raw fd
/// with the reactor or talking to the underlying `zmq::Socket`.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Registering the socket's `ZMQ_FD` with the tokio reactor failed.
    #[error("failed to register socket with async reactor: {0}")]
    ReactorRegistration(#[source] std::io::Error),

    /// The underlying `zmq` call failed.
    #[error(transparent)]
    Zmq(#[from] zmq::Error),
}

/// A shared libzmq context. Cheap to clone; all sockets in a process should
/// share one.
#[derive(Clone)]
pub struct Context(zmq::Context);

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A fresh context with the default I/O thread pool size.
    pub fn new() -> Self {
        Self(zmq::Context::new())
    }

    /// Open a socket of the given type on this context.
    ///
    /// # Errors
    ///
    /// Returns an error if libzmq cannot allocate the socket.
    pub fn socket(&self, socket_type: zmq::SocketType) -> Result<zmq::Socket, zmq::Error> {
        self.0.socket(socket_type)
    }
}

/// An async-capable wrapper around a `zmq::Socket`, driven by the tokio
/// reactor instead of a blocking call.
pub struct AsyncSocket {
    socket: zmq::Socket,
    fd: AsyncFd<RawFd>,
}

impl AsyncSocket {
    /// Wrap an already-configured `zmq::Socket` (bound/connected, security
    /// options applied) for async use.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket's raw fd cannot be registered with the
    /// tokio reactor.
    pub fn new(socket: zmq::Socket) -> Result<Self, TransportError> {
        let fd = AsyncFd::new(socket.as_raw_fd()).map_err(TransportError::ReactorRegistration)?;
        Ok(Self { socket, fd })
    }

    /// Receive one message frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying receive fails for a reason other
    /// than `EAGAIN`.
    pub async fn recv_bytes(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut message = zmq::Message::new();
        loop {
            match self.socket.recv(&mut message, DONTWAIT) {
                Err(zmq::Error::EAGAIN) => {
                    self.fd
                        .readable()
                        .await
                        .map_err(TransportError::ReactorRegistration)?
                        .clear_ready();
                }
                Ok(()) => return Ok(message.to_vec()),
                Err(e) => return Err(TransportError::from(e)),
            }
        }
    }

    /// Receive all frames of a multipart message.
    ///
    /// # Errors
    ///
    /// Returns an error if any constituent receive fails.
    pub async fn recv_multipart(&mut self) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut parts = vec![self.recv_bytes().await?];
        while self
            .socket
            .get_rcvmore()
            .map_err(TransportError::from)?
        {
            parts.push(self.recv_bytes().await?);
        }
        Ok(parts)
    }

    /// Send one message frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying send fails for a reason other
    /// than `EAGAIN`.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.send_with_more(bytes, false).await
    }

    /// Send one frame of a multipart message; `more` announces additional
    /// frames are coming.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying send fails for a reason other
    /// than `EAGAIN`.
    pub async fn send_with_more(&mut self, bytes: &[u8], more: bool) -> Result<(), TransportError> {
        loop {
            let flags = DONTWAIT | if more { zmq::SNDMORE } else { 0 };
            match self.socket.send(bytes, flags) {
                Err(zmq::Error::EAGAIN) => {
                    self.fd
                        .readable()
                        .await
                        .map_err(TransportError::ReactorRegistration)?
                        .clear_ready();
                }
                result => return result.map_err(TransportError::from),
            }
        }
    }

    /// Send every frame of a multipart message, setting `SNDMORE` on all
    /// but the last.
    ///
    /// # Errors
    ///
    /// Returns an error if any constituent send fails.
    pub async fn send_multipart(&mut self, parts: &[Vec<u8>]) -> Result<(), TransportError> {
        let Some((last, init)) = parts.split_last() else {
            return Ok(());
        };
        for part in init {
            self.send_with_more(part, true).await?;
        }
        self.send_with_more(last, false).await
    }

    /// Borrow the inner socket to call options or bind/connect directly.
    pub fn socket(&self) -> &zmq::Socket {
        &self.socket
    }

    /// Mutably borrow the inner socket.
    pub fn socket_mut(&mut self) -> &mut zmq::Socket {
        &mut self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_sockets_exchange_a_message() {
        let ctx = Context::new();
        let server = ctx.socket(zmq::PAIR).unwrap();
        server.bind("inproc://transport-test").unwrap();
        let client = ctx.socket(zmq::PAIR).unwrap();
        client.connect("inproc://transport-test").unwrap();

        let mut server = AsyncSocket::new(server).unwrap();
        let mut client = AsyncSocket::new(client).unwrap();

        client.send(b"hello").await.unwrap();
        let received = server.recv_bytes().await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn multipart_round_trips_all_frames_in_order() {
        let ctx = Context::new();
        let server = ctx.socket(zmq::PAIR).unwrap();
        server.bind("inproc://transport-multipart-test").unwrap();
        let client = ctx.socket(zmq::PAIR).unwrap();
        client.connect("inproc://transport-multipart-test").unwrap();

        let mut server = AsyncSocket::new(server).unwrap();
        let mut client = AsyncSocket::new(client).unwrap();

        client
            .send_multipart(&[b"part1".to_vec(), b"part2".to_vec(), b"part3".to_vec()])
            .await
            .unwrap();
        let received = server.recv_multipart().await.unwrap();
        assert_eq!(
            received,
            vec![b"part1".to_vec(), b"part2".to_vec(), b"part3".to_vec()]
        );
    }
}
