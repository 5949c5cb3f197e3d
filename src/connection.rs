//! Datagram links between the two ends of a transfer.
//!
//! The engines never touch a socket directly; they talk to one peer through a
//! [`PeerLink`]. The client uses a [`UdpLink`] over its own connected socket,
//! while each server session uses a [`SessionLink`] that shares the listening
//! socket and is fed inbound datagrams by the dispatcher.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc,
        mpsc::{Receiver, RecvTimeoutError},
    },
    time::Duration,
};

use crate::transport::MAX_DATAGRAM;

/// A send/receive-datagram channel to a single peer.
pub trait PeerLink {
    /// Sends one datagram to the peer.
    fn send(&mut self, datagram: &[u8]) -> io::Result<()>;

    /// Waits up to `timeout` for the next datagram from the peer.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a datagram.
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;

    /// Address of the remote end.
    fn peer(&self) -> SocketAddr;

    /// Marks the end of inbound traffic for this exchange.
    ///
    /// Engines call this right before their final packet (FIN or ERR), so
    /// anything the peer sends after seeing that packet is no longer routed
    /// here. Calling it more than once is harmless.
    fn close(&mut self) {}
}

impl<L: PeerLink + ?Sized> PeerLink for &mut L {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        (**self).send(datagram)
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        (**self).recv(timeout)
    }

    fn peer(&self) -> SocketAddr {
        (**self).peer()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Client side link over a socket connected to the server.
///
/// A connected UDP socket only delivers datagrams from its peer, so stray
/// traffic from other hosts never reaches the engine.
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
    buffer: Vec<u8>,
}

impl UdpLink {
    /// Binds an ephemeral socket of the peer's address family and connects it.
    pub fn connect(peer: SocketAddr) -> io::Result<Self> {
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(peer)?;
        Ok(Self {
            socket,
            peer,
            buffer: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl PeerLink for UdpLink {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        // A zero read timeout is rejected by the OS layer.
        if timeout.is_zero() {
            return Ok(None);
        }
        self.socket.set_read_timeout(Some(timeout))?;

        match self.socket.recv(&mut self.buffer) {
            Ok(len) => Ok(Some(self.buffer[..len].to_vec())),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Server side link for one session.
///
/// Outbound datagrams go through the shared listening socket. Inbound ones
/// are pushed into `inbox` by the dispatcher, which owns the only reader of
/// that socket. `on_close` runs once, on the first [`PeerLink::close`] or on
/// drop, and unregisters the session from the dispatcher.
pub struct SessionLink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbox: Receiver<Vec<u8>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl SessionLink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, inbox: Receiver<Vec<u8>>) -> Self {
        Self {
            socket,
            peer,
            inbox,
            on_close: None,
        }
    }

    /// Registers the hook run when the session stops accepting datagrams.
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

impl Drop for SessionLink {
    fn drop(&mut self) {
        PeerLink::close(self);
    }
}

impl PeerLink for SessionLink {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.peer)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(datagram) => Ok(Some(datagram)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session inbox closed by dispatcher",
            )),
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn close(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

/// Whether an I/O error is a read timeout (reported differently per platform).
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
