#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
//! Datagram IO for `tidewire`.
//!
//! The protocol layer never opens sockets itself. It only talks to something
//! implementing [`DatagramSocket`], which this crate provides a few of:
//! - [`udp::UdpDatagramSocket`]: a non-blocking [`std::net::UdpSocket`]
//! - [`memory::MemoryNetwork`]: an in-process network for tests
//! - [`condition::ConditionedSocket`]: wraps another socket and adds
//!   artificial loss, duplication and latency

extern crate alloc;

pub mod condition;
pub mod memory;
pub mod udp;

use {
    core::{net::SocketAddr, time::Duration},
    std::io,
};

/// Unreliable, unordered, connectionless datagram socket.
///
/// Implementations must never block: if no datagram is available,
/// [`DatagramSocket::recv_from`] returns `Ok(None)`.
pub trait DatagramSocket {
    /// Sends a single datagram to `addr`.
    ///
    /// A datagram which is silently dropped along the way is not an error.
    ///
    /// # Errors
    ///
    /// Errors if the underlying socket failed to send.
    fn send_to(&mut self, packet: &[u8], addr: SocketAddr) -> io::Result<()>;

    /// Receives the next datagram into `buf`, returning its length and the
    /// address it was sent from.
    ///
    /// Datagrams longer than `buf` are truncated.
    ///
    /// # Errors
    ///
    /// Errors if the underlying socket failed to receive.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Gets the address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Errors if the address could not be read from the underlying socket.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Advances any time-dependent state of this socket by `dt`.
    ///
    /// Called once per tick by the protocol layer before receiving.
    fn update(&mut self, dt: Duration) {
        _ = dt;
    }
}

impl<S: DatagramSocket + ?Sized> DatagramSocket for Box<S> {
    fn send_to(&mut self, packet: &[u8], addr: SocketAddr) -> io::Result<()> {
        (**self).send_to(packet, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        (**self).recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn update(&mut self, dt: Duration) {
        (**self).update(dt);
    }
}
