//! See [`UdpDatagramSocket`].

use {
    crate::DatagramSocket,
    core::net::SocketAddr,
    std::{
        io,
        net::{ToSocketAddrs, UdpSocket},
    },
    tracing::debug,
};

/// [`DatagramSocket`] backed by a non-blocking OS UDP socket.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
}

impl UdpDatagramSocket {
    /// Binds a new socket to `addr` and puts it in non-blocking mode.
    ///
    /// Bind to port 0 to let the OS pick a free port.
    ///
    /// # Errors
    ///
    /// Errors if the socket could not be bound or configured.
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        debug!("Bound UDP socket on {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    /// Gets the underlying OS socket.
    #[must_use]
    pub const fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send_to(&mut self, packet: &[u8], addr: SocketAddr) -> io::Result<()> {
        match self.socket.send_to(packet, addr) {
            Ok(_) => Ok(()),
            // the OS send buffer is full, which is the same as losing the packet
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((len, from)) => return Ok(Some((len, from))),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP port unreachable from an earlier send, reported on the
                // next receive on some platforms
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
