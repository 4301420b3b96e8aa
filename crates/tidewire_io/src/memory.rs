//! In-process datagram network, for tests and local simulations.
//!
//! A [`MemoryNetwork`] is a set of addresses, each with a queue of incoming
//! datagrams. Sockets bound on the same network can send to each other by
//! address, exactly like UDP sockets on a loopback interface, except that
//! delivery is instant and fully deterministic.
//!
//! ```
//! use tidewire_io::{DatagramSocket, memory::MemoryNetwork};
//!
//! let net = MemoryNetwork::new();
//! let mut a = net.bind("10.0.0.1:1000".parse().unwrap()).unwrap();
//! let mut b = net.bind("10.0.0.2:2000".parse().unwrap()).unwrap();
//!
//! a.send_to(b"hi", b.local_addr().unwrap()).unwrap();
//! let mut buf = [0; 16];
//! let (len, from) = b.recv_from(&mut buf).unwrap().unwrap();
//! assert_eq!(b"hi", &buf[..len]);
//! assert_eq!(a.local_addr().unwrap(), from);
//! ```

use {
    crate::DatagramSocket,
    alloc::{collections::VecDeque, rc::Rc},
    bytes::Bytes,
    core::{cell::RefCell, net::SocketAddr},
    std::{collections::HashMap, io},
    tracing::trace,
};

/// Number of datagrams queued for a socket before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Inboxes {
    queue_capacity: usize,
    sockets: HashMap<SocketAddr, VecDeque<(SocketAddr, Bytes)>>,
}

/// Shared in-memory network which [`MemorySocket`]s bind to.
///
/// Cloning this gives another handle to the same network.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inboxes: Rc<RefCell<Inboxes>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Creates an empty network, queueing up to [`DEFAULT_QUEUE_CAPACITY`]
    /// datagrams per socket.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates an empty network, queueing up to `queue_capacity` datagrams
    /// per socket.
    #[must_use]
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            inboxes: Rc::new(RefCell::new(Inboxes {
                queue_capacity,
                sockets: HashMap::new(),
            })),
        }
    }

    /// Binds a socket to `addr` on this network.
    ///
    /// The address is released when the socket is dropped.
    ///
    /// # Errors
    ///
    /// Errors with [`io::ErrorKind::AddrInUse`] if another socket is already
    /// bound to `addr`.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemorySocket> {
        let mut inboxes = self.inboxes.borrow_mut();
        if inboxes.sockets.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} is already bound"),
            ));
        }
        inboxes.sockets.insert(addr, VecDeque::new());
        Ok(MemorySocket {
            addr,
            inboxes: self.inboxes.clone(),
        })
    }

    /// Gets the number of sockets bound to this network.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inboxes.borrow().sockets.len()
    }

    /// Returns `true` if no sockets are bound to this network.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Socket bound to an address on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemorySocket {
    addr: SocketAddr,
    inboxes: Rc<RefCell<Inboxes>>,
}

impl DatagramSocket for MemorySocket {
    fn send_to(&mut self, packet: &[u8], addr: SocketAddr) -> io::Result<()> {
        let mut inboxes = self.inboxes.borrow_mut();
        let capacity = inboxes.queue_capacity;
        match inboxes.sockets.get_mut(&addr) {
            Some(queue) if queue.len() < capacity => {
                queue.push_back((self.addr, Bytes::copy_from_slice(packet)));
            }
            Some(_) => {
                trace!("Queue of {addr} is full, dropping {} byte datagram", packet.len());
            }
            None => {
                trace!("Nothing bound on {addr}, dropping {} byte datagram", packet.len());
            }
        }
        Ok(())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut inboxes = self.inboxes.borrow_mut();
        let Some((from, packet)) = inboxes
            .sockets
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(Some((len, from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.inboxes.borrow_mut().sockets.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {super::*, assert_matches::assert_matches};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn rebind_after_drop() {
        let net = MemoryNetwork::new();
        let a = net.bind(addr(1)).unwrap();
        assert_matches!(net.bind(addr(1)), Err(err) if err.kind() == io::ErrorKind::AddrInUse);
        drop(a);
        assert!(net.is_empty());
        net.bind(addr(1)).unwrap();
    }

    #[test]
    fn unbound_destination_drops() {
        let net = MemoryNetwork::new();
        let mut a = net.bind(addr(1)).unwrap();
        a.send_to(b"lost", addr(2)).unwrap();
        let mut b = net.bind(addr(2)).unwrap();
        assert_eq!(None, b.recv_from(&mut [0; 8]).unwrap());
    }

    #[test]
    fn full_queue_drops_newest() {
        let net = MemoryNetwork::with_queue_capacity(2);
        let mut a = net.bind(addr(1)).unwrap();
        let mut b = net.bind(addr(2)).unwrap();
        for packet in [b"1", b"2", b"3"] {
            a.send_to(packet, addr(2)).unwrap();
        }
        let mut buf = [0; 8];
        assert_eq!(Some((1, addr(1))), b.recv_from(&mut buf).unwrap());
        assert_eq!(b"1", &buf[..1]);
        assert_eq!(Some((1, addr(1))), b.recv_from(&mut buf).unwrap());
        assert_eq!(b"2", &buf[..1]);
        assert_eq!(None, b.recv_from(&mut buf).unwrap());
    }

    #[test]
    fn truncates_long_datagrams() {
        let net = MemoryNetwork::new();
        let mut a = net.bind(addr(1)).unwrap();
        let mut b = net.bind(addr(2)).unwrap();
        a.send_to(b"abcdef", addr(2)).unwrap();
        let mut buf = [0; 4];
        assert_eq!(Some((4, addr(1))), b.recv_from(&mut buf).unwrap());
        assert_eq!(b"abcd", &buf);
    }
}
