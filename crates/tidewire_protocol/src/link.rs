//! Encrypted packet channel to a single peer, shared by the client and server.

use {
    crate::{
        crypto::SymmetricKey,
        packet::{self, Packet, PacketError},
        replay::ReplayBuffer,
    },
    core::{net::SocketAddr, time::Duration},
    derive_more::{Display, Error},
    tidewire_io::DatagramSocket,
    tracing::{trace, warn},
};

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub(crate) enum LinkError {
    #[display("invalid packet")]
    Packet(PacketError),
    #[display("packet {seq} was replayed")]
    Replayed { seq: u64 },
}

impl From<PacketError> for LinkError {
    fn from(value: PacketError) -> Self {
        Self::Packet(value)
    }
}

/// Keys, replay state and timing of an encrypted connection to `addr`.
///
/// The link does not own its outgoing sequence. Several links may be built
/// from the same connect token over time, so every packet sealed with a
/// token's keys must draw its sequence from one counter which outlives them,
/// otherwise a nonce would be reused.
#[derive(Debug)]
pub(crate) struct Link {
    pub addr: SocketAddr,
    send_key: SymmetricKey,
    recv_key: SymmetricKey,
    application_id: u64,
    replay: ReplayBuffer,
    pub last_sent_at: Duration,
    pub last_recv_at: Duration,
}

impl Link {
    pub fn new(
        addr: SocketAddr,
        send_key: SymmetricKey,
        recv_key: SymmetricKey,
        application_id: u64,
        now: Duration,
    ) -> Self {
        Self {
            addr,
            send_key,
            recv_key,
            application_id,
            replay: ReplayBuffer::new(),
            last_sent_at: now,
            last_recv_at: now,
        }
    }

    /// Seals `packet` with the next sequence from `next_seq` and sends it.
    ///
    /// Socket errors are logged and otherwise ignored, as the packet may just
    /// as well have been lost in transit.
    pub fn send(
        &mut self,
        socket: &mut impl DatagramSocket,
        next_seq: &mut u64,
        packet: &Packet,
        now: Duration,
    ) {
        let seq = *next_seq;
        let sealed = match packet::seal(packet, seq, &self.send_key, self.application_id) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!("Failed to seal {:?} packet: {err}", packet.packet_type());
                return;
            }
        };
        *next_seq += 1;
        if let Err(err) = socket.send_to(&sealed, self.addr) {
            warn!("Failed to send to {}: {err}", self.addr);
        }
        self.last_sent_at = now;
    }

    /// Opens a packet received from the peer.
    ///
    /// Packets which only exist after the handshake are checked against the
    /// replay buffer.
    pub fn open(&mut self, data: &[u8], now: Duration) -> Result<Packet, LinkError> {
        let (seq, packet) = packet::open(data, &self.recv_key, self.application_id)?;
        if matches!(
            packet,
            Packet::KeepAlive | Packet::Payload(_) | Packet::Disconnect
        ) {
            if self.replay.already_received(seq) {
                trace!(seq, "Dropped replayed packet from {}", self.addr);
                return Err(LinkError::Replayed { seq });
            }
            self.replay.advance(seq);
        }
        self.last_recv_at = now;
        Ok(packet)
    }

    /// Time since anything was received from the peer.
    pub const fn idle_for(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_recv_at)
    }

    /// Time since anything was sent to the peer.
    pub const fn quiet_for(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_sent_at)
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {
        super::*,
        assert_matches::assert_matches,
        tidewire_io::memory::MemoryNetwork,
    };

    #[test]
    fn replayed_keepalive_rejected() {
        let net = MemoryNetwork::new();
        let a_addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let mut a_socket = net.bind(a_addr).unwrap();
        let mut b_socket = net.bind(b_addr).unwrap();

        let a_to_b = SymmetricKey::generate();
        let b_to_a = SymmetricKey::generate();
        let mut a = Link::new(b_addr, a_to_b.clone(), b_to_a.clone(), 1, Duration::ZERO);
        let mut b = Link::new(a_addr, b_to_a, a_to_b, 1, Duration::ZERO);

        let mut seq = 0;
        a.send(&mut a_socket, &mut seq, &Packet::KeepAlive, Duration::ZERO);
        assert_eq!(1, seq);
        let mut buf = [0; 64];
        let (len, _) = b_socket.recv_from(&mut buf).unwrap().unwrap();

        let now = Duration::from_secs(1);
        assert_eq!(Ok(Packet::KeepAlive), b.open(&buf[..len], now));
        assert_eq!(now, b.last_recv_at);
        assert_matches!(b.open(&buf[..len], now), Err(LinkError::Replayed { seq: 0 }));
    }

    #[test]
    fn handshake_packets_skip_replay_check() {
        let key = SymmetricKey::generate();
        let addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let mut link = Link::new(addr, key.clone(), key.clone(), 1, Duration::ZERO);
        let sealed = packet::seal(&Packet::Denied, 0, &key, 1).unwrap();
        assert_eq!(Ok(Packet::Denied), link.open(&sealed, Duration::ZERO));
        assert_eq!(Ok(Packet::Denied), link.open(&sealed, Duration::ZERO));
    }
}
