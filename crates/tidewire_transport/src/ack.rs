//! Per-packet acknowledgement tracking.
//!
//! Every packet sent through an [`AckSystem`] is prefixed with an
//! [`AckHeader`], which tells the peer:
//! - the sequence number of this packet
//! - the newest sequence number we have received from them
//! - a 32-bit bitfield of which of the 32 sequences up to and including that
//!   one we have received
//!
//! Because every outgoing packet repeats the last 32 acknowledgements, an ack
//! only gets lost if 32 packets in a row carrying it are lost. The ack system
//! uses acknowledgements to estimate round-trip time and packet loss, and
//! reports newly acked sequences so that higher layers (see
//! [`transport`](crate::transport)) can release whatever those packets
//! carried.

use {
    crate::{
        MAX_PACKET_LEN,
        seq::PacketSeq,
        seq_buf::{self, SeqBuf},
    },
    alloc::{format, vec::Vec},
    core::{convert::Infallible, fmt, num::Saturating, time::Duration},
    derive_more::{Add, AddAssign, Display, Error, Sub, SubAssign},
    octs::{BufTooShortOr, Bytes, Decode, Encode, FixedEncodeLen, Read, Write},
    tracing::trace,
};

/// Header prepended to every packet sent through an [`AckSystem`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct AckHeader {
    /// Sequence number of this packet.
    pub seq: PacketSeq,
    /// Newest sequence number received from the peer so far.
    pub ack: PacketSeq,
    /// Bit `i` is set if the sender has received `ack - i`.
    pub ack_bits: u32,
}

impl AckHeader {
    /// Iterates over every packet sequence this header acknowledges.
    ///
    /// `ack` itself is only acknowledged if bit 0 is set.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tidewire_transport::{ack::AckHeader, seq::PacketSeq};
    /// let header = AckHeader {
    ///     seq: PacketSeq::new(0),
    ///     ack: PacketSeq::new(50),
    ///     ack_bits: 0b0010010,
    /// };
    /// let mut iter = header.acked_seqs();
    /// assert_eq!(Some(PacketSeq::new(49)), iter.next());
    /// assert_eq!(Some(PacketSeq::new(46)), iter.next());
    /// assert_eq!(None, iter.next());
    /// ```
    pub fn acked_seqs(self) -> impl Iterator<Item = PacketSeq> {
        (0..32u16).filter_map(move |bit_index| {
            if self.ack_bits & shl(1, u32::from(bit_index)) == 0 {
                None
            } else {
                Some(self.ack - PacketSeq::new(bit_index))
            }
        })
    }
}

fn shl(n: u32, by: u32) -> u32 {
    // if None, then `rhs >= 32`
    // so all the bits get moved out anyway
    n.checked_shl(by).unwrap_or_default()
}

impl fmt::Debug for AckHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AckHeader")
            .field("seq", &self.seq)
            .field("ack", &self.ack)
            .field("ack_bits", &format!("{:032b}", self.ack_bits))
            .finish()
    }
}

impl FixedEncodeLen for AckHeader {
    const ENCODE_LEN: usize = PacketSeq::ENCODE_LEN + PacketSeq::ENCODE_LEN + u32::ENCODE_LEN;
}

impl Encode for AckHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.seq)?;
        dst.write(&self.ack)?;
        dst.write(&self.ack_bits)?;
        Ok(())
    }
}

impl Decode for AckHeader {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            seq: src.read()?,
            ack: src.read()?,
            ack_bits: src.read()?,
        })
    }
}

/// Configuration for an [`AckSystem`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AckConfig {
    /// Largest payload, not including the [`AckHeader`], which can be sent or
    /// received.
    ///
    /// Together with the header this must not exceed [`MAX_PACKET_LEN`].
    ///
    /// Default: [`MAX_PACKET_LEN`] minus the header.
    pub max_packet_size: usize,
    /// Number of acks the drainable ack list reserves space for up front.
    ///
    /// Default: 256.
    pub initial_ack_capacity: usize,
    /// Number of sent packets tracked while waiting for an ack.
    ///
    /// Must be a power of two no larger than 32768.
    ///
    /// Default: 256.
    pub sent_packets_capacity: usize,
    /// Number of received packets remembered for building acks.
    ///
    /// Must be a power of two no larger than 32768.
    ///
    /// Default: 256.
    pub received_packets_capacity: usize,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_LEN - AckHeader::ENCODE_LEN,
            initial_ack_capacity: 256,
            sent_packets_capacity: 256,
            received_packets_capacity: 256,
        }
    }
}

impl AckConfig {
    /// Sets [`AckConfig::max_packet_size`].
    #[must_use]
    pub const fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Sets [`AckConfig::sent_packets_capacity`].
    #[must_use]
    pub const fn with_sent_packets_capacity(mut self, capacity: usize) -> Self {
        self.sent_packets_capacity = capacity;
        self
    }

    /// Sets [`AckConfig::received_packets_capacity`].
    #[must_use]
    pub const fn with_received_packets_capacity(mut self, capacity: usize) -> Self {
        self.received_packets_capacity = capacity;
        self
    }

    /// Checks that this config can be used to build an [`AckSystem`].
    ///
    /// # Errors
    ///
    /// Errors if any of the values are out of range.
    pub const fn validate(&self) -> Result<(), AckConfigError> {
        if self.max_packet_size == 0
            || self.max_packet_size.saturating_add(AckHeader::ENCODE_LEN) > MAX_PACKET_LEN
        {
            return Err(AckConfigError::MaxPacketSize {
                len: self.max_packet_size,
            });
        }
        if !seq_buf::is_valid_capacity(self.sent_packets_capacity) {
            return Err(AckConfigError::SentCapacity {
                capacity: self.sent_packets_capacity,
            });
        }
        if !seq_buf::is_valid_capacity(self.received_packets_capacity) {
            return Err(AckConfigError::ReceivedCapacity {
                capacity: self.received_packets_capacity,
            });
        }
        Ok(())
    }
}

/// [`AckConfig`] has an out-of-range value.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum AckConfigError {
    /// [`AckConfig::max_packet_size`] is zero or too large.
    #[display("max packet size {len} is zero or leaves no room for the header")]
    MaxPacketSize {
        /// Configured size.
        len: usize,
    },
    /// [`AckConfig::sent_packets_capacity`] is not a valid sequence buffer
    /// capacity.
    #[display("sent packets capacity {capacity} is not a power of two up to 32768")]
    SentCapacity {
        /// Configured capacity.
        capacity: usize,
    },
    /// [`AckConfig::received_packets_capacity`] is not a valid sequence buffer
    /// capacity.
    #[display("received packets capacity {capacity} is not a power of two up to 32768")]
    ReceivedCapacity {
        /// Configured capacity.
        capacity: usize,
    },
}

/// Packet counters of an [`AckSystem`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)] // force `#[derive]` on multiple lines
#[derive(Add, AddAssign, Sub, SubAssign)]
pub struct AckStats {
    /// Packets handed to the send callback.
    pub packets_sent: Saturating<u64>,
    /// Packets passed into [`AckSystem::receive_packet`] which were not too
    /// large.
    pub packets_received: Saturating<u64>,
    /// Sent packets which the peer acknowledged.
    pub packets_acked: Saturating<u64>,
    /// Received packets dropped because their sequence was too old.
    pub packets_stale: Saturating<u64>,
    /// Received packets dropped because they were too short to hold a header.
    pub packets_invalid: Saturating<u64>,
    /// Sends rejected because the payload was larger than
    /// [`AckConfig::max_packet_size`].
    pub packets_too_large_to_send: Saturating<u64>,
    /// Received packets dropped because they were larger than
    /// [`AckConfig::max_packet_size`] plus the header.
    pub packets_too_large_to_receive: Saturating<u64>,
}

/// Payload passed to [`AckSystem::send_packet`] is too large.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("payload of {len} bytes is larger than the max of {max}")]
pub struct PacketTooLarge {
    /// Length of the payload.
    pub len: usize,
    /// Maximum length allowed.
    pub max: usize,
}

/// Packet passed to [`AckSystem::receive_packet`] was rejected by the ack
/// layer.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum AckRejected {
    /// Packet is larger than any packet the peer may send.
    #[display("packet of {len} bytes is larger than the max of {max}")]
    TooLarge {
        /// Length of the packet.
        len: usize,
        /// Maximum length allowed.
        max: usize,
    },
    /// Packet is too short to contain an [`AckHeader`].
    #[display("packet of {len} bytes is too short for a header")]
    TooShort {
        /// Length of the packet.
        len: usize,
    },
    /// Packet's sequence is older than the received packets window.
    #[display("packet {seq:?} is stale")]
    Stale {
        /// Sequence of the packet.
        seq: PacketSeq,
    },
}

#[derive(Debug, Clone, Copy)]
struct SentPacket {
    sent_at: Duration,
    acked: bool,
    size: usize,
}

#[derive(Debug, Clone, Copy)]
struct ReceivedPacket {
    recv_at: Duration,
    size: usize,
}

const RTT_SMOOTHING: f64 = 0.001;
const LOSS_SMOOTHING: f32 = 0.1;
const BANDWIDTH_SMOOTHING: f32 = 0.1;

/// Tracks which sent packets the peer has acknowledged, and which received
/// packets we should acknowledge back.
///
/// This is sans-IO: packets are handed out through a send callback, and the
/// caller feeds every received packet into [`AckSystem::receive_packet`].
/// Internal time only moves forward through [`AckSystem::update`].
///
/// Nothing in here panics on bad input. Every rejected packet is counted in
/// [`AckSystem::stats`], and dropping it is always a valid way to handle the
/// returned error.
#[derive(Debug, Clone)]
pub struct AckSystem {
    config: AckConfig,
    time: Duration,
    next_seq: PacketSeq,
    acks: Vec<PacketSeq>,
    sent: SeqBuf<SentPacket>,
    received: SeqBuf<ReceivedPacket>,
    rtt: f64,
    packet_loss: f32,
    outgoing_bandwidth_kbps: f32,
    incoming_bandwidth_kbps: f32,
    stats: AckStats,
}

impl AckSystem {
    /// Creates a new ack system.
    ///
    /// # Errors
    ///
    /// Errors if the config is invalid, see [`AckConfig::validate`].
    pub fn new(config: AckConfig) -> Result<Self, AckConfigError> {
        config.validate()?;
        Ok(Self {
            time: Duration::ZERO,
            next_seq: PacketSeq::default(),
            acks: Vec::with_capacity(config.initial_ack_capacity),
            sent: SeqBuf::with_capacity(config.sent_packets_capacity),
            received: SeqBuf::with_capacity(config.received_packets_capacity),
            rtt: 0.0,
            packet_loss: 0.0,
            outgoing_bandwidth_kbps: 0.0,
            incoming_bandwidth_kbps: 0.0,
            stats: AckStats::default(),
            config,
        })
    }

    /// Gets the config this was created with.
    #[must_use]
    pub const fn config(&self) -> &AckConfig {
        &self.config
    }

    /// Gets the sequence number the next sent packet will use.
    #[must_use]
    pub const fn next_sequence(&self) -> PacketSeq {
        self.next_seq
    }

    /// Gets the total time this system has been advanced by.
    #[must_use]
    pub const fn time(&self) -> Duration {
        self.time
    }

    /// Frames `payload` with an [`AckHeader`] and passes the packet to `send`.
    ///
    /// Returns the sequence number the packet was sent with.
    ///
    /// # Errors
    ///
    /// Errors if `payload` is larger than [`AckConfig::max_packet_size`]. The
    /// sequence number is not consumed in this case.
    pub fn send_packet(
        &mut self,
        payload: &[u8],
        send: impl FnOnce(PacketSeq, &[u8]),
    ) -> Result<PacketSeq, PacketTooLarge> {
        let max = self.config.max_packet_size;
        if payload.len() > max {
            self.stats.packets_too_large_to_send += 1;
            return Err(PacketTooLarge {
                len: payload.len(),
                max,
            });
        }

        let seq = self.next_seq;
        self.next_seq += PacketSeq::new(1);

        let (ack, ack_bits) = self.received.generate_ack_bits();
        let header = AckHeader {
            seq,
            ack: PacketSeq(ack),
            ack_bits,
        };
        let size = AckHeader::ENCODE_LEN + payload.len();
        self.sent.insert(
            *seq,
            SentPacket {
                sent_at: self.time,
                acked: false,
                size,
            },
        );

        let packet = crate::frame(&header, payload);

        self.stats.packets_sent += 1;
        send(seq, &packet);
        Ok(seq)
    }

    /// Reads the [`AckHeader`] off `packet`, passes the rest of the packet to
    /// `open`, then processes the acknowledgements the header carries.
    ///
    /// If `open` fails, the packet is not recorded as received, and so will
    /// not be acknowledged to the peer.
    ///
    /// Returns the sequence number of the packet. Newly acknowledged packets
    /// can be taken out with [`AckSystem::drain_acks`].
    ///
    /// # Errors
    ///
    /// Errors if the packet is rejected by the ack layer (converted into `E`),
    /// or if `open` fails.
    pub fn receive_packet<E: From<AckRejected>>(
        &mut self,
        mut packet: Bytes,
        open: impl FnOnce(PacketSeq, Bytes) -> Result<(), E>,
    ) -> Result<PacketSeq, E> {
        let len = packet.len();
        let max = self.config.max_packet_size + AckHeader::ENCODE_LEN;
        if len > max {
            self.stats.packets_too_large_to_receive += 1;
            return Err(AckRejected::TooLarge { len, max }.into());
        }
        self.stats.packets_received += 1;

        if len < AckHeader::ENCODE_LEN {
            self.stats.packets_invalid += 1;
            return Err(AckRejected::TooShort { len }.into());
        }
        let header = packet.read::<AckHeader>().map_err(|_| {
            self.stats.packets_invalid += 1;
            AckRejected::TooShort { len }
        })?;

        if self.received.is_stale(*header.seq) {
            self.stats.packets_stale += 1;
            return Err(AckRejected::Stale { seq: header.seq }.into());
        }

        open(header.seq, packet)?;

        self.received.insert(
            *header.seq,
            ReceivedPacket {
                recv_at: self.time,
                size: len,
            },
        );

        for acked_seq in header.acked_seqs() {
            let Some(sent) = self.sent.get_mut(*acked_seq) else {
                continue;
            };
            if sent.acked {
                continue;
            }
            sent.acked = true;
            self.acks.push(acked_seq);
            self.stats.packets_acked += 1;

            let sample = self.time.saturating_sub(sent.sent_at).as_secs_f64();
            self.rtt = (self.rtt + (sample - self.rtt) * RTT_SMOOTHING).max(0.0);
            trace!(seq = acked_seq.0.0, rtt = sample, "Packet acked");
        }

        Ok(header.seq)
    }

    /// Gets the packets acknowledged since the last [`AckSystem::clear_acks`]
    /// or [`AckSystem::drain_acks`], in the order they were acknowledged.
    #[must_use]
    pub fn acks(&self) -> &[PacketSeq] {
        &self.acks
    }

    /// Clears the list of acknowledged packets.
    pub fn clear_acks(&mut self) {
        self.acks.clear();
    }

    /// Takes every acknowledged packet out of the ack list.
    pub fn drain_acks(&mut self) -> impl Iterator<Item = PacketSeq> + '_ {
        self.acks.drain(..)
    }

    /// Advances internal time by `dt` and updates the loss and bandwidth
    /// estimates.
    pub fn update(&mut self, dt: Duration) {
        self.time += dt;

        if let Some(loss) = packet_loss(&self.sent) {
            self.packet_loss = smooth(self.packet_loss, loss, LOSS_SMOOTHING);
        }
        if let Some(kbps) = bandwidth_kbps(self.sent.iter().map(|(_, p)| (p.sent_at, p.size))) {
            self.outgoing_bandwidth_kbps =
                smooth(self.outgoing_bandwidth_kbps, kbps, BANDWIDTH_SMOOTHING);
        }
        if let Some(kbps) =
            bandwidth_kbps(self.received.iter().map(|(_, p)| (p.recv_at, p.size)))
        {
            self.incoming_bandwidth_kbps =
                smooth(self.incoming_bandwidth_kbps, kbps, BANDWIDTH_SMOOTHING);
        }
    }

    /// Gets the smoothed round-trip time estimate.
    #[must_use]
    pub fn rtt(&self) -> Duration {
        Duration::from_secs_f64(self.rtt)
    }

    /// Gets the smoothed fraction of sent packets which were not acknowledged,
    /// in `0.0..=1.0`.
    #[must_use]
    pub const fn packet_loss(&self) -> f32 {
        self.packet_loss
    }

    /// Gets the smoothed outgoing bandwidth in kilobits per second.
    #[must_use]
    pub const fn outgoing_bandwidth_kbps(&self) -> f32 {
        self.outgoing_bandwidth_kbps
    }

    /// Gets the smoothed incoming bandwidth in kilobits per second.
    #[must_use]
    pub const fn incoming_bandwidth_kbps(&self) -> f32 {
        self.incoming_bandwidth_kbps
    }

    /// Gets the packet counters.
    #[must_use]
    pub const fn stats(&self) -> AckStats {
        self.stats
    }

    /// Returns `true` if the packet we sent with sequence `seq` is still
    /// tracked and has been acknowledged.
    #[must_use]
    pub fn is_acked(&self, seq: PacketSeq) -> bool {
        self.sent.get(*seq).is_some_and(|sent| sent.acked)
    }

    /// Resets this system to the state it was created in, keeping the config.
    pub fn reset(&mut self) {
        self.time = Duration::ZERO;
        self.next_seq = PacketSeq::default();
        self.acks.clear();
        self.sent.reset();
        self.received.reset();
        self.rtt = 0.0;
        self.packet_loss = 0.0;
        self.outgoing_bandwidth_kbps = 0.0;
        self.incoming_bandwidth_kbps = 0.0;
        self.stats = AckStats::default();
    }
}

fn smooth(current: f32, sample: f32, weight: f32) -> f32 {
    (current + (sample - current) * weight).max(0.0)
}

#[expect(clippy::cast_precision_loss, reason = "counts are at most 32768")]
fn packet_loss(sent: &SeqBuf<SentPacket>) -> Option<f32> {
    let (count, dropped) = sent.iter().fold((0usize, 0usize), |(count, dropped), (_, p)| {
        (count + 1, dropped + usize::from(!p.acked))
    });
    if count == 0 {
        None
    } else {
        Some(dropped as f32 / count as f32)
    }
}

#[expect(clippy::cast_precision_loss, reason = "precision loss is acceptable")]
#[expect(clippy::cast_possible_truncation, reason = "precision loss is acceptable")]
fn bandwidth_kbps(packets: impl Iterator<Item = (Duration, usize)>) -> Option<f32> {
    let mut bytes = 0usize;
    let mut start = Duration::MAX;
    let mut end = Duration::ZERO;
    for (at, size) in packets {
        bytes += size;
        start = start.min(at);
        end = end.max(at);
    }
    let span = end.checked_sub(start)?.as_secs_f64();
    if span <= 0.0 {
        return None;
    }
    let kbits = (bytes * 8) as f64 / 1000.0;
    Some((kbits / span) as f32)
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {super::*, assert_matches::assert_matches, octs::test::*};

    const DT: Duration = Duration::from_millis(10);

    fn system() -> AckSystem {
        AckSystem::new(AckConfig::default()).unwrap()
    }

    fn send(acks: &mut AckSystem, payload: &[u8]) -> Bytes {
        let mut out = None;
        acks.send_packet(payload, |_, packet| {
            out = Some(Bytes::copy_from_slice(packet));
        })
        .unwrap();
        out.unwrap()
    }

    fn recv(acks: &mut AckSystem, packet: Bytes) -> Result<PacketSeq, AckRejected> {
        acks.receive_packet(packet, |_, _| Ok::<_, AckRejected>(()))
    }

    #[test]
    fn encode_decode_header() {
        hint_round_trip(&AckHeader {
            seq: PacketSeq::new(3),
            ack: PacketSeq::new(2),
            ack_bits: 0b11,
        });
    }

    #[test]
    fn header_is_eight_bytes() {
        assert_eq!(8, AckHeader::ENCODE_LEN);
    }

    #[test]
    fn lossless_exchange_acks_everything() {
        let mut a = system();
        let mut b = system();
        for _ in 0..100 {
            let packet = send(&mut a, b"ping");
            recv(&mut b, packet).unwrap();
            let packet = send(&mut b, b"pong");
            recv(&mut a, packet).unwrap();
            a.update(DT);
            b.update(DT);
        }
        assert_eq!(100, a.stats().packets_sent.0);
        // the last packet `b` sent acks everything `a` sent
        assert_eq!(100, a.stats().packets_acked.0);
        assert_eq!(99, b.stats().packets_acked.0);
        assert!(a.packet_loss() < 0.01);
    }

    #[test]
    fn acks_reported_once() {
        let mut a = system();
        let mut b = system();
        let packet = send(&mut a, b"1");
        recv(&mut b, packet).unwrap();

        let reply = send(&mut b, b"");
        recv(&mut a, reply).unwrap();
        assert_eq!(&[PacketSeq::new(0)], a.acks());
        a.clear_acks();

        // the next reply acks the same packet again
        let reply = send(&mut b, b"");
        recv(&mut a, reply).unwrap();
        assert!(a.acks().is_empty());
        assert!(a.is_acked(PacketSeq::new(0)));
    }

    #[test]
    fn rejects_too_large_send() {
        let mut a = system();
        let max = a.config().max_packet_size;
        assert_matches!(
            a.send_packet(&vec![0; max + 1], |_, _| panic!("should not send")),
            Err(PacketTooLarge { .. })
        );
        assert_eq!(1, a.stats().packets_too_large_to_send.0);
        assert_eq!(PacketSeq::new(0), a.next_sequence());
    }

    #[test]
    fn rejects_short_and_large_receives() {
        let mut a = system();
        assert_matches!(
            recv(&mut a, Bytes::from_static(&[1, 2, 3])),
            Err(AckRejected::TooShort { len: 3 })
        );
        assert_matches!(
            recv(&mut a, Bytes::from(vec![0; MAX_PACKET_LEN + 1])),
            Err(AckRejected::TooLarge { .. })
        );
        assert_eq!(1, a.stats().packets_invalid.0);
        assert_eq!(1, a.stats().packets_too_large_to_receive.0);
    }

    #[test]
    fn rejects_stale() {
        let mut a = system();
        let mut b = system();
        let first = send(&mut a, b"");
        for _ in 0..300 {
            let packet = send(&mut a, b"");
            recv(&mut b, packet).unwrap();
        }
        assert_matches!(recv(&mut b, first), Err(AckRejected::Stale { .. }));
        assert_eq!(1, b.stats().packets_stale.0);
    }

    #[test]
    fn failed_open_is_not_acked() {
        let mut a = system();
        let mut b = system();
        let packet = send(&mut a, b"bad");
        let result = b.receive_packet(packet, |_, _| Err(AckRejected::TooShort { len: 0 }));
        assert!(result.is_err());

        let reply = send(&mut b, b"");
        recv(&mut a, reply).unwrap();
        assert!(a.acks().is_empty());
    }

    #[test]
    fn header_carries_ack_bits() {
        let mut a = system();
        let mut b = system();
        let packets = (0..4).map(|_| send(&mut a, b"")).collect::<Vec<_>>();
        // drop packet 2
        for (i, packet) in packets.into_iter().enumerate() {
            if i != 2 {
                recv(&mut b, packet).unwrap();
            }
        }

        let mut reply = send(&mut b, b"");
        let header = reply.read::<AckHeader>().unwrap();
        assert_eq!(PacketSeq::new(3), header.ack);
        assert_eq!(0b1101, header.ack_bits);
    }

    #[test]
    fn half_loss_converges() {
        let mut a = system();
        let mut b = system();
        for i in 0..1000 {
            let packet = send(&mut a, b"data");
            if i % 2 == 0 {
                recv(&mut b, packet).unwrap();
            }
            let reply = send(&mut b, b"");
            recv(&mut a, reply).unwrap();
            a.clear_acks();
            a.update(DT);
            b.update(DT);
        }
        let loss = a.packet_loss();
        assert!((loss - 0.5).abs() < 0.05, "loss = {loss}");
        assert!(b.packet_loss() < 0.02);
    }

    #[test]
    fn rtt_moves_towards_samples() {
        let mut a = system();
        let mut b = system();
        for _ in 0..100 {
            let packet = send(&mut a, b"");
            a.update(Duration::from_millis(100));
            recv(&mut b, packet).unwrap();
            let reply = send(&mut b, b"");
            recv(&mut a, reply).unwrap();
        }
        let rtt = a.rtt();
        assert!(rtt > Duration::ZERO);
        assert!(rtt < Duration::from_millis(100));
    }

    #[test]
    fn bandwidth_never_nan() {
        let mut a = system();
        a.update(DT);
        assert!(a.outgoing_bandwidth_kbps().is_finite());

        // every packet sent at the same instant
        send(&mut a, b"xyz");
        send(&mut a, b"xyz");
        a.update(DT);
        assert!(a.outgoing_bandwidth_kbps().is_finite());

        send(&mut a, b"xyz");
        a.update(DT);
        assert!(a.outgoing_bandwidth_kbps() > 0.0);
    }

    #[test]
    fn reset_clears_state() {
        let mut a = system();
        send(&mut a, b"x");
        a.update(DT);
        a.reset();
        assert_eq!(PacketSeq::new(0), a.next_sequence());
        assert_eq!(AckStats::default(), a.stats());
        assert_eq!(Duration::ZERO, a.time());
    }
}
