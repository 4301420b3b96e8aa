//! Reliable-ordered and unreliable message delivery on top of an
//! [`AckSystem`].
//!
//! # Reliable messages
//!
//! A reliable message is given the next [`MessageSeq`], split into
//! [`TransportConfig::fragment_size`] chunks, and each chunk is framed with a
//! [`FragmentHeader`] and sent as its own packet through the ack layer. Every
//! encoded fragment is kept in a [`SlotMap`] until a packet carrying it is
//! acknowledged, and resent (with the same bytes, but under a new
//! [`PacketSeq`]) every [`TransportConfig::resend_interval`] until then.
//!
//! The receiver puts fragments back together with a [`FragmentReceiver`], and
//! hands completed messages to the user strictly in [`MessageSeq`] order. A
//! missing message blocks delivery of everything after it.
//!
//! # Flow control
//!
//! The receiver only holds [`TransportConfig::reassembly_capacity`] messages
//! ahead of the next one the user will [`Transport::receive`]. Fragments past
//! that window are refused: the ack layer does not acknowledge them, so the
//! sender keeps resending them until the user catches up.
//!
//! [`SlotMap`]: slotmap::SlotMap

use {
    crate::{
        MAX_PACKET_LEN,
        ack::{AckConfig, AckConfigError, AckRejected, AckSystem, PacketTooLarge},
        frag::{
            self, FragmentHeader, FragmentPrefix, FragmentReceiver, InvalidPrefix, ReassembleError,
        },
        seq::{MessageSeq, PacketSeq, Seq},
        seq_buf::{self, SeqBuf},
    },
    alloc::{collections::VecDeque, vec::Vec},
    core::{cmp::Reverse, num::Saturating, time::Duration},
    derive_more::{Add, AddAssign, Display, Error, Sub, SubAssign},
    octs::{BufTooShortOr, Bytes, FixedEncodeLen, Read},
    slotmap::SlotMap,
    tracing::{trace, warn},
};

/// Configuration for a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportConfig {
    /// Maximum number of message bytes carried by a single fragment.
    ///
    /// A fragment plus its [`FragmentHeader`] must fit in
    /// [`AckConfig::max_packet_size`].
    ///
    /// Default: 1024.
    pub fragment_size: usize,
    /// Largest message which can be sent reliably in one call.
    ///
    /// Default: 64 KiB.
    pub max_size_single_send: usize,
    /// Maximum number of fragments which may be waiting for an
    /// acknowledgement at once.
    ///
    /// Default: 256.
    pub max_fragments_in_flight: usize,
    /// Number of reliable messages the receiver buffers ahead of the next one
    /// to be delivered.
    ///
    /// Must be a power of two no larger than 32768, and be the same on both
    /// peers.
    ///
    /// Default: 256.
    pub reassembly_capacity: usize,
    /// How long to wait for an acknowledgement before sending a fragment
    /// again.
    ///
    /// Default: 100ms.
    pub resend_interval: Duration,
    /// If we have received packets but not sent anything for this long, an
    /// empty packet is sent just to carry acknowledgements.
    ///
    /// Default: 100ms.
    pub ack_only_interval: Duration,
    /// Config of the underlying [`AckSystem`].
    pub ack: AckConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            fragment_size: 1024,
            max_size_single_send: 64 * 1024,
            max_fragments_in_flight: 256,
            reassembly_capacity: 256,
            resend_interval: Duration::from_millis(100),
            ack_only_interval: Duration::from_millis(100),
            ack: AckConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Sets [`TransportConfig::fragment_size`].
    #[must_use]
    pub const fn with_fragment_size(mut self, fragment_size: usize) -> Self {
        self.fragment_size = fragment_size;
        self
    }

    /// Sets [`TransportConfig::max_size_single_send`].
    #[must_use]
    pub const fn with_max_size_single_send(mut self, max_size_single_send: usize) -> Self {
        self.max_size_single_send = max_size_single_send;
        self
    }

    /// Sets [`TransportConfig::max_fragments_in_flight`].
    #[must_use]
    pub const fn with_max_fragments_in_flight(mut self, max_fragments_in_flight: usize) -> Self {
        self.max_fragments_in_flight = max_fragments_in_flight;
        self
    }

    /// Sets [`TransportConfig::reassembly_capacity`].
    #[must_use]
    pub const fn with_reassembly_capacity(mut self, reassembly_capacity: usize) -> Self {
        self.reassembly_capacity = reassembly_capacity;
        self
    }

    /// Sets [`TransportConfig::resend_interval`].
    #[must_use]
    pub const fn with_resend_interval(mut self, resend_interval: Duration) -> Self {
        self.resend_interval = resend_interval;
        self
    }

    /// Sets [`TransportConfig::ack_only_interval`].
    #[must_use]
    pub const fn with_ack_only_interval(mut self, ack_only_interval: Duration) -> Self {
        self.ack_only_interval = ack_only_interval;
        self
    }

    /// Sets [`TransportConfig::ack`].
    #[must_use]
    pub const fn with_ack(mut self, ack: AckConfig) -> Self {
        self.ack = ack;
        self
    }

    /// Largest number of fragments a reliable message can be split into.
    #[must_use]
    pub const fn max_fragment_count(&self) -> usize {
        self.max_size_single_send.div_ceil(self.fragment_size)
    }

    /// Checks that this config can be used to build a [`Transport`].
    ///
    /// # Errors
    ///
    /// Errors if any of the values are out of range.
    pub fn validate(&self) -> Result<(), TransportConfigError> {
        self.ack.validate().map_err(TransportConfigError::Ack)?;
        if self.fragment_size == 0
            || self.fragment_size + FragmentHeader::ENCODE_LEN > self.ack.max_packet_size
            || u16::try_from(self.fragment_size).is_err()
        {
            return Err(TransportConfigError::FragmentSize {
                size: self.fragment_size,
            });
        }
        if self.max_size_single_send == 0
            || u16::try_from(self.max_fragment_count()).is_err()
            || self.max_fragment_count() > self.max_fragments_in_flight
        {
            return Err(TransportConfigError::MaxSizeSingleSend {
                size: self.max_size_single_send,
            });
        }
        if !seq_buf::is_valid_capacity(self.reassembly_capacity) {
            return Err(TransportConfigError::ReassemblyCapacity {
                capacity: self.reassembly_capacity,
            });
        }
        Ok(())
    }
}

/// [`TransportConfig`] has an out-of-range value.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum TransportConfigError {
    /// [`TransportConfig::ack`] is invalid.
    #[display("invalid ack config")]
    Ack(AckConfigError),
    /// [`TransportConfig::fragment_size`] is zero, or a fragment does not fit
    /// in a packet.
    #[display("fragment size {size} is zero or does not fit in a packet")]
    FragmentSize {
        /// Configured size.
        size: usize,
    },
    /// [`TransportConfig::max_size_single_send`] is zero, or needs more
    /// fragments than can be in flight at once.
    #[display("max single send size {size} is zero or needs too many fragments")]
    MaxSizeSingleSend {
        /// Configured size.
        size: usize,
    },
    /// [`TransportConfig::reassembly_capacity`] is not a valid sequence
    /// buffer capacity.
    #[display("reassembly capacity {capacity} is not a power of two up to 32768")]
    ReassemblyCapacity {
        /// Configured capacity.
        capacity: usize,
    },
}

/// Message counters of a [`Transport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)] // force `#[derive]` on multiple lines
#[derive(Add, AddAssign, Sub, SubAssign)]
pub struct TransportStats {
    /// Reliable messages accepted for sending.
    pub msgs_sent: Saturating<u64>,
    /// Reliable messages fully reassembled.
    pub msgs_received: Saturating<u64>,
    /// Unreliable messages sent.
    pub unreliable_sent: Saturating<u64>,
    /// Unreliable messages received.
    pub unreliable_received: Saturating<u64>,
    /// Fragments sent for the first time.
    pub fragments_sent: Saturating<u64>,
    /// Fragments sent again because they were not acknowledged in time.
    pub fragments_resent: Saturating<u64>,
    /// Fragments released because the peer acknowledged them.
    pub fragments_acked: Saturating<u64>,
    /// Received fragments we already had, or which belonged to a message
    /// already delivered.
    pub fragments_duplicate: Saturating<u64>,
    /// Received fragments refused because they were too far ahead of the
    /// next message to deliver.
    pub fragments_refused: Saturating<u64>,
    /// Received packets dropped because they were malformed.
    pub packets_invalid: Saturating<u64>,
    /// Empty packets sent only to carry acknowledgements.
    pub ack_only_sent: Saturating<u64>,
}

/// Failed to send a message through a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum SendError {
    /// Message is empty.
    #[display("message is empty")]
    Empty,
    /// Message is larger than the transport allows.
    #[display("message of {len} bytes is larger than the max of {max}")]
    TooLarge {
        /// Length of the message.
        len: usize,
        /// Maximum length allowed.
        max: usize,
    },
    /// Sending the message would put more than
    /// [`TransportConfig::max_fragments_in_flight`] fragments in flight.
    #[display("too many fragments in flight")]
    TooManyFragmentsInFlight,
    /// The oldest unacknowledged message is too far behind for the peer to
    /// accept another one.
    #[display("reassembly window is full")]
    WindowFull,
    /// The ack layer refused the packet.
    #[display("packet too large for the ack layer")]
    Ack(PacketTooLarge),
}

/// Received packet was dropped by a [`Transport`].
///
/// Dropping the packet is always a valid way to handle this.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum RecvError {
    /// The ack layer refused the packet.
    #[display("rejected by ack layer")]
    Ack(AckRejected),
    /// Packet is too short to contain a [`FragmentHeader`].
    #[display("packet of {len} bytes is too short for a fragment header")]
    TooShort {
        /// Length of the packet after the ack header.
        len: usize,
    },
    /// Packet starts with an unknown [`FragmentPrefix`].
    #[display("invalid fragment prefix")]
    InvalidPrefix(InvalidPrefix),
    /// Size in the header does not match the payload length.
    #[display("header size {size} does not match payload length {len}")]
    SizeMismatch {
        /// Size stated in the header.
        size: u16,
        /// Actual payload length.
        len: usize,
    },
    /// Fragment position or count is out of range.
    #[display("fragment {index}/{count} is out of range")]
    InvalidFragment {
        /// Index of the fragment.
        index: u16,
        /// Number of fragments in the message.
        count: u16,
    },
    /// Fragment is inconsistent with the other fragments of its message.
    #[display("failed to reassemble")]
    Reassemble(ReassembleError),
    /// Fragment is too far ahead of the next message to deliver.
    #[display("message {seq:?} is outside the reassembly window")]
    WindowFull {
        /// Sequence of the message.
        seq: MessageSeq,
    },
}

impl From<AckRejected> for RecvError {
    fn from(value: AckRejected) -> Self {
        Self::Ack(value)
    }
}

slotmap::new_key_type! {
    /// Handle to a fragment waiting for an acknowledgement.
    pub struct FragmentKey;
}

#[derive(Debug, Clone)]
struct SentFragment {
    seq: MessageSeq,
    index: u16,
    packet: Bytes,
    last_sent_at: Duration,
}

#[derive(Debug, Clone)]
struct Receiver {
    max_fragment_count: usize,
    window: usize,
    frags: FragmentReceiver,
    delivered: SeqBuf<Bytes>,
    next_recv_seq: MessageSeq,
    unreliable: VecDeque<Bytes>,
    needs_ack: bool,
}

/// Reliable-ordered and unreliable message transport for a single peer.
///
/// Like [`AckSystem`], this is sans-IO. Outgoing packets are handed to a send
/// callback, incoming packets are fed in through
/// [`Transport::receive_packet`], and time moves forward with
/// [`Transport::update`], which must be called regularly to resend lost
/// fragments.
#[derive(Debug, Clone)]
pub struct Transport {
    config: TransportConfig,
    acks: AckSystem,
    fragments: SlotMap<FragmentKey, SentFragment>,
    sent_packets: SeqBuf<FragmentKey>,
    next_send_seq: MessageSeq,
    last_send_at: Duration,
    receiver: Receiver,
    stats: TransportStats,
}

impl Transport {
    /// Creates a new transport.
    ///
    /// # Errors
    ///
    /// Errors if the config is invalid, see [`TransportConfig::validate`].
    pub fn new(config: TransportConfig) -> Result<Self, TransportConfigError> {
        config.validate()?;
        let acks = AckSystem::new(config.ack.clone()).map_err(TransportConfigError::Ack)?;
        Ok(Self {
            fragments: SlotMap::with_capacity_and_key(config.max_fragments_in_flight),
            sent_packets: SeqBuf::with_capacity(config.ack.sent_packets_capacity),
            next_send_seq: MessageSeq::default(),
            last_send_at: Duration::ZERO,
            receiver: Receiver {
                max_fragment_count: config.max_fragment_count(),
                window: config.reassembly_capacity,
                frags: FragmentReceiver::new(config.fragment_size, config.reassembly_capacity),
                delivered: SeqBuf::with_capacity(config.reassembly_capacity),
                next_recv_seq: MessageSeq::default(),
                unreliable: VecDeque::new(),
                needs_ack: false,
            },
            stats: TransportStats::default(),
            acks,
            config,
        })
    }

    /// Gets the config this was created with.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Gets the underlying ack system.
    #[must_use]
    pub const fn ack_system(&self) -> &AckSystem {
        &self.acks
    }

    /// Gets the message counters.
    #[must_use]
    pub const fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Gets how many sent fragments are waiting for an acknowledgement.
    #[must_use]
    pub fn fragments_in_flight(&self) -> usize {
        self.fragments.len()
    }

    /// Gets how many received messages are partially reassembled.
    #[must_use]
    pub const fn pending_reassemblies(&self) -> usize {
        self.receiver.frags.len()
    }

    /// Sends `msg` reliably, to be received in the order it was sent relative
    /// to other reliable messages.
    ///
    /// Every fragment of the message is passed to `send` immediately, and
    /// again on [`Transport::update`] until it is acknowledged.
    ///
    /// # Errors
    ///
    /// Errors if the message is empty or too large, or if there is no room to
    /// keep it in flight. Nothing is sent in this case.
    pub fn send_reliably_and_in_order(
        &mut self,
        msg: &[u8],
        mut send: impl FnMut(PacketSeq, &[u8]),
    ) -> Result<MessageSeq, SendError> {
        if msg.is_empty() {
            return Err(SendError::Empty);
        }
        let max = self.config.max_size_single_send;
        if msg.len() > max {
            return Err(SendError::TooLarge {
                len: msg.len(),
                max,
            });
        }

        let frags = frag::split(self.config.fragment_size, msg);
        let count = frags.len();
        if self.fragments.len() + count > self.config.max_fragments_in_flight {
            return Err(SendError::TooManyFragmentsInFlight);
        }
        if let Some(oldest) = self.oldest_unacked() {
            let spread = usize::try_from(oldest.dist_to(*self.next_send_seq)).unwrap_or(0);
            if spread >= self.config.reassembly_capacity {
                return Err(SendError::WindowFull);
            }
        }
        // `validate` guarantees this fits
        let count = u16::try_from(count).map_err(|_| SendError::TooLarge {
            len: msg.len(),
            max,
        })?;

        let seq = self.next_send_seq;
        self.next_send_seq += MessageSeq::new(1);
        let prefix = if count == 1 {
            FragmentPrefix::Single
        } else {
            FragmentPrefix::Fragment
        };

        let now = self.acks.time();
        for (index, payload) in frags {
            let (Ok(index), Ok(size)) = (u16::try_from(index), u16::try_from(payload.len())) else {
                continue;
            };
            let header = FragmentHeader {
                prefix,
                seq,
                count,
                index,
                size,
            };
            let packet = encode(header, payload);
            let packet_seq = self
                .acks
                .send_packet(&packet, &mut send)
                .map_err(SendError::Ack)?;
            let key = self.fragments.insert(SentFragment {
                seq,
                index,
                packet,
                last_sent_at: now,
            });
            self.sent_packets.insert(*packet_seq, key);
            self.stats.fragments_sent += 1;
        }

        trace!(seq = seq.0.0, len = msg.len(), count, "Sent reliable message");
        self.stats.msgs_sent += 1;
        self.last_send_at = now;
        self.receiver.needs_ack = false;
        Ok(seq)
    }

    /// Sends `msg` in a single packet, with no guarantee of delivery or
    /// ordering.
    ///
    /// # Errors
    ///
    /// Errors if the message is empty or does not fit in one packet.
    pub fn send_unreliable(
        &mut self,
        msg: &[u8],
        send: impl FnOnce(PacketSeq, &[u8]),
    ) -> Result<PacketSeq, SendError> {
        if msg.is_empty() {
            return Err(SendError::Empty);
        }
        let max = self.max_unreliable_len();
        let size = u16::try_from(msg.len())
            .ok()
            .filter(|_| msg.len() <= max)
            .ok_or(SendError::TooLarge {
                len: msg.len(),
                max,
            })?;

        let header = FragmentHeader {
            prefix: FragmentPrefix::Unreliable,
            seq: MessageSeq::default(),
            count: 1,
            index: 0,
            size,
        };
        let packet = encode(header, msg);
        let packet_seq = self
            .acks
            .send_packet(&packet, send)
            .map_err(SendError::Ack)?;
        self.stats.unreliable_sent += 1;
        self.last_send_at = self.acks.time();
        self.receiver.needs_ack = false;
        Ok(packet_seq)
    }

    /// Gets the largest message [`Transport::send_unreliable`] accepts.
    #[must_use]
    pub const fn max_unreliable_len(&self) -> usize {
        self.config.ack.max_packet_size - FragmentHeader::ENCODE_LEN
    }

    /// Processes a packet received from the peer.
    ///
    /// Completed messages can then be taken out with [`Transport::receive`]
    /// and [`Transport::receive_unreliable`].
    ///
    /// # Errors
    ///
    /// Errors if the packet was dropped. The packet is not acknowledged in
    /// this case, except for duplicate fragments, which are accepted
    /// silently so that the peer stops resending them.
    pub fn receive_packet(&mut self, packet: Bytes) -> Result<PacketSeq, RecvError> {
        let Self {
            acks,
            fragments,
            sent_packets,
            receiver,
            stats,
            ..
        } = self;
        let result = acks.receive_packet(packet, |_, payload| receiver.process(payload, stats));
        if let Err(err) = &result {
            trace!("Dropped packet: {err}");
            if !matches!(err, RecvError::Ack(_) | RecvError::WindowFull { .. }) {
                stats.packets_invalid += 1;
            }
        }
        release_acked(acks.drain_acks(), sent_packets, fragments, stats);
        result
    }

    /// Processes the payload of a packet which has already passed through the
    /// ack layer.
    ///
    /// [`Transport::receive_packet`] calls this for every packet the ack layer
    /// accepts.
    ///
    /// # Errors
    ///
    /// Errors if the payload is malformed, or must be refused.
    pub fn process_packet(&mut self, payload: Bytes) -> Result<(), RecvError> {
        self.receiver.process(payload, &mut self.stats)
    }

    /// Releases every fragment carried by a packet in `acks`.
    ///
    /// Acks for packets which no longer map to a fragment in flight are
    /// ignored.
    pub fn process_acks(&mut self, acks: impl IntoIterator<Item = PacketSeq>) {
        release_acked(
            acks,
            &mut self.sent_packets,
            &mut self.fragments,
            &mut self.stats,
        );
    }

    /// Takes the next reliable message, if it has been fully received.
    ///
    /// Messages come out in the order they were sent. If the next message is
    /// still missing, this returns [`None`] even if later messages are
    /// complete.
    pub fn receive(&mut self) -> Option<Bytes> {
        let receiver = &mut self.receiver;
        let msg = receiver.delivered.remove(*receiver.next_recv_seq)?;
        receiver.next_recv_seq += MessageSeq::new(1);
        Some(msg)
    }

    /// Takes the next unreliable message received.
    pub fn receive_unreliable(&mut self) -> Option<Bytes> {
        self.receiver.unreliable.pop_front()
    }

    /// Advances time by `dt`, resending fragments which have not been
    /// acknowledged in time, and sending an ack-only packet if the peer is
    /// waiting on acknowledgements from us.
    pub fn update(&mut self, dt: Duration, mut send: impl FnMut(PacketSeq, &[u8])) {
        self.acks.update(dt);
        let now = self.acks.time();
        let resend_interval = self.config.resend_interval;
        let next_send_seq = self.next_send_seq;

        // oldest message first, then in fragment order
        let mut due = self
            .fragments
            .iter()
            .filter(|(_, frag)| now.saturating_sub(frag.last_sent_at) >= resend_interval)
            .map(|(key, frag)| (Reverse(frag.seq.dist_to(*next_send_seq)), frag.index, key))
            .collect::<Vec<_>>();
        due.sort_unstable();

        for (_, _, key) in due {
            let Some(frag) = self.fragments.get_mut(key) else {
                continue;
            };
            match self.acks.send_packet(&frag.packet, &mut send) {
                Ok(packet_seq) => {
                    frag.last_sent_at = now;
                    self.sent_packets.insert(*packet_seq, key);
                    self.stats.fragments_resent += 1;
                    self.last_send_at = now;
                    self.receiver.needs_ack = false;
                }
                Err(err) => {
                    warn!("Failed to resend fragment: {err}");
                }
            }
        }

        if self.receiver.needs_ack
            && now.saturating_sub(self.last_send_at) >= self.config.ack_only_interval
        {
            let header = FragmentHeader {
                prefix: FragmentPrefix::AckOnly,
                seq: MessageSeq::default(),
                count: 0,
                index: 0,
                size: 0,
            };
            if self.acks.send_packet(&encode(header, &[]), send).is_ok() {
                self.stats.ack_only_sent += 1;
                self.last_send_at = now;
                self.receiver.needs_ack = false;
            }
        }
    }

    /// Resets this transport to the state it was created in, dropping every
    /// message in flight and every message not yet received.
    pub fn reset(&mut self) {
        self.acks.reset();
        self.fragments.clear();
        self.sent_packets.reset();
        self.next_send_seq = MessageSeq::default();
        self.last_send_at = Duration::ZERO;
        let receiver = &mut self.receiver;
        receiver.frags.reset();
        receiver.delivered.reset();
        receiver.next_recv_seq = MessageSeq::default();
        receiver.unreliable.clear();
        receiver.needs_ack = false;
        self.stats = TransportStats::default();
    }

    fn oldest_unacked(&self) -> Option<Seq> {
        let next = *self.next_send_seq;
        self.fragments
            .values()
            .map(|frag| *frag.seq)
            .max_by_key(|seq| seq.dist_to(next))
    }
}

fn encode(header: FragmentHeader, payload: &[u8]) -> Bytes {
    let packet = crate::frame(&header, payload);
    debug_assert!(packet.len() <= MAX_PACKET_LEN);
    packet.freeze()
}

fn release_acked(
    acks: impl IntoIterator<Item = PacketSeq>,
    sent_packets: &mut SeqBuf<FragmentKey>,
    fragments: &mut SlotMap<FragmentKey, SentFragment>,
    stats: &mut TransportStats,
) {
    for packet_seq in acks {
        let Some(key) = sent_packets.remove(*packet_seq) else {
            continue;
        };
        // the fragment may have been released by an ack of another packet
        // which carried it
        if let Some(frag) = fragments.remove(key) {
            trace!(
                seq = frag.seq.0.0,
                index = frag.index,
                packet_seq = packet_seq.0.0,
                "Fragment acked"
            );
            stats.fragments_acked += 1;
        }
    }
}

impl Receiver {
    fn process(&mut self, mut payload: Bytes, stats: &mut TransportStats) -> Result<(), RecvError> {
        let len = payload.len();
        let header = payload.read::<FragmentHeader>().map_err(|err| match err {
            BufTooShortOr::TooShort => RecvError::TooShort { len },
            BufTooShortOr::Or(err) => RecvError::InvalidPrefix(err),
        })?;
        if usize::from(header.size) != payload.len() {
            return Err(RecvError::SizeMismatch {
                size: header.size,
                len: payload.len(),
            });
        }

        match header.prefix {
            FragmentPrefix::AckOnly => Ok(()),
            FragmentPrefix::Unreliable => {
                self.needs_ack = true;
                if self.unreliable.len() >= self.window {
                    self.unreliable.pop_front();
                }
                self.unreliable.push_back(payload);
                stats.unreliable_received += 1;
                Ok(())
            }
            FragmentPrefix::Single | FragmentPrefix::Fragment => {
                self.needs_ack = true;
                self.process_fragment(header, payload, stats)
            }
        }
    }

    fn process_fragment(
        &mut self,
        header: FragmentHeader,
        payload: Bytes,
        stats: &mut TransportStats,
    ) -> Result<(), RecvError> {
        let FragmentHeader {
            prefix,
            seq,
            count,
            index,
            ..
        } = header;
        if index >= count
            || usize::from(count) > self.max_fragment_count
            || (prefix == FragmentPrefix::Single && count != 1)
        {
            return Err(RecvError::InvalidFragment { index, count });
        }

        let dist = self.next_recv_seq.dist_to(*seq);
        if dist < 0 || self.delivered.contains(*seq) {
            trace!(seq = seq.0.0, index, "Duplicate fragment of delivered message");
            stats.fragments_duplicate += 1;
            return Ok(());
        }
        if usize::try_from(dist).unwrap_or(usize::MAX) >= self.window {
            stats.fragments_refused += 1;
            return Err(RecvError::WindowFull { seq });
        }

        let msg = match self.frags.reassemble(seq, count, index, &payload) {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(()),
            Err(ReassembleError::AlreadyReceived { .. }) => {
                stats.fragments_duplicate += 1;
                return Ok(());
            }
            Err(err) => return Err(RecvError::Reassemble(err)),
        };
        trace!(seq = seq.0.0, len = msg.len(), "Reassembled message");
        self.delivered.insert(*seq, msg);
        stats.msgs_received += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {super::*, assert_matches::assert_matches};

    const DT: Duration = Duration::from_millis(10);

    fn transport() -> Transport {
        Transport::new(TransportConfig::default()).unwrap()
    }

    fn collect(out: &mut Vec<Bytes>) -> impl FnMut(PacketSeq, &[u8]) + '_ {
        |_, packet| out.push(Bytes::copy_from_slice(packet))
    }

    #[test]
    fn default_config_is_valid() {
        TransportConfig::default().validate().unwrap();
    }

    #[test]
    fn invalid_configs_rejected() {
        assert_matches!(
            TransportConfig::default().with_fragment_size(2000).validate(),
            Err(TransportConfigError::FragmentSize { .. })
        );
        assert_matches!(
            TransportConfig::default()
                .with_max_size_single_send(1024 * 1024)
                .validate(),
            Err(TransportConfigError::MaxSizeSingleSend { .. })
        );
        assert_matches!(
            TransportConfig::default().with_reassembly_capacity(100).validate(),
            Err(TransportConfigError::ReassemblyCapacity { .. })
        );
    }

    #[test]
    fn single_message() {
        let mut a = transport();
        let mut b = transport();
        let mut packets = Vec::new();
        a.send_reliably_and_in_order(b"hello", collect(&mut packets))
            .unwrap();
        assert_eq!(1, packets.len());
        assert_eq!(FragmentHeader::ENCODE_LEN + 8 + 5, packets[0].len());

        b.receive_packet(packets.remove(0)).unwrap();
        assert_eq!(Some(Bytes::from_static(b"hello")), b.receive());
        assert_eq!(None, b.receive());
    }

    #[test]
    fn large_message_any_order_with_duplicates() {
        let mut a = transport();
        let mut b = transport();
        let msg = (0..10_000u32)
            .map(|i| u8::try_from(i % 251).unwrap())
            .collect::<Vec<_>>();
        let mut packets = Vec::new();
        a.send_reliably_and_in_order(&msg, collect(&mut packets))
            .unwrap();
        assert_eq!(10, packets.len());
        assert_eq!(10, a.fragments_in_flight());

        // reverse order, every packet twice
        for packet in packets.iter().rev() {
            b.receive_packet(packet.clone()).unwrap();
        }
        for packet in &packets {
            assert_matches!(b.receive_packet(packet.clone()), Err(RecvError::Ack(_)) | Ok(_));
        }
        assert_eq!(&msg[..], &b.receive().unwrap()[..]);
        assert_eq!(None, b.receive());
        assert_eq!(0, b.pending_reassemblies());
    }

    #[test]
    fn rejects_bad_sends() {
        let mut a = transport();
        assert_matches!(
            a.send_reliably_and_in_order(b"", |_, _| {}),
            Err(SendError::Empty)
        );
        let too_large = vec![0; a.config().max_size_single_send + 1];
        assert_matches!(
            a.send_reliably_and_in_order(&too_large, |_, _| {}),
            Err(SendError::TooLarge { .. })
        );
        let too_large = vec![0; a.max_unreliable_len() + 1];
        assert_matches!(
            a.send_unreliable(&too_large, |_, _| {}),
            Err(SendError::TooLarge { .. })
        );
    }

    #[test]
    fn too_many_fragments_in_flight() {
        let mut a = transport();
        let msg = vec![1; a.config().max_size_single_send];
        for _ in 0..4 {
            a.send_reliably_and_in_order(&msg, |_, _| {}).unwrap();
        }
        assert_eq!(256, a.fragments_in_flight());
        assert_matches!(
            a.send_reliably_and_in_order(b"x", |_, _| {}),
            Err(SendError::TooManyFragmentsInFlight)
        );
    }

    #[test]
    fn window_full_on_send() {
        let mut a = Transport::new(
            TransportConfig::default()
                .with_max_size_single_send(1024)
                .with_reassembly_capacity(4),
        )
        .unwrap();
        for _ in 0..4 {
            a.send_reliably_and_in_order(b"x", |_, _| {}).unwrap();
        }
        assert_matches!(
            a.send_reliably_and_in_order(b"x", |_, _| {}),
            Err(SendError::WindowFull)
        );
    }

    #[test]
    fn acks_release_fragments() {
        let mut a = transport();
        let mut b = transport();
        let mut to_b = Vec::new();
        a.send_reliably_and_in_order(&[7; 3000], collect(&mut to_b))
            .unwrap();
        assert_eq!(3, a.fragments_in_flight());
        for packet in to_b {
            b.receive_packet(packet).unwrap();
        }

        let mut to_a = Vec::new();
        b.update(Duration::from_millis(200), collect(&mut to_a));
        assert_eq!(1, to_a.len());
        assert_eq!(1, b.stats().ack_only_sent.0);
        a.receive_packet(to_a.remove(0)).unwrap();
        assert_eq!(0, a.fragments_in_flight());
        assert_eq!(3, a.stats().fragments_acked.0);
    }

    #[test]
    fn resends_unacked_fragments() {
        let mut a = transport();
        let mut lost = Vec::new();
        a.send_reliably_and_in_order(&[1; 2000], collect(&mut lost))
            .unwrap();

        let mut resent = Vec::new();
        a.update(DT, collect(&mut resent));
        assert!(resent.is_empty());
        a.update(Duration::from_millis(100), collect(&mut resent));
        assert_eq!(2, resent.len());
        assert_eq!(2, a.stats().fragments_resent.0);

        // same fragment bytes, new ack header
        assert_eq!(lost[0][8..], resent[0][8..]);
        assert_ne!(lost[0][..8], resent[0][..8]);

        let mut b = transport();
        for packet in resent {
            b.receive_packet(packet).unwrap();
        }
        assert_eq!(2000, b.receive().unwrap().len());
    }

    #[test]
    fn head_of_line_blocking() {
        let mut a = transport();
        let mut b = transport();
        let mut packets = Vec::new();
        for msg in [&b"first"[..], b"second", b"third"] {
            a.send_reliably_and_in_order(msg, collect(&mut packets))
                .unwrap();
        }
        b.receive_packet(packets[1].clone()).unwrap();
        b.receive_packet(packets[2].clone()).unwrap();
        assert_eq!(None, b.receive());

        b.receive_packet(packets[0].clone()).unwrap();
        assert_eq!(Some(Bytes::from_static(b"first")), b.receive());
        assert_eq!(Some(Bytes::from_static(b"second")), b.receive());
        assert_eq!(Some(Bytes::from_static(b"third")), b.receive());
    }

    #[test]
    fn refuses_fragments_past_window() {
        let config = TransportConfig::default()
            .with_max_size_single_send(1024)
            .with_reassembly_capacity(4);
        let mut a = Transport::new(config.clone()).unwrap();
        let mut b = Transport::new(config).unwrap();
        let mut packets = Vec::new();
        for i in 0..4u8 {
            a.send_reliably_and_in_order(&[i], collect(&mut packets))
                .unwrap();
        }
        // let `a` send a fifth message once the first is acked
        let mut ack = Vec::new();
        b.receive_packet(packets[0].clone()).unwrap();
        b.update(Duration::from_millis(200), collect(&mut ack));
        a.receive_packet(ack.remove(0)).unwrap();
        a.send_reliably_and_in_order(&[4], collect(&mut packets))
            .unwrap();

        for packet in &packets[1..4] {
            b.receive_packet(packet.clone()).unwrap();
        }
        // message 4 is only accepted once message 0 is taken out
        assert_matches!(
            b.receive_packet(packets[4].clone()),
            Err(RecvError::WindowFull { .. })
        );
        assert_eq!(1, b.stats().fragments_refused.0);
        assert_eq!(Some(Bytes::from_static(&[0])), b.receive());

        let mut resent = Vec::new();
        a.update(Duration::from_millis(200), collect(&mut resent));
        for packet in resent {
            _ = b.receive_packet(packet);
        }
        for i in 1..5u8 {
            assert_eq!(Some(Bytes::from(vec![i])), b.receive());
        }
    }

    #[test]
    fn unreliable_messages() {
        let mut a = transport();
        let mut b = transport();
        let mut packets = Vec::new();
        a.send_unreliable(b"one", collect(&mut packets)).unwrap();
        a.send_unreliable(b"two", collect(&mut packets)).unwrap();

        b.receive_packet(packets[1].clone()).unwrap();
        b.receive_packet(packets[0].clone()).unwrap();
        assert_eq!(Some(Bytes::from_static(b"two")), b.receive_unreliable());
        assert_eq!(Some(Bytes::from_static(b"one")), b.receive_unreliable());
        assert_eq!(None, b.receive());

        // never resent
        let mut resent = Vec::new();
        a.update(Duration::from_secs(1), collect(&mut resent));
        assert!(resent.is_empty());
    }

    #[test]
    fn rejects_malformed() {
        let mut a = AckSystem::new(AckConfig::default()).unwrap();
        let mut b = transport();
        let mut send = |payload: &[u8]| {
            let mut out = None;
            a.send_packet(payload, |_, packet| out = Some(Bytes::copy_from_slice(packet)))
                .unwrap();
            out.unwrap()
        };

        assert_matches!(
            b.receive_packet(send(&[0, 0])),
            Err(RecvError::TooShort { len: 2 })
        );
        assert_matches!(
            b.receive_packet(send(&[9, 0, 0, 0, 1, 0, 0, 0, 0])),
            Err(RecvError::InvalidPrefix(_))
        );
        // size says 5, only 1 byte follows
        assert_matches!(
            b.receive_packet(send(&[0, 0, 0, 0, 1, 0, 0, 0, 5, 1])),
            Err(RecvError::SizeMismatch { size: 5, len: 1 })
        );
        // index past count
        assert_matches!(
            b.receive_packet(send(&[1, 0, 0, 0, 2, 0, 2, 0, 1, 1])),
            Err(RecvError::InvalidFragment { index: 2, count: 2 })
        );
        assert_eq!(4, b.stats().packets_invalid.0);
    }

    #[test]
    fn reset_drops_everything() {
        let mut a = transport();
        a.send_reliably_and_in_order(b"x", |_, _| {}).unwrap();
        a.reset();
        assert_eq!(0, a.fragments_in_flight());
        assert_eq!(TransportStats::default(), a.stats());
        assert_eq!(PacketSeq::new(0), a.ack_system().next_sequence());
    }
}
