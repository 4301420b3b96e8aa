//! Transport packet header, and reassembly of fragmented messages.
//!
//! Every packet the [`Transport`] sends through the ack layer starts with a
//! [`FragmentHeader`]. A reliable message which fits in a single fragment is
//! sent with [`FragmentPrefix::Single`]; larger messages are split into
//! `fragment_size` chunks, each sent with [`FragmentPrefix::Fragment`], and
//! put back together on the receiving side by a [`FragmentReceiver`].
//!
//! [`Transport`]: crate::transport::Transport

use {
    crate::{seq::MessageSeq, seq_buf::SeqBuf},
    alloc::{vec, vec::Vec},
    bit_vec::BitVec,
    core::{convert::Infallible, fmt},
    derive_more::{Display, Error},
    octs::{BufTooShortOr, Bytes, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// What kind of transport packet a [`FragmentHeader`] starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[repr(u8)]
pub enum FragmentPrefix {
    /// Reliable message which fits in one fragment.
    Single = 0,
    /// One fragment of a reliable message split across multiple packets.
    Fragment = 1,
    /// Unreliable message, delivered at most once and in no particular order.
    Unreliable = 2,
    /// Empty packet which only exists to carry acknowledgements.
    AckOnly = 3,
}

/// Byte read as a [`FragmentPrefix`] is not a known prefix.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("invalid prefix {prefix}")]
pub struct InvalidPrefix {
    /// Byte that was read.
    pub prefix: u8,
}

impl TryFrom<u8> for FragmentPrefix {
    type Error = InvalidPrefix;

    fn try_from(prefix: u8) -> Result<Self, Self::Error> {
        match prefix {
            0 => Ok(Self::Single),
            1 => Ok(Self::Fragment),
            2 => Ok(Self::Unreliable),
            3 => Ok(Self::AckOnly),
            _ => Err(InvalidPrefix { prefix }),
        }
    }
}

impl FixedEncodeLen for FragmentPrefix {
    const ENCODE_LEN: usize = u8::ENCODE_LEN;
}

impl Encode for FragmentPrefix {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&(*self as u8))
    }
}

impl Decode for FragmentPrefix {
    type Error = InvalidPrefix;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let prefix = src
            .read::<u8>()
            .map_err(|_| BufTooShortOr::<InvalidPrefix>::TooShort)?;
        Self::try_from(prefix).map_err(BufTooShortOr::Or)
    }
}

/// Header at the start of every transport packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct FragmentHeader {
    /// Kind of packet.
    pub prefix: FragmentPrefix,
    /// Reassembly sequence of the message this fragment belongs to.
    ///
    /// Only meaningful for reliable messages.
    pub seq: MessageSeq,
    /// Number of fragments the message was split into.
    pub count: u16,
    /// Index of this fragment in `0..count`.
    pub index: u16,
    /// Number of payload bytes following this header.
    pub size: u16,
}

impl FragmentHeader {
    /// Returns `true` if this is the final fragment of its message.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.index.wrapping_add(1) == self.count
    }
}

impl fmt::Debug for FragmentHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FragmentHeader")
            .field("prefix", &self.prefix)
            .field("seq", &self.seq.0.0)
            .field("index", &format_args!("{}/{}", self.index, self.count))
            .field("size", &self.size)
            .finish()
    }
}

impl FixedEncodeLen for FragmentHeader {
    const ENCODE_LEN: usize = FragmentPrefix::ENCODE_LEN
        + MessageSeq::ENCODE_LEN
        + u16::ENCODE_LEN
        + u16::ENCODE_LEN
        + u16::ENCODE_LEN;
}

impl Encode for FragmentHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.prefix)?;
        dst.write(&self.seq)?;
        dst.write(&self.count)?;
        dst.write(&self.index)?;
        dst.write(&self.size)?;
        Ok(())
    }
}

impl Decode for FragmentHeader {
    type Error = InvalidPrefix;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let prefix = src.read()?;
        let too_short = |_: BufTooShortOr<Infallible>| BufTooShortOr::<InvalidPrefix>::TooShort;
        Ok(Self {
            prefix,
            seq: src.read().map_err(too_short)?,
            count: src.read().map_err(too_short)?,
            index: src.read().map_err(too_short)?,
            size: src.read().map_err(too_short)?,
        })
    }
}

/// Failed to add a fragment to a [`FragmentReceiver`].
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ReassembleError {
    /// Fragment with this index was already received for this message.
    #[display("already received fragment {index}")]
    AlreadyReceived {
        /// Index of the fragment.
        index: u16,
    },
    /// Fragment claims a different fragment count than earlier fragments of
    /// the same message.
    #[display("fragment count {count} does not match earlier count {expected}")]
    CountMismatch {
        /// Count in this fragment's header.
        count: u16,
        /// Count the message was started with.
        expected: u16,
    },
    /// Payload length does not fit the fragment's position.
    #[display("fragment {index} has invalid length {len}")]
    InvalidLength {
        /// Index of the fragment.
        index: u16,
        /// Length of the payload.
        len: usize,
    },
}

#[derive(Debug, Clone)]
struct Reassembly {
    count: u16,
    num_received: u16,
    received: BitVec,
    last_len: Option<usize>,
    buf: Vec<u8>,
}

impl Reassembly {
    fn new(count: u16, fragment_size: usize) -> Self {
        Self {
            count,
            num_received: 0,
            received: BitVec::from_elem(usize::from(count), false),
            last_len: None,
            buf: vec![0; usize::from(count) * fragment_size],
        }
    }
}

/// Reassembles fragmented messages, keyed by their [`MessageSeq`].
///
/// Partially received messages are held in a [`SeqBuf`], so a message which
/// never completes is dropped once enough newer messages start arriving.
///
/// This does not validate the [`FragmentHeader`] against any limits; the
/// caller must check that `index < count`, and that `count * fragment_size`
/// is an acceptable amount of memory to allocate, before calling
/// [`FragmentReceiver::reassemble`].
#[derive(Debug, Clone)]
pub struct FragmentReceiver {
    fragment_size: usize,
    msgs: SeqBuf<Reassembly>,
}

impl FragmentReceiver {
    /// Creates a receiver for fragments of `fragment_size` bytes, holding up
    /// to `capacity` partially received messages at once.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a valid [`SeqBuf`] capacity.
    #[must_use]
    pub fn new(fragment_size: usize, capacity: usize) -> Self {
        Self {
            fragment_size,
            msgs: SeqBuf::with_capacity(capacity),
        }
    }

    /// Gets the number of messages which are partially received.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.msgs.len()
    }

    /// Returns `true` if no messages are partially received.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    /// Adds a fragment of the message `seq`.
    ///
    /// Returns the full message once its last missing fragment arrives, at
    /// which point all state for `seq` is freed.
    ///
    /// # Errors
    ///
    /// Errors if the fragment is a duplicate, or is inconsistent with the
    /// fragments received before it. No state is changed in this case.
    pub fn reassemble(
        &mut self,
        seq: MessageSeq,
        count: u16,
        index: u16,
        payload: &[u8],
    ) -> Result<Option<Bytes>, ReassembleError> {
        let fragment_size = self.fragment_size;
        let is_last = index.wrapping_add(1) == count;
        if payload.is_empty()
            || payload.len() > fragment_size
            || (!is_last && payload.len() != fragment_size)
        {
            return Err(ReassembleError::InvalidLength {
                index,
                len: payload.len(),
            });
        }

        if self.msgs.get(*seq).is_none() {
            self.msgs.insert(*seq, Reassembly::new(count, fragment_size));
        }
        let Some(msg) = self.msgs.get_mut(*seq) else {
            // `seq` is stale
            return Err(ReassembleError::AlreadyReceived { index });
        };

        if msg.count != count {
            return Err(ReassembleError::CountMismatch {
                count,
                expected: msg.count,
            });
        }
        let index_usize = usize::from(index);
        if msg.received.get(index_usize) != Some(false) {
            return Err(ReassembleError::AlreadyReceived { index });
        }

        let start = index_usize * fragment_size;
        msg.buf[start..start + payload.len()].copy_from_slice(payload);
        msg.received.set(index_usize, true);
        msg.num_received += 1;
        if is_last {
            msg.last_len = Some(payload.len());
        }

        if msg.num_received < msg.count {
            return Ok(None);
        }

        let Some(mut msg) = self.msgs.remove(*seq) else {
            return Ok(None);
        };
        let total_len =
            usize::from(msg.count - 1) * fragment_size + msg.last_len.unwrap_or(fragment_size);
        msg.buf.truncate(total_len);
        Ok(Some(Bytes::from(msg.buf)))
    }

    /// Drops the partially received message `seq`, if any.
    pub fn remove(&mut self, seq: MessageSeq) {
        self.msgs.remove(*seq);
    }

    /// Drops all partially received messages.
    pub fn reset(&mut self) {
        self.msgs.reset();
    }
}

/// Splits `msg` into `fragment_size` chunks, returning each chunk's index.
///
/// # Panics
///
/// Panics if `fragment_size` is 0.
pub fn split(
    fragment_size: usize,
    msg: &[u8],
) -> impl ExactSizeIterator<Item = (usize, &[u8])> + DoubleEndedIterator {
    msg.chunks(fragment_size).enumerate()
}
