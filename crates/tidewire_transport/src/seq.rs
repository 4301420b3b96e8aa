//! Wrapping 16-bit sequence numbers.
//!
//! Every packet sent through the ack layer, and every reliable message sent
//! through the transport, is identified by a sequence number which increases
//! by one on each send and wraps around from [`u16::MAX`] back to 0.

use {
    core::{
        cmp::Ordering,
        convert::Infallible,
        fmt,
        ops::{Add, AddAssign, Sub, SubAssign},
    },
    derive_more::{Add, AddAssign, Deref, DerefMut, Sub, SubAssign},
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Sequence number uniquely identifying an item sent across a network.
///
/// The number is stored internally as a [`u16`], which means it will wrap
/// around fairly quickly as many packets can be sent per second. Users of a
/// sequence number must take this into account, and use the wrapping
/// comparisons [`Seq::greater_than`] and [`Seq::less_than`] (which back the
/// [`Ord`] impl) instead of comparing the raw values.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Seq(pub u16);

/// Sequence number of a packet framed by the ack layer.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)] // force `#[derive]` on multiple lines
#[derive(Deref, DerefMut, Add, AddAssign, Sub, SubAssign)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PacketSeq(pub Seq);

/// Sequence number of a reliable message, used as the reassembly key.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)] // force `#[derive]` on multiple lines
#[derive(Deref, DerefMut, Add, AddAssign, Sub, SubAssign)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageSeq(pub Seq);

const HALF_RANGE: u16 = 32768;

impl Seq {
    /// Sequence number with the raw value 0.
    pub const ZERO: Self = Self(0);

    /// Returns `true` if `self` is logically newer than `other`.
    ///
    /// `a` is newer than `b` iff `a > b && a - b <= 32768`, or
    /// `a < b && b - a > 32768`. This treats e.g. `1` as newer than `65535`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tidewire_transport::seq::Seq;
    /// assert!(Seq(1).greater_than(Seq(0)));
    /// assert!(Seq(1).greater_than(Seq(u16::MAX)));
    /// assert!(!Seq(u16::MAX).greater_than(Seq(1)));
    /// assert!(!Seq(5).greater_than(Seq(5)));
    /// ```
    #[must_use]
    pub const fn greater_than(self, other: Self) -> bool {
        let (a, b) = (self.0, other.0);
        (a > b && a - b <= HALF_RANGE) || (a < b && b - a > HALF_RANGE)
    }

    /// Returns `true` if `self` is logically older than `other`.
    ///
    /// This is [`Seq::greater_than`] with the arguments swapped.
    #[must_use]
    pub const fn less_than(self, other: Self) -> bool {
        other.greater_than(self)
    }

    /// Gets a signed number for the value of sequences "elapsed" between
    /// `self` and `rhs`.
    ///
    /// This is effectively `rhs - self`, but taking into account wraparound and
    /// therefore returning a signed value. This will always return the smallest
    /// path around this "circle".
    ///
    /// ```text
    ///     65534  65535    0      1      2
    /// ... --|------|------|------|------|-- ...
    ///       ^             ^      ^      ^
    ///       |             +------+------+ 0.dist_to(2) = 2
    ///       |                    |        2.dist_to(0) = -2
    ///       +--------------------+ 65534.dist_to(1) = 3
    ///                              1.dist_to(65534) = -3
    /// ```
    ///
    /// # Examples
    ///
    /// ```
    /// # use tidewire_transport::seq::Seq;
    /// assert_eq!(Seq(0).dist_to(Seq(5)), 5);
    /// assert_eq!(Seq(2).dist_to(Seq(0)), -2);
    /// assert_eq!(Seq(u16::MAX).dist_to(Seq(3)), 4);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[expect(clippy::cast_possible_wrap, reason = "we want wrap behavior")]
        (rhs.0.wrapping_sub(self.0) as i16)
    }

    /// Returns the sequence number directly after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Seq").field(&self.0).finish()
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Ord for Seq {
    /// Logically compares `self` to `other` using [`Seq::greater_than`], so
    /// that `0 cmp 1` is [`Less`] but `0 cmp 65535` is [`Greater`].
    ///
    /// If the two values compared have a real difference of around
    /// `u16::MAX / 2`, the ordering is not transitive.
    ///
    /// [`Greater`]: Ordering::Greater
    /// [`Less`]: Ordering::Less
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        } else if self.greater_than(*other) {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl PartialOrd for Seq {
    /// See [`Seq::cmp`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for Seq {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Seq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Seq {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Seq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl FixedEncodeLen for Seq {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for Seq {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for Seq {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

//
// `PacketSeq`
//

impl PacketSeq {
    /// Creates a new sequence number from a raw number.
    #[must_use]
    pub const fn new(n: u16) -> Self {
        Self(Seq(n))
    }
}

impl fmt::Debug for PacketSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PacketSeq").field(&self.0.0).finish()
    }
}

impl FixedEncodeLen for PacketSeq {
    const ENCODE_LEN: usize = Seq::ENCODE_LEN;
}

impl Encode for PacketSeq {
    type Error = <Seq as Encode>::Error;

    fn encode(&self, dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        self.0.encode(dst)
    }
}

impl Decode for PacketSeq {
    type Error = <Seq as Decode>::Error;

    fn decode(src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Seq::decode(src).map(Self)
    }
}

//
// `MessageSeq`
//

impl MessageSeq {
    /// Creates a new sequence number from a raw number.
    #[must_use]
    pub const fn new(n: u16) -> Self {
        Self(Seq(n))
    }
}

impl fmt::Debug for MessageSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MessageSeq").field(&self.0.0).finish()
    }
}

impl FixedEncodeLen for MessageSeq {
    const ENCODE_LEN: usize = Seq::ENCODE_LEN;
}

impl Encode for MessageSeq {
    type Error = <Seq as Encode>::Error;

    fn encode(&self, dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        self.0.encode(dst)
    }
}

impl Decode for MessageSeq {
    type Error = <Seq as Decode>::Error;

    fn decode(src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Seq::decode(src).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, octs::test::*};

    #[test]
    fn encode_decode_all_seqs() {
        for seq in 0..u16::MAX {
            hint_round_trip(&Seq(seq));
        }
    }

    #[test]
    fn increasing_wraparound() {
        assert!(Seq(0) < Seq(1));
        assert!(Seq(1) < Seq(2));
        assert!(Seq(u16::MAX - 1) < Seq(u16::MAX));

        assert!(Seq(u16::MAX) < Seq(0));
        assert!(Seq(u16::MAX) < Seq(1));
        assert!(Seq(u16::MAX - 3) < Seq(2));
    }

    #[test]
    fn newer_across_wrap() {
        assert!(Seq(1).greater_than(Seq(65535)));
        assert!(Seq(65535).less_than(Seq(1)));
        assert!(!Seq(65535).greater_than(Seq(1)));
    }

    #[test]
    fn half_range_boundary() {
        // exactly half the range apart: the numerically larger one is newer
        assert!(Seq(32768).greater_than(Seq(0)));
        assert!(!Seq(0).greater_than(Seq(32768)));
        // just past half the range, the smaller one wins
        assert!(Seq(0).greater_than(Seq(32769)));
    }

    #[test]
    fn equal_is_neither() {
        assert!(!Seq(7).greater_than(Seq(7)));
        assert!(!Seq(7).less_than(Seq(7)));
        assert_eq!(Seq(7).cmp(&Seq(7)), Ordering::Equal);
    }

    #[test]
    fn typed_seqs_add() {
        assert_eq!(PacketSeq::new(u16::MAX) + PacketSeq::new(2), PacketSeq::new(1));
        assert_eq!(MessageSeq::new(3) - MessageSeq::new(5), MessageSeq::new(u16::MAX - 1));
    }
}
