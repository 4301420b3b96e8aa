//! See [`SeqBuf`].

use {
    crate::seq::Seq,
    alloc::{boxed::Box, vec::Vec},
    core::iter,
};

/// Rolling sequence buffer data structure.
///
/// This provides constant-time insertion, query, access, and removal of items
/// keyed by a wrapping [`Seq`]. This is achieved by using two arrays:
/// - `sequences`, an array of the sequence numbers stored in each slot
/// - `data`, an array of the `T`s holding the actual data
///
/// When accessing into this buffer using the key `k`, an index `i` is computed
/// using `k % capacity`. This means that **multiple keys map to the same
/// index**, so on every access we check that `sequences[i] == k` before
/// providing access to `data[i]`.
///
/// The buffer also tracks `current`, which is one past the newest sequence
/// inserted so far. Only the `capacity` sequences before `current` can be held
/// at any time: inserting a newer sequence clears every slot it supersedes,
/// and sequences older than `current - capacity` are *stale* and can't be
/// inserted at all.
///
/// This implementation is based on the article in [*Gaffer On Games*].
///
/// [*Gaffer On Games*]: https://gafferongames.com/post/reliable_ordered_messages#sequence-buffers
#[derive(Debug, Clone)]
pub struct SeqBuf<T> {
    current: Seq,
    sequences: Box<[u32]>,
    data: Box<[Option<T>]>,
    len: usize,
}

const EMPTY: u32 = u32::MAX;

/// Largest capacity a [`SeqBuf`] can be created with.
pub const MAX_CAPACITY: usize = 32768;

impl<T> SeqBuf<T> {
    /// Creates a new, empty sequence buffer with the given number of slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two, or is larger than
    /// [`MAX_CAPACITY`]. A power of two keeps `seq % capacity` consistent when
    /// the sequence number wraps around.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            is_valid_capacity(capacity),
            "capacity must be a power of two no larger than {MAX_CAPACITY}, was {capacity}"
        );
        Self {
            current: Seq::ZERO,
            sequences: iter::repeat_n(EMPTY, capacity).collect(),
            data: iter::repeat_with(|| None).take(capacity).collect(),
            len: 0,
        }
    }

    /// Gets the number of slots in this buffer.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.sequences.len()
    }

    /// Gets the number of elements currently stored.
    ///
    /// # Examples
    ///
    /// ```
    /// use tidewire_transport::{seq::Seq, seq_buf::SeqBuf};
    ///
    /// let mut buf = SeqBuf::<u32>::with_capacity(16);
    /// assert_eq!(0, buf.len());
    ///
    /// buf.insert(Seq(0), 123);
    /// assert_eq!(1, buf.len());
    ///
    /// buf.remove(Seq(0));
    /// assert_eq!(0, buf.len());
    /// ```
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Gets if there are no elements stored.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gets the sequence one past the newest sequence inserted or advanced to.
    #[must_use]
    pub const fn current(&self) -> Seq {
        self.current
    }

    fn index(&self, seq: Seq) -> usize {
        usize::from(seq.0) & (self.capacity() - 1)
    }

    fn capacity_seq(&self) -> Seq {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "capacity is at most 32768, which fits in a u16"
        )]
        Seq(self.capacity() as u16)
    }

    /// Returns `true` if `seq` is older than the window this buffer can hold.
    #[must_use]
    pub fn is_stale(&self, seq: Seq) -> bool {
        seq.less_than(self.current - self.capacity_seq())
    }

    /// Inserts a value for `seq`.
    ///
    /// If `seq` is newer than everything stored so far, this advances the
    /// buffer, dropping every value in the slots between the old and new
    /// [`SeqBuf::current`]. If another value already occupies `seq`'s slot, it
    /// is dropped.
    ///
    /// Returns [`None`] if `seq` is stale.
    ///
    /// # Examples
    ///
    /// ```
    /// use tidewire_transport::{seq::Seq, seq_buf::SeqBuf};
    ///
    /// let mut buf = SeqBuf::<&str>::with_capacity(16);
    /// buf.insert(Seq(3), "hello");
    /// assert_eq!(Some(&"hello"), buf.get(Seq(3)));
    /// assert_eq!(Seq(4), buf.current());
    ///
    /// // more than 16 behind `current` is too old
    /// assert!(buf.insert(Seq(3).next() - Seq(17), "world").is_none());
    /// ```
    pub fn insert(&mut self, seq: Seq, value: T) -> Option<&mut T> {
        self.insert_with(seq, value, |_, _| {})
    }

    /// Inserts a value for `seq`, passing every value that gets evicted to
    /// `evict` along with the sequence it was stored under.
    ///
    /// Each evicted value is passed to `evict` exactly once. See
    /// [`SeqBuf::insert`].
    pub fn insert_with(
        &mut self,
        seq: Seq,
        value: T,
        mut evict: impl FnMut(Seq, T),
    ) -> Option<&mut T> {
        if seq.next().greater_than(self.current) {
            self.clear_range(self.current, seq, &mut evict);
            self.current = seq.next();
        } else if self.is_stale(seq) {
            return None;
        }

        let index = self.index(seq);
        if let Some((old_seq, old)) = self.take_index(index) {
            evict(old_seq, old);
        }
        self.sequences[index] = u32::from(seq.0);
        self.len += 1;
        Some(self.data[index].insert(value))
    }

    /// Advances [`SeqBuf::current`] up to and including `seq` without
    /// inserting anything, dropping the values this supersedes.
    pub fn advance(&mut self, seq: Seq) {
        self.advance_with(seq, |_, _| {});
    }

    /// Like [`SeqBuf::advance`], but passes every evicted value to `evict`.
    pub fn advance_with(&mut self, seq: Seq, mut evict: impl FnMut(Seq, T)) {
        if seq.next().greater_than(self.current) {
            self.clear_range(self.current, seq, &mut evict);
            self.current = seq.next();
        }
    }

    // clears every slot for the sequences `from..=to`, or the whole table if
    // that range is at least as long as the buffer
    fn clear_range(&mut self, from: Seq, to: Seq, evict: &mut impl FnMut(Seq, T)) {
        let span = usize::from(to.0.wrapping_sub(from.0));
        if span < self.capacity() {
            let mut seq = from;
            for _ in 0..=span {
                let index = self.index(seq);
                if let Some((old_seq, old)) = self.take_index(index) {
                    evict(old_seq, old);
                }
                seq = seq.next();
            }
        } else {
            for index in 0..self.capacity() {
                if let Some((old_seq, old)) = self.take_index(index) {
                    evict(old_seq, old);
                }
            }
        }
    }

    fn take_index(&mut self, index: usize) -> Option<(Seq, T)> {
        let stored = self.sequences[index];
        if stored == EMPTY {
            return None;
        }
        self.sequences[index] = EMPTY;
        let value = self.data[index].take()?;
        self.len -= 1;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "non-empty slots always store a u16"
        )]
        Some((Seq(stored as u16), value))
    }

    /// Gets a reference to the value stored for exactly `seq`.
    #[must_use]
    pub fn get(&self, seq: Seq) -> Option<&T> {
        let index = self.index(seq);
        if self.sequences[index] == u32::from(seq.0) {
            self.data[index].as_ref()
        } else {
            None
        }
    }

    /// Gets a mutable reference to the value stored for exactly `seq`.
    #[must_use]
    pub fn get_mut(&mut self, seq: Seq) -> Option<&mut T> {
        let index = self.index(seq);
        if self.sequences[index] == u32::from(seq.0) {
            self.data[index].as_mut()
        } else {
            None
        }
    }

    /// Returns `true` if a value is stored for exactly `seq`.
    #[must_use]
    pub fn contains(&self, seq: Seq) -> bool {
        self.get(seq).is_some()
    }

    /// Removes and returns the value stored for exactly `seq`.
    pub fn remove(&mut self, seq: Seq) -> Option<T> {
        let index = self.index(seq);
        if self.sequences[index] == u32::from(seq.0) {
            self.take_index(index).map(|(_, value)| value)
        } else {
            None
        }
    }

    /// Gets the value in the raw slot `index`, whichever sequence it is
    /// stored under.
    ///
    /// Returns [`None`] if the slot is empty or `index` is out of bounds.
    #[must_use]
    pub fn at_index(&self, index: usize) -> Option<&T> {
        self.data.get(index)?.as_ref()
    }

    /// Iterates over every stored value along with its sequence, in slot
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (Seq, &T)> {
        self.sequences
            .iter()
            .zip(self.data.iter())
            .filter_map(|(&stored, value)| {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "non-empty slots always store a u16"
                )]
                let seq = Seq(stored as u16);
                value.as_ref().map(|value| (seq, value))
            })
    }

    /// Mutable version of [`SeqBuf::iter`].
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Seq, &mut T)> {
        self.sequences
            .iter()
            .zip(self.data.iter_mut())
            .filter_map(|(&stored, value)| {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "non-empty slots always store a u16"
                )]
                let seq = Seq(stored as u16);
                value.as_mut().map(|value| (seq, value))
            })
    }

    /// Builds an acknowledgement of the most recent sequences held.
    ///
    /// Returns `(ack, bits)` where `ack` is `current - 1`, and bit `i` of
    /// `bits` is set iff a value is stored for `ack - i`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tidewire_transport::{seq::Seq, seq_buf::SeqBuf};
    ///
    /// let mut buf = SeqBuf::with_capacity(64);
    /// for seq in [10, 11, 13] {
    ///     buf.insert(Seq(seq), ());
    /// }
    /// let (ack, bits) = buf.generate_ack_bits();
    /// assert_eq!(Seq(13), ack);
    /// assert_eq!(0b1101, bits);
    /// ```
    #[must_use]
    pub fn generate_ack_bits(&self) -> (Seq, u32) {
        let ack = self.current - Seq(1);
        let bits = (0..32u16)
            .filter(|&i| self.contains(ack - Seq(i)))
            .fold(0u32, |bits, i| bits | (1 << i));
        (ack, bits)
    }

    /// Drops every stored value and resets [`SeqBuf::current`] to 0.
    pub fn reset(&mut self) {
        self.reset_with(|_, _| {});
    }

    /// Like [`SeqBuf::reset`], but passes every stored value to `evict`.
    pub fn reset_with(&mut self, mut evict: impl FnMut(Seq, T)) {
        for index in 0..self.capacity() {
            if let Some((seq, value)) = self.take_index(index) {
                evict(seq, value);
            }
        }
        self.current = Seq::ZERO;
    }

    /// Removes every stored value and returns them, without touching
    /// [`SeqBuf::current`].
    pub fn drain(&mut self) -> Vec<(Seq, T)> {
        (0..self.capacity())
            .filter_map(|index| self.take_index(index))
            .collect()
    }
}

/// Returns `true` if `capacity` can be used to create a [`SeqBuf`].
#[must_use]
pub const fn is_valid_capacity(capacity: usize) -> bool {
    capacity.is_power_of_two() && capacity <= MAX_CAPACITY
}

#[cfg(test)]
mod tests {
    use {super::*, alloc::rc::Rc, core::cell::Cell};

    #[test]
    fn insert_find() {
        let mut buf = SeqBuf::with_capacity(16);
        buf.insert(Seq(5), "five");
        assert_eq!(Some(&"five"), buf.get(Seq(5)));
        assert_eq!(None, buf.get(Seq(5 + 16)));
        assert_eq!(None, buf.get(Seq(4)));
    }

    #[test]
    fn evicts_after_capacity() {
        const CAP: u16 = 16;
        let mut buf = SeqBuf::with_capacity(usize::from(CAP));
        buf.insert(Seq(100), 1);
        buf.insert(Seq(100 + CAP + 1), 2);
        assert_eq!(None, buf.get(Seq(100)));
        assert_eq!(Some(&2), buf.get(Seq(100 + CAP + 1)));
        assert_eq!(1, buf.len());
    }

    #[test]
    fn same_slot_newer_evicts_older() {
        let mut buf = SeqBuf::with_capacity(16);
        buf.insert(Seq(0), 1);
        buf.insert(Seq(16), 2);
        assert_eq!(None, buf.get(Seq(0)));
        assert_eq!(Some(&2), buf.get(Seq(16)));
    }

    #[test]
    fn stale_rejected() {
        let mut buf = SeqBuf::with_capacity(16);
        buf.insert(Seq(40), ());
        assert!(buf.is_stale(Seq(23)));
        assert!(buf.insert(Seq(23), ()).is_none());
        assert!(!buf.is_stale(Seq(25)));
        assert!(buf.insert(Seq(25), ()).is_some());
        assert_eq!(Seq(41), buf.current());
    }

    #[test]
    fn wraps_around() {
        let mut buf = SeqBuf::with_capacity(32);
        buf.insert(Seq(u16::MAX - 1), 'a');
        buf.insert(Seq(u16::MAX), 'b');
        buf.insert(Seq(0), 'c');
        buf.insert(Seq(1), 'd');
        assert_eq!(Seq(2), buf.current());
        assert_eq!(Some(&'a'), buf.get(Seq(u16::MAX - 1)));
        assert_eq!(Some(&'b'), buf.get(Seq(u16::MAX)));
        assert_eq!(Some(&'c'), buf.get(Seq(0)));
        assert_eq!(Some(&'d'), buf.get(Seq(1)));
    }

    #[test]
    fn ack_bits_with_gap() {
        let mut buf = SeqBuf::with_capacity(256);
        for seq in [10, 11, 13] {
            buf.insert(Seq(seq), ());
        }
        assert_eq!(Seq(14), buf.current());
        let (ack, bits) = buf.generate_ack_bits();
        assert_eq!(Seq(13), ack);
        assert_eq!(1, bits & 1);
        assert_eq!(0, bits & (1 << 1));
        assert_ne!(0, bits & (1 << 2));
        assert_ne!(0, bits & (1 << 3));
        assert_eq!(0, bits >> 4);
    }

    #[test]
    fn evict_hook_runs_once_per_value() {
        let evicted = Rc::new(Cell::new(0));
        let mut buf = SeqBuf::with_capacity(8);
        for seq in 0..8 {
            buf.insert_with(Seq(seq), seq, |_, _| evicted.set(evicted.get() + 1));
        }
        assert_eq!(0, evicted.get());

        // big gap: clears the whole table
        buf.insert_with(Seq(1000), 1000, |_, _| evicted.set(evicted.get() + 1));
        assert_eq!(8, evicted.get());
        assert_eq!(1, buf.len());

        buf.remove(Seq(1000));
        assert!(buf.is_empty());
        assert_eq!(8, evicted.get());
    }

    #[test]
    fn advance_clears_superseded() {
        let mut buf = SeqBuf::with_capacity(8);
        buf.insert(Seq(1), ());
        buf.insert(Seq(2), ());
        buf.advance(Seq(9));
        assert_eq!(Seq(10), buf.current());
        assert!(!buf.contains(Seq(1)));
        assert!(buf.contains(Seq(2)));
        buf.advance(Seq(10));
        assert!(!buf.contains(Seq(2)));
    }

    #[test]
    fn drop_frees_owned_values() {
        let value = Rc::new(());
        {
            let mut buf = SeqBuf::with_capacity(4);
            buf.insert(Seq(0), Rc::clone(&value));
            buf.insert(Seq(1), Rc::clone(&value));
            assert_eq!(3, Rc::strong_count(&value));
        }
        assert_eq!(1, Rc::strong_count(&value));
    }

    #[test]
    #[should_panic = "power of two"]
    fn rejects_odd_capacity() {
        _ = SeqBuf::<()>::with_capacity(100);
    }
}
