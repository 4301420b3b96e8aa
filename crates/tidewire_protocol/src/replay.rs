//! See [`ReplayBuffer`].

/// Number of recent packet sequences a [`ReplayBuffer`] remembers.
pub const REPLAY_BUFFER_SIZE: usize = 256;

const EMPTY: u64 = u64::MAX;

/// Protects a connection against replayed packets.
///
/// An attacker may capture an encrypted packet and send it again later. The
/// copy still decrypts correctly, so after a packet is authenticated its
/// 64-bit sequence number is checked against this buffer, which rejects
/// sequences it has already seen and sequences too old to be tracked.
///
/// Only packets sent after the handshake (keepalive, payload, and disconnect)
/// are checked.
#[derive(Clone)]
pub struct ReplayBuffer {
    most_recent: u64,
    received: Box<[u64; REPLAY_BUFFER_SIZE]>,
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ReplayBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ReplayBuffer")
            .field("most_recent", &self.most_recent)
            .finish_non_exhaustive()
    }
}

impl ReplayBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            most_recent: 0,
            received: Box::new([EMPTY; REPLAY_BUFFER_SIZE]),
        }
    }

    #[expect(clippy::cast_possible_truncation, reason = "taken modulo the size")]
    const fn index(seq: u64) -> usize {
        (seq % REPLAY_BUFFER_SIZE as u64) as usize
    }

    /// Returns `true` if `seq` has already been received, or is too old to
    /// tell.
    #[must_use]
    pub fn already_received(&self, seq: u64) -> bool {
        if seq == EMPTY {
            return true;
        }
        if seq.saturating_add(REPLAY_BUFFER_SIZE as u64) <= self.most_recent {
            return true;
        }
        let stored = self.received[Self::index(seq)];
        stored != EMPTY && stored >= seq
    }

    /// Marks `seq` as received.
    ///
    /// Call this only once the packet has been authenticated.
    pub fn advance(&mut self, seq: u64) {
        if seq > self.most_recent {
            self.most_recent = seq;
        }
        self.received[Self::index(seq)] = seq;
    }

    /// Forgets every sequence received.
    pub fn reset(&mut self) {
        self.most_recent = 0;
        self.received.fill(EMPTY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_repeats() {
        let mut buf = ReplayBuffer::new();
        for seq in 0..1000 {
            assert!(!buf.already_received(seq));
            buf.advance(seq);
            assert!(buf.already_received(seq));
        }
    }

    #[test]
    fn out_of_order_within_window() {
        let mut buf = ReplayBuffer::new();
        buf.advance(10);
        assert!(!buf.already_received(5));
        buf.advance(5);
        assert!(buf.already_received(5));
        assert!(!buf.already_received(6));
    }

    #[test]
    fn rejects_too_old() {
        let mut buf = ReplayBuffer::new();
        buf.advance(1000);
        assert!(buf.already_received(1000 - 256));
        assert!(!buf.already_received(1000 - 255));
    }

    #[test]
    fn rejects_max_sequence() {
        let buf = ReplayBuffer::new();
        assert!(buf.already_received(u64::MAX));
    }

    #[test]
    fn reset_forgets() {
        let mut buf = ReplayBuffer::new();
        buf.advance(3);
        buf.reset();
        assert!(!buf.already_received(3));
    }
}
