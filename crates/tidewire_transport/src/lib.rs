#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
//! Acknowledgement and reliable-ordered transport layer for `tidewire`.
//!
//! This crate is sans-IO: nothing here touches a socket or reads a clock. The
//! caller feeds received packets in, advances time with [`Duration`] deltas,
//! and passes a send callback which receives every packet that should be sent
//! to the peer.
//!
//! The layers, from the bottom up:
//! - [`seq`]: 16-bit wrapping sequence numbers
//! - [`seq_buf`]: rolling buffers keyed by those sequence numbers
//! - [`ack`]: per-packet acknowledgement, RTT, loss and bandwidth estimation
//! - [`frag`]: transport packet header and message reassembly
//! - [`transport`]: fragmentation, reassembly, resending, and in-order
//!   delivery of reliable messages on top of [`ack`]
//!
//! [`Duration`]: core::time::Duration

extern crate alloc;

pub mod ack;
pub mod frag;
pub mod seq;
pub mod seq_buf;
pub mod transport;

pub use octs;

use {
    core::convert::Infallible,
    octs::{BufTooShortOr, BytesMut, Encode, FixedEncodeLen, Write},
};

/// Largest packet, including the ack header, that the ack layer produces or
/// accepts.
///
/// Each of these packets is carried inside one encrypted protocol payload, so
/// this must agree with the protocol's maximum payload size.
pub const MAX_PACKET_LEN: usize = 1205;

/// Writes `header` followed by `payload` into a new buffer.
///
/// This cannot fail: `H` has no encoding errors of its own, and a
/// [`BytesMut`] grows instead of running out of space, so
/// [`BufTooShortOr::TooShort`] is never produced.
pub(crate) fn frame<H>(header: &H, payload: &[u8]) -> BytesMut
where
    H: Encode<Error = Infallible> + FixedEncodeLen,
{
    let mut packet = BytesMut::with_capacity(H::ENCODE_LEN + payload.len());
    match packet.write(header) {
        Ok(()) | Err(BufTooShortOr::TooShort) => {}
        Err(BufTooShortOr::Or(never)) => match never {},
    }
    packet.extend_from_slice(payload);
    packet
}

#[cfg(test)]
mod tests {
    use {super::*, crate::seq::PacketSeq};

    #[test]
    fn frame_writes_header_then_payload() {
        let packet = frame(&PacketSeq::new(0x1234), b"payload");
        assert_eq!(PacketSeq::ENCODE_LEN + 7, packet.len());
        assert_eq!(&[0x12, 0x34], &packet[..2]);
        assert_eq!(b"payload", &packet[2..]);
    }
}
