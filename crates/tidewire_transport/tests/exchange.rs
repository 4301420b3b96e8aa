#![expect(missing_docs, reason = "testing")]
#![expect(clippy::unwrap_used, reason = "testing")]
#![cfg(test)]

use {
    core::time::Duration,
    proptest::prelude::*,
    rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom},
    tidewire_transport::{
        octs::Bytes,
        seq::Seq,
        transport::{Transport, TransportConfig},
    },
};

const DT: Duration = Duration::from_millis(10);

/// One direction of an unreliable link which drops, duplicates and reorders
/// packets.
struct Pipe {
    rng: StdRng,
    loss: f64,
    duplicate: f64,
    in_flight: Vec<Bytes>,
}

impl Pipe {
    fn new(seed: u64, loss: f64, duplicate: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            loss,
            duplicate,
            in_flight: Vec::new(),
        }
    }

    fn push(&mut self, packet: &[u8]) {
        if self.rng.gen_bool(self.loss) {
            return;
        }
        let packet = Bytes::copy_from_slice(packet);
        if self.rng.gen_bool(self.duplicate) {
            self.in_flight.push(packet.clone());
        }
        self.in_flight.push(packet);
    }

    fn deliver(&mut self, to: &mut Transport) {
        self.in_flight.shuffle(&mut self.rng);
        for packet in self.in_flight.drain(..) {
            // refused and duplicate packets are fine here
            _ = to.receive_packet(packet);
        }
    }
}

fn exchange(msgs: &[Vec<u8>], seed: u64, loss: f64, duplicate: f64) -> Vec<Bytes> {
    let mut a = Transport::new(TransportConfig::default()).unwrap();
    let mut b = Transport::new(TransportConfig::default()).unwrap();
    let mut a_to_b = Pipe::new(seed, loss, duplicate);
    let mut b_to_a = Pipe::new(seed.wrapping_add(1), loss, duplicate);

    let mut to_send = msgs.iter();
    let mut received = Vec::new();
    for _ in 0..10_000 {
        if received.len() == msgs.len() {
            break;
        }
        if let Some(msg) = to_send.clone().next() {
            if a
                .send_reliably_and_in_order(msg, |_, packet| a_to_b.push(packet))
                .is_ok()
            {
                to_send.next();
            }
        }

        a.update(DT, |_, packet| a_to_b.push(packet));
        b.update(DT, |_, packet| b_to_a.push(packet));
        a_to_b.deliver(&mut b);
        b_to_a.deliver(&mut a);
        while let Some(msg) = b.receive() {
            received.push(msg);
        }
    }
    received
}

#[test]
fn lossless() {
    let msgs = (0..100u8).map(|i| vec![i; 10]).collect::<Vec<_>>();
    let received = exchange(&msgs, 0, 0.0, 0.0);
    assert_eq!(msgs.len(), received.len());
    for (sent, recv) in msgs.iter().zip(&received) {
        assert_eq!(&sent[..], &recv[..]);
    }
}

#[test]
fn lossy_with_large_messages() {
    let msgs = (0..20u8)
        .map(|i| vec![i; 500 + usize::from(i) * 700])
        .collect::<Vec<_>>();
    let received = exchange(&msgs, 1234, 0.25, 0.1);
    assert_eq!(msgs.len(), received.len());
    for (sent, recv) in msgs.iter().zip(&received) {
        assert_eq!(&sent[..], &recv[..]);
    }
}

proptest! {
    #[test]
    fn seq_order_within_half_range(a: u16, delta in 1u16..=32767) {
        let b = Seq(a.wrapping_add(delta));
        prop_assert!(b.greater_than(Seq(a)));
        prop_assert!(Seq(a).less_than(b));
        prop_assert!(Seq(a) < b);
    }

    #[test]
    fn delivery_order_matches_send_order(
        lens in prop::collection::vec(1usize..4000, 1..20),
        seed: u64,
    ) {
        let msgs = lens
            .iter()
            .enumerate()
            .map(|(i, &len)| vec![u8::try_from(i).unwrap(); len])
            .collect::<Vec<_>>();
        let received = exchange(&msgs, seed, 0.2, 0.2);
        prop_assert_eq!(msgs.len(), received.len());
        for (sent, recv) in msgs.iter().zip(&received) {
            prop_assert_eq!(&sent[..], &recv[..]);
        }
    }
}
