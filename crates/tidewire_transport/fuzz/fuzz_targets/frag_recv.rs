#![no_main]

use {
    libfuzzer_sys::fuzz_target,
    tidewire_transport::{frag::FragmentReceiver, seq::MessageSeq},
};

fuzz_target!(|input: (MessageSeq, u8, u8, &[u8])| {
    let (seq, count, index, payload) = input;

    const FRAGMENT_SIZE: usize = 32;
    const CAPACITY: usize = 64;

    // callers must check this themselves
    if index >= count {
        return;
    }
    let mut recv = FragmentReceiver::new(FRAGMENT_SIZE, CAPACITY);
    _ = recv.reassemble(seq, u16::from(count), u16::from(index), payload);
});
