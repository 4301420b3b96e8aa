#![no_main]

use {
    libfuzzer_sys::fuzz_target,
    tidewire_transport::{
        octs::Bytes,
        transport::{Transport, TransportConfig},
    },
};

fuzz_target!(|packets: Vec<&[u8]>| {
    let mut transport = Transport::new(TransportConfig::default()).unwrap();
    for packet in packets {
        _ = transport.receive_packet(Bytes::copy_from_slice(packet));
        while transport.receive().is_some() {}
    }
});
