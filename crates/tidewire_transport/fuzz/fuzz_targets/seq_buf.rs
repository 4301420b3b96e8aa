#![no_main]

use {
    arbitrary::Arbitrary,
    libfuzzer_sys::fuzz_target,
    tidewire_transport::{seq::Seq, seq_buf::SeqBuf},
};

#[derive(Debug, Arbitrary)]
enum OpKind {
    Insert,
    Remove,
    Advance,
}

#[derive(Debug, Arbitrary)]
struct Op {
    kind: OpKind,
    key: u16,
    value: u16,
}

fuzz_target!(|input: Box<[Op]>| {
    let mut buf = SeqBuf::<u16>::with_capacity(1024);

    for op in input {
        let key = Seq(op.key);
        match op.kind {
            OpKind::Insert => {
                if buf.insert(key, op.value).is_some() {
                    assert_eq!(Some(&op.value), buf.get(key));
                } else {
                    assert!(buf.is_stale(key));
                }
            }
            OpKind::Remove => {
                buf.remove(key);
                assert!(!buf.contains(key));
            }
            OpKind::Advance => {
                buf.advance(key);
            }
        }
        assert!(buf.len() <= buf.capacity());
    }
});
