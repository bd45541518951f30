//! Fuzz target for sequenced delivery.
//!
//! Feeds a channel arbitrarily duplicated and reordered Data frames and
//! checks each payload reaches the flow once, in order.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tally_session::{Delivery, Payload, SessionChannel, SessionId};
use tally_types::{FlowId, PartyName};

#[derive(Debug, Arbitrary)]
struct Arrivals {
    seqs: Vec<u8>,
}

fuzz_target!(|input: Arrivals| {
    let party = PartyName::new("O=Fuzz").expect("valid name");
    let initiator = SessionId::new(FlowId::from_bytes([1u8; 16]), 0);
    let (mut channel, _confirm) = SessionChannel::accept(
        SessionId::new(FlowId::from_bytes([2u8; 16]), 0),
        party,
        "fuzz",
        initiator,
        None,
    );

    let mut delivered = Vec::new();
    for seq in input.seqs {
        let payload = Payload::of(&seq).expect("u8 serializes");
        channel.on_wire(u64::from(seq), Delivery::Data(payload));
        while let Ok(Some(payload)) = channel.take_next() {
            delivered.push(payload.decode::<u8>().expect("u8 payload"));
        }
    }

    for (expected, got) in delivered.iter().enumerate() {
        assert_eq!(expected, usize::from(*got));
    }
});
