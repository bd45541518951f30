//! Fuzz target for the session wire decoder.
//!
//! Arbitrary frames must decode or fail cleanly, and anything that decodes
//! must survive a re-encode unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tally_session::SessionMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = SessionMessage::decode(data) {
        let _ = message.kind();
        let _ = message.target_flow();
        if let Ok(encoded) = message.encode() {
            let again = SessionMessage::decode(&encoded).expect("re-encoded frame must decode");
            assert_eq!(again, message);
        }
    }
});
