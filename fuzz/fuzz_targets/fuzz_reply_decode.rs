//! Fuzz target for reply envelope decoding.
//!
//! Reply payloads come from the network and must never be trusted: any
//! input either parses into a well-formed envelope or is rejected as a
//! protocol error. Panics are bugs.

#![no_main]

use libfuzzer_sys::fuzz_target;
use telemetry_relay::envelope::decode_reply;

fuzz_target!(|data: &[u8]| {
    match decode_reply(data) {
        Ok(reply) => {
            // A parsed envelope must re-encode; the identifier survives.
            let json = serde_json::to_vec(&reply).expect("re-encode of valid reply");
            let again = decode_reply(&json).expect("decode of re-encoded reply");
            assert_eq!(again.correlation_id, reply.correlation_id);
        }
        Err(_) => {} // rejection is the expected path for garbage
    }
});
