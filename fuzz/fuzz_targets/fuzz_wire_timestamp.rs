//! Fuzz target for wire timestamp parsing.
//!
//! Tests that timestamp parsing never panics on arbitrary input and
//! that accepted values round-trip through the wire format.

#![no_main]

use libfuzzer_sys::fuzz_target;
use telemetry_relay::envelope::{format_wire_timestamp, parse_wire_timestamp};

fuzz_target!(|data: &str| {
    if let Ok(ts) = parse_wire_timestamp(data) {
        // Anything accepted must survive a format/parse round-trip.
        let wire = format_wire_timestamp(ts);
        let again = parse_wire_timestamp(&wire).expect("round-trip of accepted timestamp");
        assert_eq!(again, ts);
    }
});
