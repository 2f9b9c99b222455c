//! Fuzz target for framed message parsing.
//!
//! Arbitrary bytes must never panic the parser; truncated headers,
//! oversized length fields and bad magic values all surface as errors.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qibus_proto::Message;

fuzz_target!(|data: &[u8]| {
    let _ = Message::from_bytes(data);
});
