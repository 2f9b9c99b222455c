//! Fuzz target for the dynamic value codec.
//!
//! The reader walks untrusted payloads by their embedded signature; it
//! must reject rather than over-read or panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qibus_proto::{ByteReader, Value};

fuzz_target!(|data: &[u8]| {
    let mut reader = ByteReader::new(data);
    let _ = Value::read(&mut reader);
});
