//! Fuzz target for capability map decoding.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qibus_proto::CapabilityMap;

fuzz_target!(|data: &[u8]| {
    if let Ok(map) = CapabilityMap::from_payload(data) {
        // Whatever decoded must re-encode without panicking.
        let _ = map.to_payload();
        let _ = map.state();
    }
});
