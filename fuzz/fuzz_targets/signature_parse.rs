//! Fuzz target for the signature grammar.
//!
//! Any string must either parse into a type that prints back to itself or
//! be rejected; deep nesting must not blow the stack.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qibus_proto::Type;

fuzz_target!(|data: &str| {
    if let Ok(parsed) = Type::parse(data) {
        let printed = parsed.signature();
        let reparsed = Type::parse(&printed).expect("printed signature must parse");
        assert_eq!(reparsed, parsed);
    }
});
