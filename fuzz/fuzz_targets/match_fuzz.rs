//! Matcher fuzz target: run arbitrary input through a fixed record protocol.
//! Matching must fail with an error, never panic or allocate from hostile lengths.
//! Build with: cargo fuzz run match_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
const PROTO: &str = r#"
hdr = { kind uint8; len uint32 }
rec = {
    h hdr
    read h.len do case h.kind {
        1: { s cstring }
        2: { n uint32; items [n]uint16 }
        3: { depth uint8; if depth > 0 { inner rec } }
        default: { rest *byte }
    }
}
doc = *[rec]
"#;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    if let Ok(proto) = bpl::Protocol::from_str(PROTO, "fuzz.bpl") {
        let _ = proto.match_buffer(data);
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run match_fuzz");
}
