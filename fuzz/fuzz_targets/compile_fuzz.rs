//! Compiler fuzz target: feed arbitrary bytes to the BPL compiler.
//! Compilation must not panic; it returns Ok(Protocol) or Err(CompileError).
//! Build with: cargo fuzz run compile_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let _ = bpl::Protocol::compile(data, "fuzz.bpl");
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run compile_fuzz");
}
