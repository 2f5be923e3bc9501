//! Fuzzes the command payload decoder: arbitrary bytes either decode to
//! a command that re-encodes, or fail cleanly.

#![no_main]

use estuary::pipeline::Command;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(command) = Command::decode(data) {
        // Whatever decodes must re-encode.
        command.encode().unwrap();
    }
});
