#![no_main]
use libfuzzer_sys::fuzz_target;

use covlua::instrument::{instrument, InstrumentOptions};

fuzz_target!(|data: &[u8]| {
    // Every original line maps to an output line that maps back to it.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(out) = instrument(s, "/fuzz.lua", &InstrumentOptions::default()) {
            let output_lines = out.text.lines().count() as u32;
            for original in 1..=s.lines().count() as u32 {
                let n = out.sourcemap.transformed(original).unwrap();
                assert!(n <= output_lines);
                assert_eq!(out.sourcemap.original(n), Some(original));
            }
        }
    }
});
