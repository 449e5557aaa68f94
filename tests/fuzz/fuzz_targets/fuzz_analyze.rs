#![no_main]
use libfuzzer_sys::fuzz_target;

use covlua::{Analyzer, Config};

fuzz_target!(|data: &[u8]| {
    // Analysis never fails and covers every line.
    if let Ok(s) = std::str::from_utf8(data) {
        let analysis = Analyzer::new(&Config::default()).analyze(s, "/fuzz.lua");
        assert_eq!(analysis.line_count(), s.lines().count());
    }
});
