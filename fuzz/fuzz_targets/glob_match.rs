#![no_main]

use libfuzzer_sys::fuzz_target;
use numa_emu::glob;

fuzz_target!(|data: &[u8]| {
    // First line is the pattern, the rest is the text
    if let Ok(input) = std::str::from_utf8(data) {
        let (pattern, text) = input.split_once('\n').unwrap_or((input, ""));
        let _ = glob::matches(pattern, text);
    }
});
