#![no_main]

use libfuzzer_sys::fuzz_target;
use numa_emu::aggregate::parse_sync_line;
use numa_emu::stats::{HotnessSample, NodePages, Sample};

fuzz_target!(|data: &[u8]| {
    // Accounting sources and logs are text; anything else is rejected upstream
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(pages) = NodePages::parse(input) {
            let _ = pages.to_sample(4096, 0.0);
        }
        let _ = HotnessSample::parse(input, 0.0);
        let _ = Sample::from_report_line(input);
        let _ = parse_sync_line(input);
    }
});
