//! Fuzz harness for the JUnit result parser.
//!
//! Malformed XML must produce an error or a partial record list, never a
//! panic, and every extracted attachment path must respect the length
//! bound.

#![no_main]

use libfuzzer_sys::fuzz_target;
use planship_junit::parse_junit_str;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(cases) = parse_junit_str(input) {
        for case in cases {
            if let Some(err) = case.error_message {
                assert!(err.chars().count() <= planship_junit::MAX_ERROR_LEN);
            }
            for attachment in case.attachments {
                assert!(attachment.len() <= 4096);
            }
        }
    }
});
