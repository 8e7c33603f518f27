//! Fuzz harness for redaction and sanitization.
//!
//! Redaction must be a fixed point on arbitrary input, and CSV
//! sanitization must never leave a formula trigger in first position.

#![no_main]

use libfuzzer_sys::fuzz_target;
use planship_redact::redact;
use planship_sanitize::{escape_wiql, sanitize_for_csv};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    let once = redact(input);
    assert_eq!(redact(&once), once);

    let sanitized = sanitize_for_csv(input);
    let first = sanitized.trim_start().chars().next();
    assert!(!matches!(first, Some('=') | Some('+') | Some('@')));

    let _ = escape_wiql(input);
});
