//! Fuzz harness for the feature-file parser.
//!
//! Arbitrary text run through the Gherkin grammar and the flattening
//! logic must never panic; step conversion must accept whatever the
//! parser produced.

#![no_main]

use libfuzzer_sys::fuzz_target;
use planship_gherkin::parse_feature_str;
use planship_steps::convert_steps;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(scenarios) = parse_feature_str(input) {
        for scenario in scenarios {
            let _ = convert_steps(&scenario.steps);
        }
    }
});
