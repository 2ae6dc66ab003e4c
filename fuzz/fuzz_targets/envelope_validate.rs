#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use xlext_protocol::{is_valid_envelope, parse_envelope, EXTENSION_SANDBOX_CHANNEL};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    let valid = is_valid_envelope(&raw);
    if let Some(envelope) = parse_envelope(&raw) {
        assert!(valid);
        assert_eq!(envelope.channel, EXTENSION_SANDBOX_CHANNEL);
        assert!(is_valid_envelope(&envelope.to_value()));
    }
});
