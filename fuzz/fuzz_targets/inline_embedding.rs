#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use xlext_protocol::serialize_for_inline_embedding;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data).into_owned();
    let embedded = serialize_for_inline_embedding(&Value::String(text.clone()));
    assert!(!embedded.contains('<'));
    assert!(!embedded.contains('\u{2028}'));
    assert!(!embedded.contains('\u{2029}'));
    let decoded = serde_json::from_str::<Value>(&embedded).expect("embedding stays valid json");
    assert_eq!(decoded, Value::String(text));
});
