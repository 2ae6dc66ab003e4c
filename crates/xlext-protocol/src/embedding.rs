use serde_json::Value;

/// Serializes `value` as JSON that is safe to inline inside a `<script>` block.
///
/// `<`, `>` and `&` become unicode escapes so attacker-controlled strings can
/// never close the surrounding element or open a comment; U+2028/U+2029 are
/// escaped because some script parsers treat them as line terminators.
pub fn serialize_for_inline_embedding(value: &Value) -> String {
    let raw = value.to_string();
    let mut escaped = String::with_capacity(raw.len());
    for character in raw.chars() {
        match character {
            '<' => escaped.push_str("\\u003c"),
            '>' => escaped.push_str("\\u003e"),
            '&' => escaped.push_str("\\u0026"),
            '\u{2028}' => escaped.push_str("\\u2028"),
            '\u{2029}' => escaped.push_str("\\u2029"),
            other => escaped.push(other),
        }
    }
    escaped
}
