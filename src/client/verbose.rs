//! Request/response dumper for `--verbose`

use crate::protocol::Message;
use serde_json::Value;
use std::io::Write;

/// Dumps longer than this are cut
pub const MAX_DUMP_BYTES: usize = 4096;

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "apikey",
    "api_key",
    "credential",
];

/// Which way a frame travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn marker(self) -> &'static str {
        match self {
            Direction::Sent => ">>>",
            Direction::Received => "<<<",
        }
    }
}

fn is_sensitive(key: &str) -> bool {
    SENSITIVE_KEYS.contains(&key.to_ascii_lowercase().as_str())
}

/// Copy of `value` with every sensitive key's value replaced by `***`
pub fn mask_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let masked = if is_sensitive(key) {
                        Value::String("***".to_string())
                    } else {
                        mask_sensitive(value)
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive).collect()),
        other => other.clone(),
    }
}

/// Cut `text` to `limit` bytes on a char boundary, noting the original size
pub fn truncate_dump(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes, truncated)", &text[..end], text.len())
}

/// Render one frame the way the dumper prints it
pub fn format_frame(direction: Direction, message: &Message) -> String {
    let body = match serde_json::to_value(message) {
        Ok(value) => {
            let masked = mask_sensitive(&value);
            serde_json::to_string_pretty(&masked).unwrap_or_else(|_| masked.to_string())
        }
        Err(e) => format!("<unserializable {}: {}>", message.kind(), e),
    };
    format!("{} {}", direction.marker(), truncate_dump(body, MAX_DUMP_BYTES))
}

/// Print a frame to stderr, leaving stdout for command results
pub fn dump_to_stderr(direction: Direction, message: &Message) {
    let line = format_frame(direction, message);
    let _ = writeln!(std::io::stderr().lock(), "{}", line);
}
