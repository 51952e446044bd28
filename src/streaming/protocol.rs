//! The `key TAB value` line protocol.
//!
//! One record per line. The key runs up to the first TAB and the value is
//! everything after it; a line without a TAB is a bare key with an empty
//! value. Lines end in `\n`, optionally preceded by `\r`.

use bytes::Bytes;

use crate::{KeyValue, Value};

/// Strip one trailing `\n` or `\r\n`.
pub fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parse one line. Never fails.
pub fn parse_line(line: &[u8]) -> KeyValue {
    let line = trim_line_end(line);
    match line.iter().position(|&b| b == b'\t') {
        Some(tab) => KeyValue {
            key: Bytes::copy_from_slice(&line[..tab]),
            value: Value::from_raw(&line[tab + 1..]),
        },
        None => KeyValue {
            key: Bytes::copy_from_slice(line),
            value: Value::default(),
        },
    }
}

/// Format one record as a newline-terminated line.
pub fn format_line(kv: &KeyValue) -> Vec<u8> {
    let value = kv.value.encode();
    let mut line = Vec::with_capacity(kv.key.len() + value.len() + 2);
    line.extend_from_slice(&kv.key);
    if !value.is_empty() {
        line.push(b'\t');
        line.extend_from_slice(&value);
    }
    line.push(b'\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_tab_only() {
        let kv = parse_line(b"k\tv1\tv2\n");
        assert_eq!(kv.key, Bytes::from_static(b"k"));
        assert_eq!(kv.value, Value::from("v1\tv2"));
    }

    #[test]
    fn bare_key_has_empty_value() {
        let kv = parse_line(b"onlykey\r\n");
        assert_eq!(kv.key, Bytes::from_static(b"onlykey"));
        assert_eq!(kv.value, Value::from(""));
    }

    #[test]
    fn tab_with_nothing_after_is_empty_value() {
        let kv = parse_line(b"k\t");
        assert_eq!(kv.key, Bytes::from_static(b"k"));
        assert!(kv.value.is_empty());
    }

    #[test]
    fn empty_values_format_as_bare_key() {
        assert_eq!(format_line(&KeyValue::new("a", "1")), b"a\t1\n");
        assert_eq!(format_line(&KeyValue::new("a", "")), b"a\n");
    }

    #[test]
    fn only_one_line_ending_is_trimmed() {
        assert_eq!(trim_line_end(b"x\r\n"), b"x");
        assert_eq!(trim_line_end(b"x\n\n"), b"x\n");
        assert_eq!(trim_line_end(b"x"), b"x");
    }
}
