//! Human-readable rendering of a matched DOM and of raw bytes.

use crate::value::Value;
use std::fmt::Write;

const INDENT: &str = "  ";

/// Render a DOM value: lists and maps one entry per line, map keys sorted,
/// keys starting with `_` hidden, byte arrays as hex dumps.
pub fn dump_dom(v: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, v, 0);
    out.push('\n');
    out
}

fn pad(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str(INDENT);
    }
}

fn write_value(out: &mut String, v: &Value, level: usize) {
    match v {
        Value::Nil => out.push_str("<nil>"),
        Value::List(items) if items.is_empty() => out.push_str("[]"),
        Value::List(items) => {
            out.push_str("[\n");
            for item in items {
                pad(out, level + 1);
                write_value(out, item, level + 1);
                out.push_str(",\n");
            }
            pad(out, level);
            out.push(']');
        }
        Value::Map(m) => {
            let visible: Vec<_> = m.iter().filter(|(k, _)| !k.starts_with('_')).collect();
            if visible.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{\n");
            for (k, item) in visible {
                pad(out, level + 1);
                out.push_str(k);
                out.push_str(": ");
                write_value(out, item, level + 1);
                out.push_str(",\n");
            }
            pad(out, level);
            out.push('}');
        }
        Value::Bytes(b) if b.is_empty() => out.push_str("<empty bytes>"),
        Value::Bytes(b) => {
            out.push('\n');
            for line in hex_dump(b).lines() {
                pad(out, level + 1);
                out.push_str(line);
                out.push('\n');
            }
            pad(out, level);
        }
        scalar => out.push_str(&scalar.to_json()),
    }
}

/// Classic 16-bytes-per-line hex dump with offsets and an ASCII column.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{:02x} ", b);
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &b in chunk {
            out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn hex_dump_layout() {
        let text = hex_dump(b"Hello\0foo");
        assert_eq!(
            text,
            "00000000  48 65 6c 6c 6f 00 66 6f  6f                       |Hello.foo|\n"
        );
        assert_eq!(hex_dump(&[0u8; 17]).lines().count(), 2);
        assert!(hex_dump(&[]).is_empty());
    }

    #[test]
    fn dom_hides_underscore_keys() {
        let mut m = BTreeMap::new();
        m.insert("b".to_string(), Value::U8(2));
        m.insert("_type".to_string(), Value::I64(1));
        m.insert("a".to_string(), Value::List(vec![Value::from("x"), Value::Nil]));
        let text = dump_dom(&Value::Map(m));
        assert_eq!(text, "{\n  a: [\n    \"x\",\n    <nil>,\n  ],\n  b: 2,\n}\n");
    }

    #[test]
    fn dom_bytes_render_as_hex() {
        let text = dump_dom(&Value::List(vec![Value::Bytes(b"AB".to_vec())]));
        assert!(text.contains("00000000  41 42"));
        assert!(text.contains("|AB|"));
    }
}
