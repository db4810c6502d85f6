//! Canonical encoder.

use crate::value::Value;

// CBOR major types used by this subset.
const MAJOR_UINT: u8 = 0;
const MAJOR_NINT: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;

const SIMPLE_FALSE: u8 = 0xf4;
const SIMPLE_TRUE: u8 = 0xf5;
const SIMPLE_NULL: u8 = 0xf6;

/// Encodes a value to its canonical byte form.
///
/// Integers use the shortest length form; map entries are written in the
/// order stored on the value, which [`Value::map`] keeps canonical.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_into(&mut out, value);
    out
}

fn encode_into(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(SIMPLE_NULL),
        Value::Bool(false) => out.push(SIMPLE_FALSE),
        Value::Bool(true) => out.push(SIMPLE_TRUE),
        Value::Int(n) => {
            if *n >= 0 {
                write_head(out, MAJOR_UINT, *n as u64);
            } else {
                write_head(out, MAJOR_NINT, !(*n) as u64);
            }
        }
        Value::Bytes(b) => {
            write_head(out, MAJOR_BYTES, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::Text(s) => {
            write_head(out, MAJOR_TEXT, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            write_head(out, MAJOR_ARRAY, items.len() as u64);
            for item in items {
                encode_into(out, item);
            }
        }
        Value::Map(entries) => {
            write_head(out, MAJOR_MAP, entries.len() as u64);
            for (key, val) in entries {
                write_head(out, MAJOR_TEXT, key.len() as u64);
                out.extend_from_slice(key.as_bytes());
                encode_into(out, val);
            }
        }
    }
}

/// Writes a major type + argument using the shortest form.
fn write_head(out: &mut Vec<u8>, major: u8, arg: u64) {
    let m = major << 5;
    if arg < 24 {
        out.push(m | arg as u8);
    } else if arg <= 0xff {
        out.push(m | 24);
        out.push(arg as u8);
    } else if arg <= 0xffff {
        out.push(m | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= 0xffff_ffff {
        out.push(m | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(m | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_ints_are_one_byte() {
        assert_eq!(encode(&Value::Int(0)), vec![0x00]);
        assert_eq!(encode(&Value::Int(23)), vec![0x17]);
        assert_eq!(encode(&Value::Int(-1)), vec![0x20]);
    }

    #[test]
    fn larger_ints_use_shortest_form() {
        assert_eq!(encode(&Value::Int(24)), vec![0x18, 24]);
        assert_eq!(encode(&Value::Int(256)), vec![0x19, 0x01, 0x00]);
    }

    #[test]
    fn simple_values() {
        assert_eq!(encode(&Value::Null), vec![0xf6]);
        assert_eq!(encode(&Value::Bool(true)), vec![0xf5]);
        assert_eq!(encode(&Value::Bool(false)), vec![0xf4]);
    }

    #[test]
    fn text_and_bytes() {
        assert_eq!(encode(&Value::Text("ab".into())), vec![0x62, b'a', b'b']);
        assert_eq!(encode(&Value::Bytes(vec![9])), vec![0x41, 9]);
    }

    #[test]
    fn equal_maps_encode_identically() {
        let a = Value::map(vec![
            ("x".into(), Value::Int(1)),
            ("y".into(), Value::Int(2)),
        ]);
        let b = Value::map(vec![
            ("y".into(), Value::Int(2)),
            ("x".into(), Value::Int(1)),
        ]);
        assert_eq!(encode(&a), encode(&b));
    }
}
