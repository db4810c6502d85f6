//! Decoder for the canonical encoding.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Decodes a single value from `bytes`.
///
/// The entire input must be consumed; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> CodecResult<Value> {
    let mut d = Decoder { bytes, pos: 0 };
    let value = d.read_value()?;
    if d.pos != bytes.len() {
        return Err(CodecError::TrailingBytes {
            remaining: bytes.len() - d.pos,
        });
    }
    Ok(value)
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn read_value(&mut self) -> CodecResult<Value> {
        let offset = self.pos;
        let initial = self.read_byte()?;
        match initial {
            0xf4 => return Ok(Value::Bool(false)),
            0xf5 => return Ok(Value::Bool(true)),
            0xf6 => return Ok(Value::Null),
            _ => {}
        }

        let major = initial >> 5;
        let arg = self.read_arg(initial & 0x1f, offset)?;
        match major {
            0 => Ok(Value::Int(i64::try_from(arg).map_err(|_| {
                CodecError::UnsupportedType {
                    byte: initial,
                    offset,
                }
            })?)),
            1 => {
                let n = i64::try_from(arg).map_err(|_| CodecError::UnsupportedType {
                    byte: initial,
                    offset,
                })?;
                Ok(Value::Int(!n))
            }
            2 => Ok(Value::Bytes(self.read_exact(arg)?.to_vec())),
            3 => {
                let payload_at = self.pos;
                let raw = self.read_exact(arg)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| CodecError::InvalidUtf8 { offset: payload_at })?;
                Ok(Value::Text(text.to_string()))
            }
            4 => {
                let mut items = Vec::with_capacity(arg.min(64) as usize);
                for _ in 0..arg {
                    items.push(self.read_value()?);
                }
                Ok(Value::Array(items))
            }
            5 => {
                let mut entries = Vec::with_capacity(arg.min(64) as usize);
                for _ in 0..arg {
                    let key = self.read_key()?;
                    let val = self.read_value()?;
                    entries.push((key, val));
                }
                Ok(Value::Map(entries))
            }
            _ => Err(CodecError::UnsupportedType {
                byte: initial,
                offset,
            }),
        }
    }

    fn read_key(&mut self) -> CodecResult<String> {
        let offset = self.pos;
        match self.read_value()? {
            Value::Text(s) => Ok(s),
            _ => Err(CodecError::UnsupportedType {
                byte: self.bytes[offset],
                offset,
            }),
        }
    }

    fn read_arg(&mut self, info: u8, offset: usize) -> CodecResult<u64> {
        match info {
            0..=23 => Ok(u64::from(info)),
            24 => Ok(u64::from(self.read_byte()?)),
            25 => Ok(u64::from(u16::from_be_bytes(
                self.read_exact(2)?.try_into().unwrap(),
            ))),
            26 => Ok(u64::from(u32::from_be_bytes(
                self.read_exact(4)?.try_into().unwrap(),
            ))),
            27 => Ok(u64::from_be_bytes(self.read_exact(8)?.try_into().unwrap())),
            _ => Err(CodecError::UnsupportedType {
                byte: self.bytes[offset],
                offset,
            }),
        }
    }

    fn read_byte(&mut self) -> CodecResult<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(CodecError::UnexpectedEof { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn read_exact(&mut self, len: u64) -> CodecResult<&'a [u8]> {
        let remaining = self.bytes.len() - self.pos;
        let len = usize::try_from(len).map_err(|_| CodecError::LengthOverflow {
            declared: len,
            remaining,
        })?;
        if len > remaining {
            return Err(CodecError::LengthOverflow {
                declared: len as u64,
                remaining,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode;

    fn round_trip(value: Value) {
        let encoded = encode(&value);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn round_trips_scalars() {
        round_trip(Value::Null);
        round_trip(Value::Bool(true));
        round_trip(Value::Int(0));
        round_trip(Value::Int(i64::MAX));
        round_trip(Value::Int(i64::MIN));
        round_trip(Value::Text("hello".into()));
        round_trip(Value::Bytes(vec![0, 1, 2, 255]));
    }

    #[test]
    fn round_trips_nested_structures() {
        round_trip(Value::map(vec![
            ("id".into(), Value::Text("doc-1".into())),
            (
                "tags".into(),
                Value::Array(vec![Value::Text("a".into()), Value::Int(3)]),
            ),
            (
                "blob".into(),
                Value::map(vec![("digest".into(), Value::Text("sha256-ff".into()))]),
            ),
        ]));
    }

    #[test]
    fn rejects_truncated_input() {
        let mut encoded = encode(&Value::Text("hello".into()));
        encoded.truncate(3);
        assert!(matches!(
            decode(&encoded),
            Err(CodecError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut encoded = encode(&Value::Int(1));
        encoded.push(0);
        assert!(matches!(
            decode(&encoded),
            Err(CodecError::TrailingBytes { remaining: 1 })
        ));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(
            decode(&[]),
            Err(CodecError::UnexpectedEof { offset: 0 })
        ));
    }

    #[test]
    fn rejects_invalid_utf8_text() {
        // 0x62 = text of length 2, followed by invalid UTF-8.
        assert!(matches!(
            decode(&[0x62, 0xff, 0xfe]),
            Err(CodecError::InvalidUtf8 { .. })
        ));
    }
}
