use serde_json::{Map, Number, Value};
use thiserror::Error;

// Nesting limit when decoding untrusted payloads
const MAX_DEPTH: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("unsupported type marker 0x{marker:02x} at byte {pos}")]
    UnsupportedType { marker: u8, pos: usize },

    #[error("map key at byte {0} is not a string")]
    NonStringKey(usize),

    #[error("invalid utf-8 string at byte {0}")]
    InvalidString(usize),

    #[error("float at byte {0} is not a finite number")]
    NonFiniteFloat(usize),

    #[error("{0} trailing bytes after document")]
    TrailingBytes(usize),

    #[error("document nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,

    #[error("collection of {0} entries is too large to encode")]
    TooLarge(usize),
}

pub(super) fn encode(value: &Value, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        Value::Null => buf.push(0xc0),
        Value::Bool(false) => buf.push(0xc2),
        Value::Bool(true) => buf.push(0xc3),
        Value::Number(n) => encode_number(n, buf),
        Value::String(s) => encode_str(s, buf)?,
        Value::Array(items) => {
            let len = items.len();
            if len < 16 {
                buf.push(0x90 | len as u8);
            } else if len <= u16::MAX as usize {
                buf.push(0xdc);
                buf.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                buf.push(0xdd);
                buf.extend_from_slice(&len_u32(len)?.to_be_bytes());
            }
            for item in items {
                encode(item, buf)?;
            }
        }
        Value::Object(map) => {
            let len = map.len();
            if len < 16 {
                buf.push(0x80 | len as u8);
            } else if len <= u16::MAX as usize {
                buf.push(0xde);
                buf.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                buf.push(0xdf);
                buf.extend_from_slice(&len_u32(len)?.to_be_bytes());
            }
            for (key, value) in map {
                encode_str(key, buf)?;
                encode(value, buf)?;
            }
        }
    }
    Ok(())
}

fn len_u32(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge(len))
}

fn encode_str(s: &str, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let len = s.len();
    if len < 32 {
        buf.push(0xa0 | len as u8);
    } else if len <= u8::MAX as usize {
        buf.push(0xd9);
        buf.push(len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(0xda);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(0xdb);
        buf.extend_from_slice(&len_u32(len)?.to_be_bytes());
    }
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn encode_number(n: &Number, buf: &mut Vec<u8>) {
    if let Some(u) = n.as_u64() {
        if u < 0x80 {
            buf.push(u as u8);
        } else if u <= u8::MAX as u64 {
            buf.push(0xcc);
            buf.push(u as u8);
        } else if u <= u16::MAX as u64 {
            buf.push(0xcd);
            buf.extend_from_slice(&(u as u16).to_be_bytes());
        } else if u <= u32::MAX as u64 {
            buf.push(0xce);
            buf.extend_from_slice(&(u as u32).to_be_bytes());
        } else {
            buf.push(0xcf);
            buf.extend_from_slice(&u.to_be_bytes());
        }
    } else if let Some(i) = n.as_i64() {
        // only negative values reach this branch
        if i >= -32 {
            buf.push(i as i8 as u8);
        } else if i >= i8::MIN as i64 {
            buf.push(0xd0);
            buf.push(i as i8 as u8);
        } else if i >= i16::MIN as i64 {
            buf.push(0xd1);
            buf.extend_from_slice(&(i as i16).to_be_bytes());
        } else if i >= i32::MIN as i64 {
            buf.push(0xd2);
            buf.extend_from_slice(&(i as i32).to_be_bytes());
        } else {
            buf.push(0xd3);
            buf.extend_from_slice(&i.to_be_bytes());
        }
    } else {
        // serde_json numbers are always finite
        let f = n.as_f64().unwrap_or_default();
        buf.push(0xcb);
        buf.extend_from_slice(&f.to_be_bytes());
    }
}

pub(super) fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut reader = Reader { bytes, pos: 0 };
    let value = reader.value(0)?;
    let rest = bytes.len() - reader.pos;
    if rest > 0 {
        return Err(CodecError::TrailingBytes(rest));
    }
    Ok(value)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(CodecError::UnexpectedEof(self.bytes.len()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<usize, CodecError> {
        Ok(u16::from_be_bytes(self.array()?) as usize)
    }

    fn u32(&mut self) -> Result<usize, CodecError> {
        Ok(u32::from_be_bytes(self.array()?) as usize)
    }

    fn value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep);
        }

        let pos = self.pos;
        let marker = self.u8()?;
        let value = match marker {
            0x00..=0x7f => Value::from(marker as u64),
            0x80..=0x8f => self.map((marker & 0x0f) as usize, depth)?,
            0x90..=0x9f => self.seq((marker & 0x0f) as usize, depth)?,
            0xa0..=0xbf => self.string((marker & 0x1f) as usize)?,
            0xc0 => Value::Null,
            0xc2 => Value::Bool(false),
            0xc3 => Value::Bool(true),
            0xca => {
                let f = f32::from_be_bytes(self.array()?) as f64;
                self.float(f, pos)?
            }
            0xcb => {
                let f = f64::from_be_bytes(self.array()?);
                self.float(f, pos)?
            }
            0xcc => Value::from(self.u8()? as u64),
            0xcd => Value::from(u16::from_be_bytes(self.array()?) as u64),
            0xce => Value::from(u32::from_be_bytes(self.array()?) as u64),
            0xcf => Value::from(u64::from_be_bytes(self.array()?)),
            0xd0 => Value::from(i8::from_be_bytes(self.array()?) as i64),
            0xd1 => Value::from(i16::from_be_bytes(self.array()?) as i64),
            0xd2 => Value::from(i32::from_be_bytes(self.array()?) as i64),
            0xd3 => Value::from(i64::from_be_bytes(self.array()?)),
            0xd9 => {
                let len = self.u8()? as usize;
                self.string(len)?
            }
            0xda => {
                let len = self.u16()?;
                self.string(len)?
            }
            0xdb => {
                let len = self.u32()?;
                self.string(len)?
            }
            0xdc => {
                let len = self.u16()?;
                self.seq(len, depth)?
            }
            0xdd => {
                let len = self.u32()?;
                self.seq(len, depth)?
            }
            0xde => {
                let len = self.u16()?;
                self.map(len, depth)?
            }
            0xdf => {
                let len = self.u32()?;
                self.map(len, depth)?
            }
            0xe0..=0xff => Value::from(marker as i8 as i64),
            _ => return Err(CodecError::UnsupportedType { marker, pos }),
        };
        Ok(value)
    }

    fn float(&self, f: f64, pos: usize) -> Result<Value, CodecError> {
        Number::from_f64(f)
            .map(Value::Number)
            .ok_or(CodecError::NonFiniteFloat(pos))
    }

    fn string(&mut self, len: usize) -> Result<Value, CodecError> {
        let pos = self.pos;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(|s| Value::String(s.to_owned()))
            .map_err(|_| CodecError::InvalidString(pos))
    }

    fn seq(&mut self, len: usize, depth: usize) -> Result<Value, CodecError> {
        // every entry takes at least one byte
        let mut items = Vec::with_capacity(len.min(self.bytes.len() - self.pos));
        for _ in 0..len {
            items.push(self.value(depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn map(&mut self, len: usize, depth: usize) -> Result<Value, CodecError> {
        let mut map = Map::new();
        for _ in 0..len {
            let pos = self.pos;
            let key = match self.value(depth + 1)? {
                Value::String(key) => key,
                _ => return Err(CodecError::NonStringKey(pos)),
            };
            let value = self.value(depth + 1)?;
            map.insert(key, value);
        }
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn encoded(value: Value) -> Vec<u8> {
        let mut buf = Vec::new();
        encode(&value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn it_uses_compact_markers_for_small_values() {
        assert_eq!(encoded(json!(null)), vec![0xc0]);
        assert_eq!(encoded(json!(true)), vec![0xc3]);
        assert_eq!(encoded(json!(5)), vec![0x05]);
        assert_eq!(encoded(json!(-1)), vec![0xff]);
        assert_eq!(encoded(json!("ab")), vec![0xa2, b'a', b'b']);
        assert_eq!(encoded(json!([])), vec![0x90]);
        assert_eq!(
            encoded(json!({"a": 1})),
            vec![0x81, 0xa1, b'a', 0x01]
        );
    }

    #[test]
    fn it_picks_the_narrowest_integer_width() {
        assert_eq!(encoded(json!(200)), vec![0xcc, 200]);
        assert_eq!(encoded(json!(300)), vec![0xcd, 0x01, 0x2c]);
        assert_eq!(encoded(json!(-100)), vec![0xd0, 0x9c]);
        assert_eq!(encoded(json!(70000))[0], 0xce);
        assert_eq!(encoded(json!(u64::MAX))[0], 0xcf);
        assert_eq!(encoded(json!(i64::MIN))[0], 0xd3);
        assert_eq!(encoded(json!(1.5))[0], 0xcb);
    }

    #[test]
    fn it_decodes_what_it_encodes() {
        let value = json!({
            "string": "value",
            "jsonObject": {"testAttr": "test"},
            "list": [1, -20, 300, -40000, 1.25, null, false],
            "long": "x".repeat(300),
        });
        assert_eq!(decode(&encoded(value.clone())).unwrap(), value);
    }

    #[test]
    fn it_decodes_float32() {
        let bytes = [0xca, 0x3f, 0xc0, 0x00, 0x00];
        assert_eq!(decode(&bytes).unwrap(), json!(1.5));
    }

    #[test]
    fn it_rejects_malformed_input() {
        assert_eq!(decode(&[0xa3, b'a']), Err(CodecError::UnexpectedEof(2)));
        assert_eq!(decode(&[0x01, 0x02]), Err(CodecError::TrailingBytes(1)));
        assert_eq!(
            decode(&[0x81, 0x01, 0x01]),
            Err(CodecError::NonStringKey(1))
        );
        assert_eq!(
            decode(&[0xc4, 0x00]),
            Err(CodecError::UnsupportedType {
                marker: 0xc4,
                pos: 0
            })
        );
        let nan = [0xcb, 0x7f, 0xf8, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode(&nan), Err(CodecError::NonFiniteFloat(0)));
    }

    #[test]
    fn it_limits_nesting() {
        let bytes = vec![0x91; MAX_DEPTH + 2];
        assert_eq!(decode(&bytes), Err(CodecError::TooDeep));
    }
}
