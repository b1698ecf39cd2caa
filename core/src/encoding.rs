//! Row and key codecs.
//!
//! Rows are stored as a tagged little-endian payload. Keys use a
//! byte-comparable encoding: comparing two encoded keys with `memcmp` gives
//! the same order as comparing the values column by column, so composite keys
//! are plain concatenations.
//!
//! ```text
//! 0x01       NULL
//! 0x02-0x03  FALSE, TRUE
//! 0x10       integers (INTEGER and BIGINT share one ordering)
//! 0x11       doubles
//! 0x20       text      escaped bytes, terminated by 0x00 0x00
//! 0x21       binary    same escaping as text
//! ```

use bytes::{Buf, BufMut};

use crate::{CoreError, Result, Row, Value};

mod key_prefix {
    pub const NULL: u8 = 0x01;
    pub const FALSE: u8 = 0x02;
    pub const TRUE: u8 = 0x03;
    pub const INT: u8 = 0x10;
    pub const DOUBLE: u8 = 0x11;
    pub const TEXT: u8 = 0x20;
    pub const BINARY: u8 = 0x21;
}

mod row_tag {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const INTEGER: u8 = 2;
    pub const BIGINT: u8 = 3;
    pub const DOUBLE: u8 = 4;
    pub const TEXT: u8 = 5;
    pub const BINARY: u8 = 6;
}

/// Encodes a tuple of values into a byte-comparable key.
pub fn encode_key(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.iter().map(|v| v.estimated_size() + 2).sum());
    for value in values {
        encode_key_value_to(value, &mut buf);
    }
    buf
}

pub fn encode_key_value_to(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.put_u8(key_prefix::NULL),
        Value::Boolean(false) => buf.put_u8(key_prefix::FALSE),
        Value::Boolean(true) => buf.put_u8(key_prefix::TRUE),
        Value::Integer(i) => encode_int_to(*i as i64, buf),
        Value::BigInt(i) => encode_int_to(*i, buf),
        Value::DoublePrecision(d) => {
            let bits = d.to_bits();
            // Negative floats invert every bit, positive ones only the sign bit.
            let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
            buf.put_u8(key_prefix::DOUBLE);
            buf.put_u64(ordered);
        }
        Value::Text(s) => encode_escaped_to(key_prefix::TEXT, s.as_bytes(), buf),
        Value::Binary(b) => encode_escaped_to(key_prefix::BINARY, b, buf),
    }
}

fn encode_int_to(value: i64, buf: &mut Vec<u8>) {
    buf.put_u8(key_prefix::INT);
    buf.put_u64((value as u64) ^ (1 << 63));
}

fn encode_escaped_to(prefix: u8, bytes: &[u8], buf: &mut Vec<u8>) {
    buf.put_u8(prefix);
    for &b in bytes {
        buf.put_u8(b);
        if b == 0x00 {
            buf.put_u8(0xFF);
        }
    }
    buf.put_u8(0x00);
    buf.put_u8(0x00);
}

fn decode_escaped(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        need(buf, 1)?;
        let b = buf.get_u8();
        if b != 0x00 {
            out.push(b);
            continue;
        }
        need(buf, 1)?;
        match buf.get_u8() {
            0x00 => return Ok(out),
            0xFF => out.push(0x00),
            other => {
                return Err(CoreError::Decode(format!(
                    "bad escape 0x00 0x{:02x} in key",
                    other
                )))
            }
        }
    }
}

/// Decodes a key produced by [`encode_key`]. Integers come back as
/// `BigInt`, since both integer types share one encoding.
pub fn decode_key(mut buf: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    while buf.has_remaining() {
        let value = match buf.get_u8() {
            key_prefix::NULL => Value::Null,
            key_prefix::FALSE => Value::Boolean(false),
            key_prefix::TRUE => Value::Boolean(true),
            key_prefix::INT => {
                need(&buf, 8)?;
                Value::BigInt((buf.get_u64() ^ (1 << 63)) as i64)
            }
            key_prefix::DOUBLE => {
                need(&buf, 8)?;
                let ordered = buf.get_u64();
                let bits = if ordered >> 63 == 1 { ordered ^ (1 << 63) } else { !ordered };
                Value::DoublePrecision(f64::from_bits(bits))
            }
            key_prefix::TEXT => Value::Text(
                String::from_utf8(decode_escaped(&mut buf)?)
                    .map_err(|e| CoreError::Decode(e.to_string()))?,
            ),
            key_prefix::BINARY => Value::Binary(decode_escaped(&mut buf)?),
            other => return Err(CoreError::Decode(format!("unknown key prefix 0x{:02x}", other))),
        };
        values.push(value);
    }
    Ok(values)
}

/// Serializes a row into its stored value payload.
pub fn encode_row(row: &Row) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + row.iter().map(|v| v.estimated_size() + 1).sum::<usize>());
    buf.put_u16_le(row.len() as u16);
    for value in row {
        match value {
            Value::Null => buf.put_u8(row_tag::NULL),
            Value::Boolean(b) => {
                buf.put_u8(row_tag::BOOLEAN);
                buf.put_u8(*b as u8);
            }
            Value::Integer(i) => {
                buf.put_u8(row_tag::INTEGER);
                buf.put_i32_le(*i);
            }
            Value::BigInt(i) => {
                buf.put_u8(row_tag::BIGINT);
                buf.put_i64_le(*i);
            }
            Value::DoublePrecision(d) => {
                buf.put_u8(row_tag::DOUBLE);
                buf.put_f64_le(*d);
            }
            Value::Text(s) => {
                buf.put_u8(row_tag::TEXT);
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Binary(b) => {
                buf.put_u8(row_tag::BINARY);
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }
    buf
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(CoreError::Decode(format!(
            "needed {} bytes, {} left",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn decode_row(mut buf: &[u8]) -> Result<Row> {
    need(&buf, 2)?;
    let count = buf.get_u16_le() as usize;
    let mut row = Vec::with_capacity(count);
    for _ in 0..count {
        need(&buf, 1)?;
        let value = match buf.get_u8() {
            row_tag::NULL => Value::Null,
            row_tag::BOOLEAN => {
                need(&buf, 1)?;
                Value::Boolean(buf.get_u8() != 0)
            }
            row_tag::INTEGER => {
                need(&buf, 4)?;
                Value::Integer(buf.get_i32_le())
            }
            row_tag::BIGINT => {
                need(&buf, 8)?;
                Value::BigInt(buf.get_i64_le())
            }
            row_tag::DOUBLE => {
                need(&buf, 8)?;
                Value::DoublePrecision(buf.get_f64_le())
            }
            tag @ (row_tag::TEXT | row_tag::BINARY) => {
                need(&buf, 4)?;
                let len = buf.get_u32_le() as usize;
                need(&buf, len)?;
                let bytes = buf[..len].to_vec();
                buf.advance(len);
                if tag == row_tag::TEXT {
                    Value::Text(
                        String::from_utf8(bytes).map_err(|e| CoreError::Decode(e.to_string()))?,
                    )
                } else {
                    Value::Binary(bytes)
                }
            }
            other => return Err(CoreError::Decode(format!("unknown value tag {}", other))),
        };
        row.push(value);
    }
    if buf.has_remaining() {
        return Err(CoreError::Decode(format!(
            "{} trailing bytes after row",
            buf.remaining()
        )));
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_row_payload_decodes_to_same_values() {
        let row = vec![
            Value::from("test_1"),
            Value::BigInt(-5),
            Value::Integer(2),
            Value::Null,
            Value::DoublePrecision(1.5),
            Value::Binary(vec![0, 1, 2]),
            Value::Boolean(true),
        ];
        assert_eq!(decode_row(&encode_row(&row)).unwrap(), row);
    }

    #[test]
    fn test_truncated_row_is_rejected() {
        let bytes = encode_row(&vec![Value::from("hello")]);
        assert!(matches!(
            decode_row(&bytes[..bytes.len() - 1]),
            Err(CoreError::Decode(_))
        ));
    }

    #[test]
    fn test_key_decodes_back_to_values() {
        let values = vec![
            Value::from("a\0b"),
            Value::BigInt(-7),
            Value::Null,
            Value::DoublePrecision(-2.5),
            Value::Binary(vec![0, 0xFF]),
        ];
        assert_eq!(decode_key(&encode_key(&values)).unwrap(), values);
        assert_eq!(
            decode_key(&encode_key(&[Value::Integer(3)])).unwrap(),
            vec![Value::BigInt(3)]
        );
        assert!(decode_key(&[0x20, b'a', 0x00]).is_err());
        assert!(decode_key(&[0x7F]).is_err());
    }

    #[test]
    fn test_key_order_for_mixed_types() {
        let null = encode_key(&[Value::Null]);
        let f = encode_key(&[Value::Boolean(false)]);
        let neg = encode_key(&[Value::BigInt(-100)]);
        let zero = encode_key(&[Value::Integer(0)]);
        let pos = encode_key(&[Value::BigInt(100)]);
        let text = encode_key(&[Value::from("")]);
        assert!(null < f && f < neg && neg < zero && zero < pos && pos < text);
    }

    #[test]
    fn test_text_with_embedded_nul_orders_after_prefix() {
        let a = encode_key(&[Value::from("a")]);
        let a_nul = encode_key(&[Value::Text("a\0".to_string())]);
        let ab = encode_key(&[Value::from("ab")]);
        assert!(a < a_nul && a_nul < ab);
    }

    #[test]
    fn test_composite_key_orders_by_first_column_first() {
        let k1 = encode_key(&[Value::BigInt(1), Value::from("zzz")]);
        let k2 = encode_key(&[Value::BigInt(2), Value::from("aaa")]);
        assert!(k1 < k2);
    }

    proptest! {
        #[test]
        fn prop_int_keys_preserve_order(a in any::<i64>(), b in any::<i64>()) {
            let ka = encode_key(&[Value::BigInt(a)]);
            let kb = encode_key(&[Value::BigInt(b)]);
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn prop_text_keys_preserve_order(a in ".{0,12}", b in ".{0,12}") {
            let ka = encode_key(&[Value::Text(a.clone()), Value::Integer(1)]);
            let kb = encode_key(&[Value::Text(b.clone()), Value::Integer(0)]);
            if a != b {
                prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ka.cmp(&kb));
            } else {
                prop_assert!(ka > kb);
            }
        }
    }
}
