// Compact binary codec: one marker byte per node, big-endian fixed-width
// scalars, u32 length prefixes for variable-width data.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::{Codec, Error, Result, Value};

const MARKER_NULL: u8 = 0x00;
const MARKER_FALSE: u8 = 0x01;
const MARKER_TRUE: u8 = 0x02;
const MARKER_INT: u8 = 0x03;
const MARKER_FLOAT: u8 = 0x04;
const MARKER_STR: u8 = 0x05;
const MARKER_BYTES: u8 = 0x06;
const MARKER_LIST: u8 = 0x07;
const MARKER_MAP: u8 = 0x08;
const MARKER_TAGGED: u8 = 0x09;

/// Binary envelope backend.
///
/// ```
/// use trestle_codec::{BinaryCodec, Codec, Value};
///
/// let codec = BinaryCodec;
/// let bytes = codec.encode(&Value::Int(5)).expect("encode");
/// assert_eq!(codec.decode(bytes).expect("decode"), Value::Int(5));
/// ```
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encode(&self, value: &Value) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        encode_into(value, &mut buf)?;
        Ok(buf.freeze())
    }

    fn decode(&self, input: Bytes) -> Result<Value> {
        let mut buf = input;
        let value = decode_one(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::Decode("trailing bytes after value".into()));
        }
        Ok(value)
    }
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| Error::Decode("length exceeds u32".into()))?;
    buf.put_u32(len);
    Ok(())
}

fn encode_into(value: &Value, buf: &mut BytesMut) -> Result<()> {
    match value {
        Value::Null => buf.put_u8(MARKER_NULL),
        Value::Bool(false) => buf.put_u8(MARKER_FALSE),
        Value::Bool(true) => buf.put_u8(MARKER_TRUE),
        Value::Int(i) => {
            buf.put_u8(MARKER_INT);
            buf.put_i64(*i);
        }
        Value::Float(f) => {
            buf.put_u8(MARKER_FLOAT);
            buf.put_f64(*f);
        }
        Value::Str(s) => {
            buf.put_u8(MARKER_STR);
            put_len(buf, s.len())?;
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(MARKER_BYTES);
            put_len(buf, b.len())?;
            buf.extend_from_slice(b);
        }
        Value::List(items) => {
            buf.put_u8(MARKER_LIST);
            put_len(buf, items.len())?;
            for item in items {
                encode_into(item, buf)?;
            }
        }
        Value::Map(entries) => {
            buf.put_u8(MARKER_MAP);
            put_len(buf, entries.len())?;
            for (key, item) in entries {
                put_len(buf, key.len())?;
                buf.extend_from_slice(key.as_bytes());
                encode_into(item, buf)?;
            }
        }
        Value::Tagged { tag, value } => {
            buf.put_u8(MARKER_TAGGED);
            put_len(buf, tag.len())?;
            buf.extend_from_slice(tag.as_bytes());
            encode_into(value, buf)?;
        }
    }
    Ok(())
}

fn take_len(buf: &mut Bytes) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(Error::Incomplete);
    }
    Ok(buf.get_u32() as usize)
}

fn take_string(buf: &mut Bytes, what: &'static str) -> Result<String> {
    let len = take_len(buf)?;
    if buf.remaining() < len {
        return Err(Error::Incomplete);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8(what))
}

fn decode_one(buf: &mut Bytes) -> Result<Value> {
    if !buf.has_remaining() {
        return Err(Error::Incomplete);
    }
    match buf.get_u8() {
        MARKER_NULL => Ok(Value::Null),
        MARKER_FALSE => Ok(Value::Bool(false)),
        MARKER_TRUE => Ok(Value::Bool(true)),
        MARKER_INT => {
            if buf.remaining() < 8 {
                return Err(Error::Incomplete);
            }
            Ok(Value::Int(buf.get_i64()))
        }
        MARKER_FLOAT => {
            if buf.remaining() < 8 {
                return Err(Error::Incomplete);
            }
            Ok(Value::Float(buf.get_f64()))
        }
        MARKER_STR => Ok(Value::Str(take_string(buf, "string value")?)),
        MARKER_BYTES => {
            let len = take_len(buf)?;
            if buf.remaining() < len {
                return Err(Error::Incomplete);
            }
            Ok(Value::Bytes(buf.copy_to_bytes(len)))
        }
        MARKER_LIST => {
            let count = take_len(buf)?;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_one(buf)?);
            }
            Ok(Value::List(items))
        }
        MARKER_MAP => {
            let count = take_len(buf)?;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key = take_string(buf, "map key")?;
                let item = decode_one(buf)?;
                entries.insert(key, item);
            }
            Ok(Value::Map(entries))
        }
        MARKER_TAGGED => {
            let tag = take_string(buf, "type tag")?;
            let value = decode_one(buf)?;
            Ok(Value::tagged(tag, value))
        }
        other => Err(Error::InvalidMarker(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        let codec = BinaryCodec;
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(i64::MIN),
            Value::Float(-0.25),
            Value::Str(String::new()),
            Value::Bytes(Bytes::from_static(b"\x00\xff")),
        ] {
            let encoded = codec.encode(&value).expect("encode");
            assert_eq!(codec.decode(encoded).expect("decode"), value);
        }
    }

    #[test]
    fn rejects_truncated_input() {
        let codec = BinaryCodec;
        let encoded = codec
            .encode(&Value::Str("truncate me".into()))
            .expect("encode");
        let truncated = encoded.slice(0..encoded.len() - 3);
        assert!(matches!(
            codec.decode(truncated).expect_err("truncated"),
            Error::Incomplete
        ));
    }

    #[test]
    fn rejects_unknown_marker() {
        let codec = BinaryCodec;
        let err = codec
            .decode(Bytes::from_static(&[0x7f]))
            .expect_err("bad marker");
        assert!(matches!(err, Error::InvalidMarker(0x7f)));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let codec = BinaryCodec;
        let mut encoded = BytesMut::from(&codec.encode(&Value::Null).expect("encode")[..]);
        encoded.put_u8(0);
        assert!(codec.decode(encoded.freeze()).is_err());
    }

    #[test]
    fn rejects_invalid_utf8_in_keys() {
        let mut buf = BytesMut::new();
        buf.put_u8(MARKER_MAP);
        buf.put_u32(1);
        buf.put_u32(2);
        buf.extend_from_slice(&[0xff, 0xfe]);
        buf.put_u8(MARKER_NULL);
        let err = BinaryCodec.decode(buf.freeze()).expect_err("bad utf8");
        assert!(matches!(err, Error::InvalidUtf8("map key")));
    }
}
