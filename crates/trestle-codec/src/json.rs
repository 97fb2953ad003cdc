// Human-inspectable JSON codec. Byte strings and tagged values use sentinel
// objects ({"$bytes": ...}, {"$type": ..., "$value": ...}) since JSON has no
// native binary or tagged form.
use base64::Engine;
use bytes::Bytes;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};
use std::collections::BTreeMap;

use crate::{Codec, Error, Result, Value};

const BYTES_KEY: &str = "$bytes";
const TYPE_KEY: &str = "$type";
const VALUE_KEY: &str = "$value";

/// JSON envelope backend.
///
/// Application maps whose only key is a sentinel (`$bytes`, or `$type` plus
/// `$value`) would be misread on decode; sentinel keys are reserved by this
/// backend.
///
/// ```
/// use trestle_codec::{Codec, JsonCodec, Value};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&Value::Str("hi".into())).expect("encode");
/// assert_eq!(&bytes[..], b"\"hi\"");
/// ```
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Bytes> {
        let json = to_json(value)?;
        Ok(Bytes::from(serde_json::to_vec(&json)?))
    }

    fn decode(&self, input: Bytes) -> Result<Value> {
        let json: JsonValue = serde_json::from_slice(&input)?;
        from_json(json)
    }
}

fn to_json(value: &Value) -> Result<JsonValue> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => JsonValue::Number(Number::from(*i)),
        Value::Float(f) => {
            JsonValue::Number(Number::from_f64(*f).ok_or(Error::NonFiniteFloat)?)
        }
        Value::Str(s) => JsonValue::String(s.clone()),
        Value::Bytes(b) => {
            let mut wrapper = JsonMap::new();
            wrapper.insert(
                BYTES_KEY.to_string(),
                JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b)),
            );
            JsonValue::Object(wrapper)
        }
        Value::List(items) => {
            JsonValue::Array(items.iter().map(to_json).collect::<Result<Vec<_>>>()?)
        }
        Value::Map(entries) => {
            let mut object = JsonMap::new();
            for (key, item) in entries {
                object.insert(key.clone(), to_json(item)?);
            }
            JsonValue::Object(object)
        }
        Value::Tagged { tag, value } => {
            let mut wrapper = JsonMap::new();
            wrapper.insert(TYPE_KEY.to_string(), JsonValue::String(tag.clone()));
            wrapper.insert(VALUE_KEY.to_string(), to_json(value)?);
            JsonValue::Object(wrapper)
        }
    })
}

fn from_json(json: JsonValue) -> Result<Value> {
    Ok(match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(Error::IntOutOfRange);
            }
        }
        JsonValue::String(s) => Value::Str(s),
        JsonValue::Array(items) => {
            Value::List(items.into_iter().map(from_json).collect::<Result<Vec<_>>>()?)
        }
        JsonValue::Object(mut object) => {
            if object.len() == 1 {
                if let Some(JsonValue::String(encoded)) = object.get(BYTES_KEY) {
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(encoded.as_bytes())
                        .map_err(|err| Error::Decode(format!("bad base64: {err}")))?;
                    return Ok(Value::Bytes(Bytes::from(decoded)));
                }
            }
            if object.len() == 2 && object.contains_key(TYPE_KEY) && object.contains_key(VALUE_KEY)
            {
                let tag = match object.remove(TYPE_KEY) {
                    Some(JsonValue::String(tag)) => tag,
                    _ => return Err(Error::Decode("type tag must be a string".into())),
                };
                let inner = object
                    .remove(VALUE_KEY)
                    .ok_or_else(|| Error::Decode("missing tagged value".into()))?;
                return Ok(Value::tagged(tag, from_json(inner)?));
            }
            let mut entries = BTreeMap::new();
            for (key, item) in object {
                entries.insert(key, from_json(item)?);
            }
            Value::Map(entries)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_use_the_sentinel_wrapper() {
        let codec = JsonCodec;
        let encoded = codec
            .encode(&Value::Bytes(Bytes::from_static(b"abc")))
            .expect("encode");
        let text = std::str::from_utf8(&encoded).expect("utf8");
        assert!(text.contains("$bytes"));
        assert_eq!(
            codec.decode(encoded).expect("decode"),
            Value::Bytes(Bytes::from_static(b"abc"))
        );
    }

    #[test]
    fn tagged_values_round_trip() {
        let codec = JsonCodec;
        let tagged = Value::tagged("custom", Value::Int(9));
        let encoded = codec.encode(&tagged).expect("encode");
        assert_eq!(codec.decode(encoded).expect("decode"), tagged);
    }

    #[test]
    fn floats_and_ints_stay_distinct() {
        let codec = JsonCodec;
        let encoded = codec.encode(&Value::Float(2.0)).expect("encode");
        assert_eq!(codec.decode(encoded).expect("decode"), Value::Float(2.0));
        let encoded = codec.encode(&Value::Int(2)).expect("encode");
        assert_eq!(codec.decode(encoded).expect("decode"), Value::Int(2));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let err = JsonCodec
            .encode(&Value::Float(f64::NAN))
            .expect_err("nan");
        assert!(matches!(err, Error::NonFiniteFloat));
    }

    #[test]
    fn plain_objects_decode_as_maps() {
        let decoded = JsonCodec
            .decode(Bytes::from_static(b"{\"a\":1,\"b\":null}"))
            .expect("decode");
        match decoded {
            Value::Map(entries) => {
                assert_eq!(entries.get("a"), Some(&Value::Int(1)));
                assert_eq!(entries.get("b"), Some(&Value::Null));
            }
            other => panic!("expected map, got {other:?}"),
        }
    }
}
