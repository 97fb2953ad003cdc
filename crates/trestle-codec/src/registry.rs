// Runtime registry mapping application types to envelope tags.
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, Result, Value};

type EncodeFn = Arc<dyn Fn(&dyn Any) -> Result<Value> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&Value) -> Result<Box<dyn Any + Send>> + Send + Sync>;

struct EncodeEntry {
    tag: String,
    encode: EncodeFn,
}

/// Registry of `(encode_fn, decode_fn)` pairs keyed by type tag.
///
/// Encode lookups go by `TypeId`, decode lookups by tag string. Registering
/// the same tag or type twice replaces the previous entry.
pub struct TypeRegistry {
    by_type: RwLock<HashMap<TypeId, EncodeEntry>>,
    by_tag: RwLock<HashMap<String, DecodeFn>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            by_type: RwLock::new(HashMap::new()),
            by_tag: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<T, E, D>(&self, tag: &str, encode: E, decode: D)
    where
        T: Any + Send,
        E: Fn(&T) -> Value + Send + Sync + 'static,
        D: Fn(&Value) -> Result<T> + Send + Sync + 'static,
    {
        let encode: EncodeFn = Arc::new(move |any: &dyn Any| {
            let concrete = any
                .downcast_ref::<T>()
                .ok_or(Error::UnregisteredType(std::any::type_name::<T>()))?;
            Ok(encode(concrete))
        });
        let decode: DecodeFn =
            Arc::new(move |value: &Value| Ok(Box::new(decode(value)?) as Box<dyn Any + Send>));
        self.by_type.write().insert(
            TypeId::of::<T>(),
            EncodeEntry {
                tag: tag.to_string(),
                encode,
            },
        );
        self.by_tag.write().insert(tag.to_string(), decode);
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.by_tag.read().contains_key(tag)
    }

    /// Encode a registered application value into a tagged envelope node.
    pub fn to_value<T: Any>(&self, value: &T) -> Result<Value> {
        let guard = self.by_type.read();
        let entry = guard
            .get(&TypeId::of::<T>())
            .ok_or(Error::UnregisteredType(std::any::type_name::<T>()))?;
        let encoded = (entry.encode)(value)?;
        Ok(Value::tagged(entry.tag.clone(), encoded))
    }

    /// Reconstruct a registered application value from a tagged node.
    pub fn from_value<T: Any>(&self, value: &Value) -> Result<T> {
        let (tag, inner) = match value {
            Value::Tagged { tag, value } => (tag.as_str(), value.as_ref()),
            _ => return Err(Error::Decode("expected a tagged value".into())),
        };
        let decode = self
            .by_tag
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::UnknownType(tag.to_string()))?;
        let boxed = decode(inner)?;
        boxed
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| Error::Decode(format!("tag {tag} decodes to a different type")))
    }

    /// Walk a decoded tree and reject any tag this registry does not know.
    pub fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::Tagged { tag, value } => {
                if !self.is_registered(tag) {
                    return Err(Error::UnknownType(tag.clone()));
                }
                self.validate(value)
            }
            Value::List(items) => items.iter().try_for_each(|item| self.validate(item)),
            Value::Map(entries) => entries.values().try_for_each(|item| self.validate(item)),
            _ => Ok(()),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Celsius(f64);

    fn register(registry: &TypeRegistry) {
        registry.register::<Celsius, _, _>(
            "celsius",
            |c| Value::Float(c.0),
            |value| match value {
                Value::Float(f) => Ok(Celsius(*f)),
                _ => Err(Error::Decode("celsius expects a float".into())),
            },
        );
    }

    #[test]
    fn to_and_from_value_round_trip() {
        let registry = TypeRegistry::new();
        register(&registry);
        let tagged = registry.to_value(&Celsius(21.5)).expect("to_value");
        assert!(matches!(&tagged, Value::Tagged { tag, .. } if tag == "celsius"));
        let back: Celsius = registry.from_value(&tagged).expect("from_value");
        assert_eq!(back, Celsius(21.5));
    }

    #[test]
    fn unregistered_type_fails_encode() {
        let registry = TypeRegistry::new();
        let err = registry.to_value(&Celsius(0.0)).expect_err("unregistered");
        assert!(matches!(err, Error::UnregisteredType(_)));
    }

    #[test]
    fn validate_rejects_unknown_tags_anywhere() {
        let registry = TypeRegistry::new();
        let nested = Value::List(vec![Value::tagged("mystery", Value::Null)]);
        let err = registry.validate(&nested).expect_err("unknown");
        assert!(matches!(err, Error::UnknownType(tag) if tag == "mystery"));

        register(&registry);
        registry
            .validate(&Value::tagged("celsius", Value::Float(1.0)))
            .expect("known tag");
    }
}
