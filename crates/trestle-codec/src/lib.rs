// Message envelope serialization: a dynamic value model with two codec
// backends (inspectable JSON and compact binary) and a runtime type registry
// for application-defined payload types.
use bytes::Bytes;
use std::sync::Arc;

mod binary;
mod json;
mod registry;
mod value;

pub use binary::BinaryCodec;
pub use json::JsonCodec;
pub use registry::TypeRegistry;
pub use value::Value;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown type tag: {0}")]
    UnknownType(String),
    #[error("type not registered for encode: {0}")]
    UnregisteredType(&'static str),
    #[error("invalid value marker byte {0:#04x}")]
    InvalidMarker(u8),
    #[error("truncated payload")]
    Incomplete,
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("non-finite float cannot be encoded")]
    NonFiniteFloat,
    #[error("integer out of i64 range")]
    IntOutOfRange,
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// One framing backend for the message envelope.
///
/// Both implementations satisfy `decode(encode(v)) == v` for every
/// representable [`Value`], including registered custom types carried as
/// [`Value::Tagged`].
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Bytes>;
    fn decode(&self, input: Bytes) -> Result<Value>;
}

/// A codec paired with a type registry.
///
/// Decoding validates every type tag in the tree against the registry, so an
/// envelope carrying a tag nobody registered surfaces as
/// [`Error::UnknownType`] instead of passing through silently.
///
/// ```
/// use trestle_codec::{Serializer, Value};
///
/// let serializer = Serializer::binary();
/// let value = Value::List(vec![Value::Int(1), Value::Str("two".into())]);
/// let bytes = serializer.encode(&value).expect("encode");
/// assert_eq!(serializer.decode(bytes).expect("decode"), value);
/// ```
pub struct Serializer {
    codec: Box<dyn Codec>,
    registry: Arc<TypeRegistry>,
}

impl Serializer {
    pub fn new(codec: Box<dyn Codec>, registry: Arc<TypeRegistry>) -> Self {
        Self { codec, registry }
    }

    /// Human-inspectable JSON backend with a fresh registry.
    pub fn json() -> Self {
        Self::new(Box::new(JsonCodec), Arc::new(TypeRegistry::new()))
    }

    /// Compact binary backend with a fresh registry.
    pub fn binary() -> Self {
        Self::new(Box::new(BinaryCodec), Arc::new(TypeRegistry::new()))
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn encode(&self, value: &Value) -> Result<Bytes> {
        self.codec.encode(value)
    }

    pub fn decode(&self, input: Bytes) -> Result<Value> {
        let value = self.codec.decode(input)?;
        self.registry.validate(&value)?;
        Ok(value)
    }
}
