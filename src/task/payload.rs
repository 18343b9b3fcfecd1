//! Payload codecs keyed by wire-schema tag.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::core::CoordinationError;

/// Schema tag of plain UTF-8 text.
pub const UTF8_SCHEMA: &str = "utf-8-string";

/// Schema tag of JSON documents.
pub const JSON_SCHEMA: &str = "application/json";

/// Converts payload values to bytes and back for one schema.
pub trait PayloadCodec: Send + Sync {
    /// Schema tag written next to encoded bytes.
    fn schema(&self) -> &str;

    /// Encode `value`.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Payload`] if the codec cannot represent `value`.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CoordinationError>;

    /// Decode `bytes`.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Payload`] on malformed input.
    fn decode(&self, bytes: &[u8]) -> Result<Value, CoordinationError>;
}

/// Strings as raw UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl PayloadCodec for Utf8Codec {
    fn schema(&self) -> &str {
        UTF8_SCHEMA
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CoordinationError> {
        match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Null => Ok(Vec::new()),
            other => Err(CoordinationError::Payload(format!(
                "{UTF8_SCHEMA} cannot encode {other}"
            ))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CoordinationError> {
        String::from_utf8(bytes.to_vec())
            .map(Value::String)
            .map_err(|e| CoordinationError::Payload(e.to_string()))
    }
}

/// Any value as JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn schema(&self) -> &str {
        JSON_SCHEMA
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CoordinationError> {
        serde_json::to_vec(value).map_err(|e| CoordinationError::Payload(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CoordinationError> {
        serde_json::from_slice(bytes).map_err(|e| CoordinationError::Payload(e.to_string()))
    }
}

/// Schema-tag to codec lookup. Starts with [`Utf8Codec`] and [`JsonCodec`].
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn PayloadCodec>>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let registry = Self {
            codecs: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(Utf8Codec));
        registry.register(Arc::new(JsonCodec));
        registry
    }
}

impl CodecRegistry {
    /// Registry with the built-in codecs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the codec for its schema.
    pub fn register(&self, codec: Arc<dyn PayloadCodec>) {
        self.codecs.write().insert(codec.schema().to_owned(), codec);
    }

    /// Codec for `schema`, if registered.
    #[must_use]
    pub fn get(&self, schema: &str) -> Option<Arc<dyn PayloadCodec>> {
        self.codecs.read().get(schema).cloned()
    }

    /// Encode `value`, picking UTF-8 for strings and null, JSON otherwise.
    /// Returns the bytes and the schema tag.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Payload`] if encoding fails.
    pub fn encode(&self, value: &Value) -> Result<(Vec<u8>, String), CoordinationError> {
        let schema = match value {
            Value::Null | Value::String(_) => UTF8_SCHEMA,
            _ => JSON_SCHEMA,
        };
        self.encode_as(schema, value)
    }

    /// Encode `value` with the codec for `schema`.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Payload`] for unknown schemas or encoding failure.
    pub fn encode_as(
        &self,
        schema: &str,
        value: &Value,
    ) -> Result<(Vec<u8>, String), CoordinationError> {
        let codec = self.lookup(schema)?;
        Ok((codec.encode(value)?, schema.to_owned()))
    }

    /// Decode `bytes` tagged with `schema`.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Payload`] for unknown schemas or malformed bytes.
    pub fn decode(&self, schema: &str, bytes: &[u8]) -> Result<Value, CoordinationError> {
        self.lookup(schema)?.decode(bytes)
    }

    fn lookup(&self, schema: &str) -> Result<Arc<dyn PayloadCodec>, CoordinationError> {
        self.get(schema)
            .ok_or_else(|| CoordinationError::Payload(format!("no codec for schema {schema}")))
    }
}
