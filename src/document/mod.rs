//! Semi-structured documents
//!
//! A [`Document`] is the value type shared by variable scopes, task payloads and
//! message variables. It is an ordered tree of maps, arrays and scalars backed by
//! [`serde_json::Value`], with a stable MessagePack-compatible binary encoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::ops::Deref;

mod codec;

pub use codec::CodecError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Value);

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

impl Document {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    /// The empty map `{}`
    pub fn empty() -> Self {
        Self(Value::Object(Map::new()))
    }

    /// Resolve the effective source of a mapping
    ///
    /// A payload that was never provided is treated as the empty map.
    pub fn or_empty(payload: Option<Document>) -> Self {
        payload.unwrap_or_else(Self::empty)
    }

    /// Decode a document from its binary form.
    ///
    /// An empty buffer decodes to the empty map.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        codec::decode(bytes).map(Self)
    }

    /// Encode the document in its binary form.
    ///
    /// Map entries are written in document order.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        codec::encode(&self.0, &mut buf)?;
        Ok(buf)
    }

    pub fn is_map(&self) -> bool {
        self.0.is_object()
    }

    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.0.as_object_mut()
    }

    /// Get a top level member of a map document
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.as_object().and_then(|map| map.get(name))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl Deref for Document {
    type Target = Value;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Value> for Document {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(Value::Object(map))
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.0
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
