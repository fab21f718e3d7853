//! Published messages and the subscriptions waiting on them
//!
//! Both buffered messages and opened subscriptions are indexed by
//! `(message name, correlation key)`.

use serde::{Deserialize, Serialize};

use crate::document::Document;

mod buffer;
mod subscription;

pub use buffer::*;
pub use subscription::*;

/// A published message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub correlation_key: String,
    #[serde(default)]
    pub id: Option<String>,
    pub variables: Document,
    pub ttl_ms: u64,
}

impl Message {
    /// The message id, if one was given and is not empty
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

pub(crate) fn index_key(name: &str, correlation_key: &str) -> (String, String) {
    (name.to_string(), correlation_key.to_string())
}
