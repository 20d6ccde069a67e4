//! Payload and statistics types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Base64-encoded binary data together with its original file name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Base64Blob {
    pub base64: String,
    pub filename: String,
}

impl Base64Blob {
    pub fn new(base64: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            base64: base64.into(),
            filename: filename.into(),
        }
    }

    /// File name up to the first `.`
    pub fn basename(&self) -> &str {
        self.filename.split('.').next().unwrap_or_default()
    }

    /// File name after the last `.`
    pub fn suffix(&self) -> &str {
        self.filename.rsplit('.').next().unwrap_or_default()
    }
}

/// Value held by a context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ContextValue {
    #[default]
    Empty,
    Text(String),
    Blob(Base64Blob),
    Record(Map<String, Value>),
}

impl ContextValue {
    /// Empty values are never persisted
    pub fn is_empty(&self) -> bool {
        match self {
            ContextValue::Empty => true,
            ContextValue::Text(text) => text.is_empty(),
            ContextValue::Blob(blob) => blob.base64.is_empty(),
            ContextValue::Record(fields) => fields.is_empty(),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ContextValue::Empty => ValueKind::Empty,
            ContextValue::Text(_) => ValueKind::Text,
            ContextValue::Blob(_) => ValueKind::Blob,
            ContextValue::Record(_) => ValueKind::Record,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContextValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Base64Blob> {
        match self {
            ContextValue::Blob(blob) => Some(blob),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Map<String, Value>> {
        match self {
            ContextValue::Record(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<String> for ContextValue {
    fn from(text: String) -> Self {
        ContextValue::Text(text)
    }
}

impl From<&str> for ContextValue {
    fn from(text: &str) -> Self {
        ContextValue::Text(text.to_string())
    }
}

impl From<Base64Blob> for ContextValue {
    fn from(blob: Base64Blob) -> Self {
        ContextValue::Blob(blob)
    }
}

impl From<Map<String, Value>> for ContextValue {
    fn from(fields: Map<String, Value>) -> Self {
        ContextValue::Record(fields)
    }
}

/// Discriminant of [`ContextValue`], used for type-based lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Empty,
    Text,
    Blob,
    Record,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Empty => "empty",
            ValueKind::Text => "text",
            ValueKind::Blob => "blob",
            ValueKind::Record => "record",
        };
        f.write_str(name)
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub dirty_entries: usize,
    pub disk_size: u64,
    pub save_passes: u64,
}
