//! Error types for the persistent context cache

use std::fmt;

#[derive(Debug)]
pub enum ContextError {
    EmptyKey,
    KeyTooLong { length: usize, max: usize },
    NotFound(String),
    Io(Box<std::io::Error>),
    Config(String),
}

impl ContextError {
    /// True for errors caused by a malformed key rather than a missing entry
    pub fn is_validation(&self) -> bool {
        matches!(self, ContextError::EmptyKey | ContextError::KeyTooLong { .. })
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::EmptyKey => write!(f, "Context key cannot be empty"),
            ContextError::KeyTooLong { length, max } => write!(
                f,
                "Context key length ({}) exceeds maximum allowed length ({})",
                length, max
            ),
            ContextError::NotFound(key) => write!(f, "Context with key '{}' not found", key),
            ContextError::Io(err) => write!(f, "IO error: {}", err),
            ContextError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ContextError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ContextError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ContextError {
    fn from(err: std::io::Error) -> Self {
        ContextError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ContextError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ContextError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ContextError>;
