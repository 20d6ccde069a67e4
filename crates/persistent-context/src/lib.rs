//! Persistent context cache
//!
//! A disk-backed, key-addressed store of contexts. Mutations are written by a
//! single background worker that coalesces save requests; entry files are
//! compressed and replaced atomically, and total disk usage is kept under
//! configurable soft and hard ceilings.

mod cache;
pub mod cleanup;
mod config;
mod context;
mod error;
mod service;
pub mod storage;
mod types;

pub use cache::ContextCache;
pub use cleanup::{CleanupMode, CleanupReport};
pub use config::ContextCacheConfig;
pub use context::{Context, ContextHandle};
pub use error::{ContextError, Result};
pub use service::ContextService;
pub use storage::SaveOutcome;
pub use types::{Base64Blob, CacheStats, ContextValue, ValueKind};
