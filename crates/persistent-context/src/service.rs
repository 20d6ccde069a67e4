//! Lazily initialized entry point to the context cache
//!
//! Construct one [`ContextService`] per process and hand it (or an `Arc` of it)
//! to whatever needs contexts. The cache behind it is opened on first use, or
//! immediately when `lazy_initialization` is disabled.

use crate::cache::{lock, ContextCache};
use crate::config::ContextCacheConfig;
use crate::context::ContextHandle;
use crate::error::Result;
use crate::types::{ContextValue, ValueKind};
use std::sync::{Mutex, OnceLock};
use tracing::{error, info};

pub struct ContextService {
    config: ContextCacheConfig,
    cache: OnceLock<ContextCache>,
    init_lock: Mutex<()>,
}

impl ContextService {
    pub fn new(config: ContextCacheConfig) -> Result<Self> {
        let service = Self {
            config,
            cache: OnceLock::new(),
            init_lock: Mutex::new(()),
        };
        if !service.config.lazy_initialization {
            info!("Lazy initialization disabled, opening context cache immediately");
            service.ensure_initialized()?;
        }
        Ok(service)
    }

    /// Service configured from `CONTEXT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ContextCacheConfig::from_env())
    }

    fn ensure_initialized(&self) -> Result<&ContextCache> {
        if let Some(cache) = self.cache.get() {
            return Ok(cache);
        }

        let _guard = lock(&self.init_lock);
        // Another caller may have finished while we waited for the lock
        if let Some(cache) = self.cache.get() {
            return Ok(cache);
        }

        info!(cache_dir = ?self.config.cache_dir, "Initializing persistent context cache");
        let cache = ContextCache::open(self.config.clone())?;
        Ok(self.cache.get_or_init(|| cache))
    }

    pub fn is_initialized(&self) -> bool {
        self.cache.get().is_some()
    }

    /// The underlying cache, opening it if needed
    pub fn cache(&self) -> Result<&ContextCache> {
        self.ensure_initialized()
    }

    pub fn has(&self, key: &str) -> bool {
        match self.ensure_initialized() {
            Ok(cache) => cache.has_context(key),
            Err(e) => {
                error!(error = %e, "Context cache unavailable");
                false
            }
        }
    }

    pub fn get_or_create(
        &self,
        key: &str,
        default_value: impl Into<ContextValue>,
    ) -> Result<ContextHandle> {
        self.ensure_initialized()?
            .get_or_create_context(key, default_value)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.ensure_initialized()?.remove_context(key)
    }

    pub fn update_access_time(&self, key: &str) -> Result<()> {
        self.ensure_initialized()?.update_context_access_time(key);
        Ok(())
    }

    pub fn resolve_by_value_type(&self, kind: ValueKind) -> Result<Vec<ContextHandle>> {
        Ok(self
            .ensure_initialized()?
            .resolve_contexts_by_value_type(kind))
    }

    /// Flush and stop the cache if it was ever opened. Also runs on drop.
    pub fn shutdown(&self) {
        if let Some(cache) = self.cache.get() {
            cache.shutdown();
        }
    }
}

impl Drop for ContextService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
