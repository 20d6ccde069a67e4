//! Cache configuration

use std::path::PathBuf;
use std::time::Duration;

const MB: f64 = 1024.0 * 1024.0;

/// Configuration for the persistent context cache
#[derive(Debug, Clone, PartialEq)]
pub struct ContextCacheConfig {
    /// Defer opening the cache until first use
    pub lazy_initialization: bool,
    /// Save automatically after every create / set_value
    pub auto_save: bool,
    pub cache_dir: PathBuf,
    /// Soft ceiling in bytes; above it old data becomes evictable
    pub max_cache_size: u64,
    /// Minimum idle time before a context counts as old
    pub old_data_threshold: Duration,
    /// Hard ceiling in bytes (0 disables forced eviction)
    pub absolute_max_cache_size: u64,
    /// Largest compressed entry that will be written (0 = unlimited)
    pub max_context_size: u64,
    /// Longest accepted key in characters (0 = unlimited)
    pub max_key_length: usize,
}

impl Default for ContextCacheConfig {
    fn default() -> Self {
        Self {
            lazy_initialization: true,
            auto_save: true,
            cache_dir: PathBuf::from("./cache/persistent_context"),
            max_cache_size: 100 * 1024 * 1024,          // 100MB
            old_data_threshold: Duration::from_secs(24 * 60 * 60), // 24 hours
            absolute_max_cache_size: 200 * 1024 * 1024, // 200MB
            max_context_size: 50 * 1024 * 1024,         // 50MB
            max_key_length: 256,
        }
    }
}

impl ContextCacheConfig {
    /// Load configuration from `CONTEXT_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source, falling back to
    /// defaults for missing or unparseable values
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let lazy_initialization = lookup("CONTEXT_LAZY_INITIALIZATION")
            .and_then(|s| parse_bool(&s))
            .unwrap_or(defaults.lazy_initialization);

        let auto_save = lookup("CONTEXT_AUTO_SAVE")
            .and_then(|s| parse_bool(&s))
            .unwrap_or(defaults.auto_save);

        let cache_dir = lookup("CONTEXT_CACHE_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let max_cache_size = lookup("CONTEXT_MAX_CACHE_SIZE_MB")
            .and_then(|s| parse_megabytes(&s))
            .unwrap_or(defaults.max_cache_size);

        let old_data_threshold = lookup("CONTEXT_OLD_DATA_THRESHOLD_HOURS")
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|hours| hours.is_finite() && *hours >= 0.0)
            .and_then(|hours| Duration::try_from_secs_f64(hours * 3600.0).ok())
            .unwrap_or(defaults.old_data_threshold);

        let absolute_max_cache_size = lookup("CONTEXT_ABSOLUTE_MAX_CACHE_SIZE_MB")
            .and_then(|s| parse_megabytes(&s))
            .unwrap_or(defaults.absolute_max_cache_size);

        let max_context_size = lookup("CONTEXT_MAX_CONTEXT_SIZE_MB")
            .and_then(|s| parse_megabytes(&s))
            .unwrap_or(defaults.max_context_size);

        let max_key_length = lookup("CONTEXT_MAX_KEY_LENGTH")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(defaults.max_key_length);

        Self {
            lazy_initialization,
            auto_save,
            cache_dir,
            max_cache_size,
            old_data_threshold,
            absolute_max_cache_size,
            max_context_size,
            max_key_length,
        }
    }

    /// Default configuration rooted at `cache_dir`
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_megabytes(value: &str) -> Option<u64> {
    let mb = value.trim().parse::<f64>().ok()?;
    if !mb.is_finite() || mb < 0.0 {
        return None;
    }
    Some((mb * MB) as u64)
}
