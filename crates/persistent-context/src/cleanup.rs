//! Size-bounded eviction of persisted contexts
//!
//! Above the soft ceiling only contexts idle for at least the old-data
//! threshold are evicted, and nothing is evicted when none are that old.
//! Above the hard ceiling every context is eligible. Victims go oldest access
//! first until the projected size drops to the soft ceiling.

use crate::config::ContextCacheConfig;
use crate::storage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupThresholds {
    pub max_cache_size: u64,
    pub absolute_max_cache_size: u64,
    pub old_data_threshold: Duration,
}

impl From<&ContextCacheConfig> for CleanupThresholds {
    fn from(config: &ContextCacheConfig) -> Self {
        Self {
            max_cache_size: config.max_cache_size,
            absolute_max_cache_size: config.absolute_max_cache_size,
            old_data_threshold: config.old_data_threshold,
        }
    }
}

/// A context considered for eviction
#[derive(Debug, Clone)]
pub struct CleanupCandidate {
    pub key: String,
    pub last_access_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    /// At or below the soft ceiling
    NotNeeded,
    /// Above the soft ceiling but nothing is old enough
    NoOldData,
    Normal,
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub mode: CleanupMode,
    pub initial_size: u64,
    pub removed: Vec<String>,
    pub freed: u64,
}

impl CleanupReport {
    fn untouched(mode: CleanupMode, initial_size: u64) -> Self {
        Self {
            mode,
            initial_size,
            removed: Vec::new(),
            freed: 0,
        }
    }
}

/// Sum of the sizes of all entry files in `cache_dir`
pub fn calculate_total_cache_size(cache_dir: &Path) -> u64 {
    storage::list_entry_files(cache_dir)
        .iter()
        .filter_map(|path| match fs::metadata(path) {
            Ok(meta) => Some(meta.len()),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to get size of context file");
                None
            }
        })
        .sum()
}

/// Evict contexts through `remove` until the cache fits under the soft ceiling.
///
/// `remove` returns whether the entry is gone; keys it could not remove are
/// left out of the report and do not count towards the freed size.
pub fn cleanup_old_data<F>(
    cache_dir: &Path,
    candidates: &[CleanupCandidate],
    thresholds: &CleanupThresholds,
    now: DateTime<Utc>,
    mut remove: F,
) -> CleanupReport
where
    F: FnMut(&str) -> bool,
{
    let current_size = calculate_total_cache_size(cache_dir);
    if current_size <= thresholds.max_cache_size {
        return CleanupReport::untouched(CleanupMode::NotNeeded, current_size);
    }

    info!(
        size = current_size,
        threshold = thresholds.max_cache_size,
        "Cache size exceeds threshold"
    );

    let forced = thresholds.absolute_max_cache_size > 0
        && current_size > thresholds.absolute_max_cache_size;

    let mut eligible: Vec<&CleanupCandidate> = if forced {
        info!(
            limit = thresholds.absolute_max_cache_size,
            "Cache size exceeds absolute maximum, forcing cleanup"
        );
        candidates.iter().collect()
    } else {
        candidates
            .iter()
            .filter(|c| age(now, c.last_access_time) >= thresholds.old_data_threshold)
            .collect()
    };

    if eligible.is_empty() && !forced {
        info!(
            threshold_secs = thresholds.old_data_threshold.as_secs(),
            "No old data found, skipping cleanup"
        );
        return CleanupReport::untouched(CleanupMode::NoOldData, current_size);
    }

    eligible.sort_by_key(|c| c.last_access_time);

    let mut report = CleanupReport::untouched(
        if forced {
            CleanupMode::Forced
        } else {
            CleanupMode::Normal
        },
        current_size,
    );

    for candidate in eligible {
        let file_size = storage::entry_file_size(cache_dir, &candidate.key);
        if !remove(&candidate.key) {
            warn!(key = %candidate.key, "Failed to evict context");
            continue;
        }
        report.removed.push(candidate.key.clone());
        report.freed += file_size;

        if current_size.saturating_sub(report.freed) <= thresholds.max_cache_size {
            break;
        }
    }

    if !report.removed.is_empty() {
        info!(
            removed = report.removed.len(),
            freed = report.freed,
            mode = ?report.mode,
            new_size = current_size.saturating_sub(report.freed),
            "Cleaned up contexts"
        );
    }

    report
}

fn age(now: DateTime<Utc>, last_access_time: DateTime<Utc>) -> Duration {
    (now - last_access_time).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_entry(dir: &Path, key: &str, size: usize) {
        fs::write(storage::context_file_path(dir, key), vec![0u8; size]).unwrap();
    }

    fn candidate(key: &str, hours_ago: i64, now: DateTime<Utc>) -> CleanupCandidate {
        CleanupCandidate {
            key: key.to_string(),
            last_access_time: now - chrono::Duration::hours(hours_ago),
        }
    }

    /// Removal callback that deletes the file like the cache would
    fn remover(dir: &Path) -> impl FnMut(&str) -> bool + '_ {
        move |key: &str| storage::delete_context_file(dir, key)
    }

    fn thresholds(soft: u64, hard: u64, hours: u64) -> CleanupThresholds {
        CleanupThresholds {
            max_cache_size: soft,
            absolute_max_cache_size: hard,
            old_data_threshold: Duration::from_secs(hours * 3600),
        }
    }

    #[test]
    fn test_total_size_counts_only_entry_files() {
        let dir = tempdir().unwrap();
        write_entry(dir.path(), "a", 100);
        write_entry(dir.path(), "b", 50);
        fs::write(dir.path().join("a.ctx.tmp"), vec![0u8; 1000]).unwrap();
        fs::write(dir.path().join("readme.md"), vec![0u8; 1000]).unwrap();

        assert_eq!(calculate_total_cache_size(dir.path()), 150);
    }

    #[test]
    fn test_total_size_missing_directory() {
        let dir = tempdir().unwrap();
        assert_eq!(calculate_total_cache_size(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_under_soft_ceiling_is_noop() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        write_entry(dir.path(), "a", 100);

        let report = cleanup_old_data(
            dir.path(),
            &[candidate("a", 100, now)],
            &thresholds(1000, 2000, 1),
            now,
            remover(dir.path()),
        );
        assert_eq!(report.mode, CleanupMode::NotNeeded);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_fresh_data_over_soft_ceiling_is_kept() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        write_entry(dir.path(), "a", 600);
        write_entry(dir.path(), "b", 600);

        let report = cleanup_old_data(
            dir.path(),
            &[candidate("a", 1, now), candidate("b", 2, now)],
            &thresholds(1000, 2000, 24),
            now,
            remover(dir.path()),
        );
        assert_eq!(report.mode, CleanupMode::NoOldData);
        assert!(report.removed.is_empty());
        assert_eq!(calculate_total_cache_size(dir.path()), 1200);
    }

    #[test]
    fn test_normal_mode_only_evicts_old_data() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        write_entry(dir.path(), "fresh", 600);
        write_entry(dir.path(), "old", 300);
        write_entry(dir.path(), "older", 300);

        let report = cleanup_old_data(
            dir.path(),
            &[
                candidate("fresh", 1, now),
                candidate("old", 30, now),
                candidate("older", 48, now),
            ],
            &thresholds(1000, 0, 24),
            now,
            remover(dir.path()),
        );
        assert_eq!(report.mode, CleanupMode::Normal);
        // Oldest goes first and is enough to get back under 1000
        assert_eq!(report.removed, vec!["older".to_string()]);
        assert_eq!(report.freed, 300);
        assert!(storage::context_file_path(dir.path(), "fresh").exists());
        assert!(storage::context_file_path(dir.path(), "old").exists());
    }

    #[test]
    fn test_normal_mode_stops_when_old_data_exhausted() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        write_entry(dir.path(), "fresh", 1500);
        write_entry(dir.path(), "old", 100);

        let report = cleanup_old_data(
            dir.path(),
            &[candidate("fresh", 1, now), candidate("old", 30, now)],
            &thresholds(1000, 0, 24),
            now,
            remover(dir.path()),
        );
        assert_eq!(report.removed, vec!["old".to_string()]);
        assert!(storage::context_file_path(dir.path(), "fresh").exists());
    }

    #[test]
    fn test_forced_mode_ignores_age() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        write_entry(dir.path(), "a", 800);
        write_entry(dir.path(), "b", 800);
        write_entry(dir.path(), "c", 800);

        let report = cleanup_old_data(
            dir.path(),
            &[
                candidate("c", 0, now),
                candidate("a", 2, now),
                candidate("b", 1, now),
            ],
            &thresholds(1000, 2000, 24),
            now,
            remover(dir.path()),
        );
        assert_eq!(report.mode, CleanupMode::Forced);
        assert_eq!(report.removed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(calculate_total_cache_size(dir.path()), 800);
    }

    #[test]
    fn test_zero_hard_ceiling_never_forces() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        write_entry(dir.path(), "a", 5000);

        let report = cleanup_old_data(
            dir.path(),
            &[candidate("a", 0, now)],
            &thresholds(1000, 0, 24),
            now,
            remover(dir.path()),
        );
        assert_eq!(report.mode, CleanupMode::NoOldData);
    }

    #[test]
    fn test_failed_removal_is_not_counted() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        write_entry(dir.path(), "stuck", 600);
        write_entry(dir.path(), "old", 600);
        write_entry(dir.path(), "fresh", 300);

        let mut delete = remover(dir.path());
        let report = cleanup_old_data(
            dir.path(),
            &[
                candidate("stuck", 48, now),
                candidate("old", 30, now),
                candidate("fresh", 1, now),
            ],
            &thresholds(1000, 0, 24),
            now,
            |key: &str| key != "stuck" && delete(key),
        );

        // The oldest entry stays, so eviction moves on to the next one
        assert_eq!(report.removed, vec!["old".to_string()]);
        assert_eq!(report.freed, 600);
        assert!(storage::context_file_path(dir.path(), "stuck").exists());
        assert_eq!(calculate_total_cache_size(dir.path()), 900);
    }
}
