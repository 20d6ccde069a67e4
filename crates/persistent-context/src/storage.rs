//! On-disk representation of contexts
//!
//! Each context lives in its own file: the gzip-compressed JSON record
//! `{"key": .., "context": {"last_access_time": .., "value": ..}}`. Writes go to
//! a temporary sibling first and are renamed into place, so an entry file is
//! never observed half-written.

use crate::cache::CacheShared;
use crate::context::{Context, ContextHandle, ContextSnapshot};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Extension of entry files
pub const ENTRY_EXTENSION: &str = "ctx";
const TEMP_SUFFIX: &str = ".tmp";

const MAX_ENCODED_NAME_LEN: usize = 200;
const TRUNCATED_NAME_LEN: usize = 180;
const HASH_SUFFIX_LEN: usize = 16;
const COMPRESSION_LEVEL: u32 = 6;

/// Result of persisting one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The value was empty; any existing file was deleted
    RemovedEmpty,
    /// The compressed record exceeded the size limit and was not written
    Oversized,
    Error,
}

#[derive(Serialize)]
struct RecordRef<'a> {
    key: &'a str,
    context: &'a ContextSnapshot,
}

#[derive(Deserialize)]
struct Record {
    key: String,
    context: ContextSnapshot,
}

/// File name for a key: percent-encoded, hash-truncated when long
pub fn context_file_name(key: &str) -> String {
    let encoded = urlencoding::encode(key);
    let stem = if encoded.len() > MAX_ENCODED_NAME_LEN {
        let digest = hex::encode(Sha256::digest(encoded.as_bytes()));
        // percent-encoded text is ASCII, so byte slicing is safe
        format!(
            "{}_{}",
            &encoded[..TRUNCATED_NAME_LEN],
            &digest[..HASH_SUFFIX_LEN]
        )
    } else {
        encoded.into_owned()
    };
    format!("{}.{}", stem, ENTRY_EXTENSION)
}

pub fn context_file_path(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir.join(context_file_name(key))
}

pub(crate) fn is_entry_file(file_name: &str) -> bool {
    file_name
        .strip_suffix(ENTRY_EXTENSION)
        .is_some_and(|stem| stem.len() > 1 && stem.ends_with('.'))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Size of the entry file for `key`, 0 when absent
pub fn entry_file_size(cache_dir: &Path, key: &str) -> u64 {
    fs::metadata(context_file_path(cache_dir, key))
        .map(|meta| meta.len())
        .unwrap_or(0)
}

/// Paths of the entry files in `cache_dir`, in no particular order
pub fn list_entry_files(cache_dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(cache_dir = ?cache_dir, error = %e, "Failed to scan cache directory");
            }
            return Vec::new();
        }
    };

    entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .filter(|entry| entry.file_name().to_str().is_some_and(is_entry_file))
        .map(|entry| entry.path())
        .collect()
}

fn encode_record(key: &str, snapshot: &ContextSnapshot) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(&RecordRef {
        key,
        context: snapshot,
    })?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder.write_all(&json)?;
    encoder.finish()
}

fn decode_record(data: &[u8]) -> io::Result<Record> {
    let mut json = Vec::new();
    GzDecoder::new(data).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

fn write_atomically(temp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp, path)
}

/// Remove a file, treating "already gone" as success
fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Persist one context. Never fails; problems are logged and reported as
/// [`SaveOutcome::Error`].
pub fn save_context(cache_dir: &Path, context: &Context, max_context_size: u64) -> SaveOutcome {
    let key = context.key();
    let path = context_file_path(cache_dir, key);
    let (snapshot, version) = context.snapshot();

    if snapshot.value.is_empty() {
        warn!(key = %key, "Removing context with empty value");
        if let Err(e) = remove_if_exists(&path) {
            warn!(key = %key, error = %e, "Failed to remove context file");
        }
        context.mark_clean(version);
        return SaveOutcome::RemovedEmpty;
    }

    let data = match encode_record(key, &snapshot) {
        Ok(data) => data,
        Err(e) => {
            error!(key = %key, error = %e, "Failed to serialize context");
            return SaveOutcome::Error;
        }
    };
    let size = data.len() as u64;

    if max_context_size > 0 && size > max_context_size {
        warn!(
            key = %key,
            size,
            limit = max_context_size,
            "Context exceeds size limit, skipping save"
        );
        // Clean anyway so the next pass does not retry the same value
        context.mark_clean(version);
        match remove_if_exists(&path) {
            Ok(true) => info!(key = %key, path = ?path, "Removed existing oversized context file"),
            Ok(false) => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to remove oversized context file"),
        }
        return SaveOutcome::Oversized;
    }

    let temp = temp_path(&path);
    match write_atomically(&temp, &path, &data) {
        Ok(()) => {
            context.mark_clean(version);
            debug!(key = %key, size, "Saved context");
            SaveOutcome::Saved
        }
        Err(e) => {
            error!(key = %key, error = %e, "Failed to save context");
            if let Err(e) = remove_if_exists(&temp) {
                warn!(path = ?temp, error = %e, "Failed to remove temporary file");
            }
            SaveOutcome::Error
        }
    }
}

/// Delete the entry file for `key`. Returns false only on an I/O error.
pub fn delete_context_file(cache_dir: &Path, key: &str) -> bool {
    let path = context_file_path(cache_dir, key);
    match remove_if_exists(&path) {
        Ok(removed) => {
            if removed {
                debug!(key = %key, path = ?path, "Removed context file");
            }
            true
        }
        Err(e) => {
            error!(key = %key, path = ?path, error = %e, "Failed to remove context file");
            false
        }
    }
}

/// Rebuild the context index from the entry files in `cache_dir`.
///
/// Unreadable, malformed, mismatched and empty entries are deleted so they
/// cannot fail again on the next start. Leftover temporary files from an
/// interrupted write are deleted as well.
pub(crate) fn load_contexts(
    cache_dir: &Path,
    owner: &Weak<CacheShared>,
) -> HashMap<String, ContextHandle> {
    let mut loaded = HashMap::new();

    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(cache_dir = ?cache_dir, "No existing cache directory found");
            return loaded;
        }
        Err(e) => {
            warn!(cache_dir = ?cache_dir, error = %e, "Failed to scan cache directory, starting with empty cache");
            return loaded;
        }
    };

    let mut failed = 0usize;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if file_name.ends_with(TEMP_SUFFIX) {
            debug!(path = ?path, "Removing stale temporary file");
            let _ = remove_if_exists(&path);
            continue;
        }
        if !is_entry_file(file_name) {
            continue;
        }

        let record = match fs::read(&path).and_then(|data| decode_record(&data)) {
            Ok(record) => record,
            Err(e) => {
                warn!(file = %file_name, error = %e, "Failed to load context, removing file");
                let _ = remove_if_exists(&path);
                failed += 1;
                continue;
            }
        };

        if context_file_name(&record.key) != file_name {
            warn!(file = %file_name, key = %record.key, "Context key does not match file name, removing file");
            let _ = remove_if_exists(&path);
            failed += 1;
            continue;
        }

        if record.context.value.is_empty() {
            warn!(key = %record.key, "Context has empty value, removing file");
            let _ = remove_if_exists(&path);
            failed += 1;
            continue;
        }

        let context = Context::from_snapshot(record.key.clone(), record.context, owner.clone());
        loaded.insert(record.key, Arc::new(context));
    }

    info!(cache_dir = ?cache_dir, loaded = loaded.len(), "Loaded contexts");
    if failed > 0 {
        warn!(failed, "Discarded unreadable context files");
    }

    loaded
}
