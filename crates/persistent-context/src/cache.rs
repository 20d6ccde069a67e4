//! In-memory context index with coalesced background persistence
//!
//! All saves run on one dedicated worker thread fed through a mailbox of
//! capacity one. A save requested while a pass is running only sets
//! `needs_another`; the worker then runs exactly one follow-up pass before it
//! goes idle, so there is never more than one pass in flight and no mutation
//! is left unsaved once the cache is quiet.

use crate::cleanup::{self, CleanupCandidate, CleanupReport, CleanupThresholds};
use crate::config::ContextCacheConfig;
use crate::context::{Context, ContextHandle};
use crate::error::{ContextError, Result};
use crate::storage::{self, SaveOutcome};
use crate::types::{CacheStats, ContextValue, ValueKind};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const WORKER_THREAD_NAME: &str = "persistent-context-saver";

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct SaveState {
    /// A pass is queued or running
    in_progress: bool,
    /// A save was requested while a pass was in progress
    needs_another: bool,
    shutting_down: bool,
    passes_started: u64,
    mailbox: Option<mpsc::Sender<()>>,
}

/// Index and save coordination share one lock
struct CacheState {
    contexts: HashMap<String, ContextHandle>,
    save: SaveState,
}

pub(crate) struct CacheShared {
    pub(crate) config: ContextCacheConfig,
    this: Weak<CacheShared>,
    state: Mutex<CacheState>,
    idle: Condvar,
    /// Serializes entry-file writes and deletions
    io_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    save_passes: AtomicU64,
}

/// Disk-backed store of contexts keyed by string.
///
/// Cloning is cheap; clones share the same index and worker.
#[derive(Clone)]
pub struct ContextCache {
    shared: Arc<CacheShared>,
}

impl ContextCache {
    /// Open (or create) the cache directory, load its entries and start the
    /// save worker
    pub fn open(config: ContextCacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir)?;

        let (sender, receiver) = mpsc::channel(1);

        let shared = Arc::new_cyclic(|this: &Weak<CacheShared>| {
            let contexts = storage::load_contexts(&config.cache_dir, this);
            CacheShared {
                config,
                this: this.clone(),
                state: Mutex::new(CacheState {
                    contexts,
                    save: SaveState {
                        mailbox: Some(sender),
                        ..SaveState::default()
                    },
                }),
                idle: Condvar::new(),
                io_lock: Mutex::new(()),
                worker: Mutex::new(None),
                save_passes: AtomicU64::new(0),
            }
        });

        let worker_ref = Arc::downgrade(&shared);
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(worker_ref, receiver))?;
        *lock(&shared.worker) = Some(handle);

        info!(
            cache_dir = ?shared.config.cache_dir,
            entries = lock(&shared.state).contexts.len(),
            auto_save = shared.config.auto_save,
            "Context cache opened"
        );

        Ok(Self { shared })
    }

    pub fn config(&self) -> &ContextCacheConfig {
        &self.shared.config
    }

    /// Look up a context. Invalid keys and missing entries are errors.
    pub fn get_context(&self, key: &str) -> Result<ContextHandle> {
        self.shared.validate_key(key)?;
        let state = self.shared.lock_state();
        match state.contexts.get(key) {
            Some(context) => {
                context.update_access_time();
                Ok(Arc::clone(context))
            }
            None => Err(ContextError::NotFound(key.to_string())),
        }
    }

    /// Existence check; invalid keys simply do not exist
    pub fn has_context(&self, key: &str) -> bool {
        if self.shared.validate_key(key).is_err() {
            return false;
        }
        let state = self.shared.lock_state();
        match state.contexts.get(key) {
            Some(context) => {
                context.update_access_time();
                true
            }
            None => false,
        }
    }

    /// Insert a new context, replacing any existing one with the same key
    pub fn create_context(&self, key: &str, value: impl Into<ContextValue>) -> Result<ContextHandle> {
        self.shared.validate_key(key)?;
        let context = Arc::new(self.shared.new_context(key, value.into()));
        self.shared
            .lock_state()
            .contexts
            .insert(key.to_string(), Arc::clone(&context));

        if self.shared.config.auto_save {
            self.shared.request_save();
        }
        Ok(context)
    }

    /// Return the context for `key`, creating it with `default` if absent
    pub fn get_or_create_context(
        &self,
        key: &str,
        default: impl Into<ContextValue>,
    ) -> Result<ContextHandle> {
        self.shared.validate_key(key)?;
        let context = {
            let mut state = self.shared.lock_state();
            if let Some(existing) = state.contexts.get(key) {
                existing.update_access_time();
                return Ok(Arc::clone(existing));
            }
            let context = Arc::new(self.shared.new_context(key, default.into()));
            state.contexts.insert(key.to_string(), Arc::clone(&context));
            context
        };

        if self.shared.config.auto_save {
            self.shared.request_save();
        }
        Ok(context)
    }

    /// Remove a context from memory and disk
    pub fn remove_context(&self, key: &str) -> Result<()> {
        self.shared.remove_context(key)
    }

    /// Refresh the access time of `key` if it exists; invalid keys are ignored
    pub fn update_context_access_time(&self, key: &str) {
        if self.shared.validate_key(key).is_err() {
            return;
        }
        if let Some(context) = self.shared.lock_state().contexts.get(key) {
            context.update_access_time();
        }
    }

    /// All contexts currently holding a value of `kind`
    pub fn resolve_contexts_by_value_type(&self, kind: ValueKind) -> Vec<ContextHandle> {
        self.resolve_contexts(|value| value.kind() == kind)
    }

    /// All contexts whose value satisfies `predicate`
    pub fn resolve_contexts<F>(&self, predicate: F) -> Vec<ContextHandle>
    where
        F: Fn(&ContextValue) -> bool,
    {
        self.shared
            .contexts_snapshot()
            .into_iter()
            .filter(|context| context.matches(&predicate))
            .collect()
    }

    /// Keys of all contexts, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.lock_state().contexts.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.shared.lock_state().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Request an asynchronous save of all dirty contexts
    pub fn save(&self) {
        self.shared.request_save();
    }

    /// Save all dirty contexts on the calling thread, then run cleanup.
    /// Returns false if any entry failed to save.
    pub fn save_sync(&self) -> bool {
        self.shared.save_and_cleanup()
    }

    /// [`save_sync`](Self::save_sync) on the tokio blocking pool
    pub async fn flush(&self) -> bool {
        let cache = self.clone();
        match tokio::task::spawn_blocking(move || cache.save_sync()).await {
            Ok(success) => success,
            Err(e) => {
                error!(error = %e, "Flush task failed");
                false
            }
        }
    }

    /// Block until no background save is queued or running
    pub fn wait_for_idle(&self) {
        let mut state = self.shared.lock_state();
        while state.save.in_progress {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Evict contexts according to the configured size ceilings
    pub fn run_cleanup(&self) -> CleanupReport {
        self.shared.cleanup_old_data()
    }

    /// Stop the worker and write everything still dirty.
    ///
    /// Later asynchronous save requests are ignored. Calling this more than
    /// once is harmless.
    pub fn shutdown(&self) {
        let mailbox = {
            let mut state = self.shared.lock_state();
            if state.save.shutting_down {
                return;
            }
            info!("Shutting down context cache");
            state.save.shutting_down = true;
            state.save.mailbox.take()
        };
        // Closing the mailbox lets the worker exit after its current pass
        drop(mailbox);

        self.wait_for_idle();
        if let Some(handle) = lock(&self.shared.worker).take() {
            if handle.join().is_err() {
                error!("Save worker panicked");
            }
        }

        self.shared.run_save_pass();
        info!("Context cache shutdown complete");
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, dirty_entries) = {
            let state = self.shared.lock_state();
            let dirty = state.contexts.values().filter(|c| c.is_dirty()).count();
            (state.contexts.len(), dirty)
        };
        CacheStats {
            entries,
            dirty_entries,
            disk_size: cleanup::calculate_total_cache_size(&self.shared.config.cache_dir),
            save_passes: self.shared.save_passes.load(Ordering::Relaxed),
        }
    }
}

impl CacheShared {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        lock(&self.state)
    }

    fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(ContextError::EmptyKey);
        }
        let max = self.config.max_key_length;
        if max > 0 {
            let length = key.chars().count();
            if length > max {
                return Err(ContextError::KeyTooLong { length, max });
            }
        }
        Ok(())
    }

    fn new_context(&self, key: &str, value: ContextValue) -> Context {
        Context::new(key.to_string(), value, self.this.clone())
    }

    fn contexts_snapshot(&self) -> Vec<ContextHandle> {
        self.lock_state().contexts.values().cloned().collect()
    }

    /// True while `context` is still the indexed entry for its key
    fn is_current(state: &CacheState, context: &ContextHandle) -> bool {
        state
            .contexts
            .get(context.key())
            .is_some_and(|indexed| Arc::ptr_eq(indexed, context))
    }

    /// Indexed keys are removed even when they no longer pass validation,
    /// e.g. after `max_key_length` was lowered between runs.
    fn remove_context(&self, key: &str) -> Result<()> {
        match self.evict_context(key) {
            Some(_) => Ok(()),
            None => self.validate_key(key),
        }
    }

    /// Drop `key` from the index and delete its file. `None` when the key was
    /// not indexed, otherwise whether the file is gone.
    fn evict_context(&self, key: &str) -> Option<bool> {
        let _io = lock(&self.io_lock);
        self.lock_state().contexts.remove(key)?;
        let deleted = storage::delete_context_file(&self.config.cache_dir, key);
        debug!(key = %key, "Removed context");
        Some(deleted)
    }

    /// Queue a background pass, or fold the request into the running one
    pub(crate) fn request_save(&self) {
        let mut state = self.lock_state();
        let save = &mut state.save;
        if save.shutting_down {
            return;
        }
        if save.in_progress {
            save.needs_another = true;
            return;
        }
        let Some(mailbox) = save.mailbox.as_ref() else {
            return;
        };
        // Nothing is queued while idle, so the single slot is free
        match mailbox.try_send(()) {
            Ok(()) => save.in_progress = true,
            Err(e) => warn!(error = %e, "Failed to queue context save"),
        }
    }

    /// Worker side: run passes until no further save was requested
    fn run_queued_saves(&self) {
        loop {
            {
                let mut state = self.lock_state();
                state.save.needs_another = false;
                state.save.passes_started += 1;
            }

            self.save_and_cleanup();

            let mut state = self.lock_state();
            if state.save.needs_another && !state.save.shutting_down {
                debug!("Save requested during pass, running another");
                continue;
            }
            state.save.in_progress = false;
            state.save.needs_another = false;
            self.idle.notify_all();
            break;
        }
    }

    fn save_and_cleanup(&self) -> bool {
        let success = self.run_save_pass();
        if success {
            self.cleanup_old_data();
        }
        success
    }

    /// Write every dirty context. Returns false if any entry failed.
    fn run_save_pass(&self) -> bool {
        let dirty: Vec<ContextHandle> = self
            .contexts_snapshot()
            .into_iter()
            .filter(|context| context.is_dirty())
            .collect();

        let cache_dir = &self.config.cache_dir;
        let (mut saved, mut removed, mut oversized, mut failed) = (0usize, 0usize, 0usize, 0usize);

        for context in dirty {
            let _io = lock(&self.io_lock);
            // Removed while the pass was running; writing now would resurrect it
            if !Self::is_current(&self.lock_state(), &context) {
                continue;
            }

            match storage::save_context(cache_dir, &context, self.config.max_context_size) {
                SaveOutcome::Saved => saved += 1,
                SaveOutcome::RemovedEmpty => {
                    removed += 1;
                    let mut state = self.lock_state();
                    // A value set since the save keeps the context dirty
                    if Self::is_current(&state, &context) && !context.is_dirty() {
                        state.contexts.remove(context.key());
                    }
                }
                SaveOutcome::Oversized => oversized += 1,
                SaveOutcome::Error => failed += 1,
            }
        }

        self.save_passes.fetch_add(1, Ordering::Relaxed);

        if saved > 0 {
            info!(saved, cache_dir = ?cache_dir, "Saved contexts");
        }
        if removed > 0 {
            info!(removed, "Removed contexts with empty values");
        }
        if oversized > 0 {
            warn!(oversized, "Skipped oversized contexts");
        }
        if failed > 0 {
            error!(failed, "Failed to save contexts");
        }

        failed == 0
    }

    fn cleanup_old_data(&self) -> CleanupReport {
        let candidates: Vec<CleanupCandidate> = self
            .contexts_snapshot()
            .iter()
            .map(|context| CleanupCandidate {
                key: context.key().to_string(),
                last_access_time: context.last_access_time(),
            })
            .collect();

        cleanup::cleanup_old_data(
            &self.config.cache_dir,
            &candidates,
            &CleanupThresholds::from(&self.config),
            Utc::now(),
            |key| self.evict_context(key).unwrap_or(false),
        )
    }
}

fn run_worker(cache: Weak<CacheShared>, mut mailbox: mpsc::Receiver<()>) {
    debug!("Save worker started");
    while mailbox.blocking_recv().is_some() {
        let Some(shared) = cache.upgrade() else {
            break;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.run_queued_saves()));
        if outcome.is_err() {
            error!("Save pass panicked");
            let mut state = shared.lock_state();
            state.save.in_progress = false;
            state.save.needs_another = false;
            shared.idle.notify_all();
        }
    }
    debug!("Save worker stopped");
}
