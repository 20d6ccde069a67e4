//! A single cached value with access-time and dirty tracking

use crate::cache::{lock, CacheShared};
use crate::types::{ContextValue, ValueKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};

/// Shared handle to a context owned by a [`ContextCache`](crate::ContextCache)
pub type ContextHandle = Arc<Context>;

/// The persisted part of a context. The key and the owning cache are
/// reattached by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ContextSnapshot {
    #[serde(default)]
    pub last_access_time: DateTime<Utc>,
    #[serde(default)]
    pub value: ContextValue,
}

struct ContextState {
    value: ContextValue,
    last_access_time: DateTime<Utc>,
    dirty: bool,
    /// Bumped on every mutation; a save only cleans the version it wrote
    version: u64,
}

pub struct Context {
    key: String,
    state: Mutex<ContextState>,
    owner: Weak<CacheShared>,
}

impl Context {
    /// A new, dirty context
    pub(crate) fn new(key: String, value: ContextValue, owner: Weak<CacheShared>) -> Self {
        Self {
            key,
            state: Mutex::new(ContextState {
                value,
                last_access_time: Utc::now(),
                dirty: true,
                version: 0,
            }),
            owner,
        }
    }

    /// A clean context rebuilt from disk
    pub(crate) fn from_snapshot(
        key: String,
        snapshot: ContextSnapshot,
        owner: Weak<CacheShared>,
    ) -> Self {
        Self {
            key,
            state: Mutex::new(ContextState {
                value: snapshot.value,
                last_access_time: snapshot.last_access_time,
                dirty: false,
                version: 0,
            }),
            owner,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value; counts as an access
    pub fn get_value(&self) -> ContextValue {
        let mut state = lock(&self.state);
        state.last_access_time = Utc::now();
        state.value.clone()
    }

    /// Replace the value and mark the context dirty.
    ///
    /// `save` overrides the owning cache's `auto_save` setting. The save itself
    /// runs on the cache's background worker; this call never waits for it.
    pub fn set_value(&self, value: impl Into<ContextValue>, save: Option<bool>) {
        {
            let mut state = lock(&self.state);
            state.value = value.into();
            state.dirty = true;
            state.version += 1;
            state.last_access_time = Utc::now();
        }

        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        if save.unwrap_or(owner.config.auto_save) {
            owner.request_save();
        }
    }

    pub fn update_access_time(&self) {
        lock(&self.state).last_access_time = Utc::now();
    }

    pub fn last_access_time(&self) -> DateTime<Utc> {
        lock(&self.state).last_access_time
    }

    /// Kind of the current value, without counting as an access
    pub fn value_kind(&self) -> ValueKind {
        lock(&self.state).value.kind()
    }

    pub(crate) fn matches<F>(&self, predicate: F) -> bool
    where
        F: FnOnce(&ContextValue) -> bool,
    {
        // Cloned so the predicate may call back into this context
        let value = lock(&self.state).value.clone();
        predicate(&value)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        lock(&self.state).dirty
    }

    /// Copy of the persisted fields plus the version they belong to
    pub(crate) fn snapshot(&self) -> (ContextSnapshot, u64) {
        let state = lock(&self.state);
        let snapshot = ContextSnapshot {
            last_access_time: state.last_access_time,
            value: state.value.clone(),
        };
        (snapshot, state.version)
    }

    /// Clear the dirty flag unless the value changed after `version` was taken
    pub(crate) fn mark_clean(&self, version: u64) -> bool {
        let mut state = lock(&self.state);
        if state.version == version {
            state.dirty = false;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Context")
            .field("key", &self.key)
            .field("kind", &state.value.kind())
            .field("last_access_time", &state.last_access_time)
            .field("dirty", &state.dirty)
            .finish()
    }
}
