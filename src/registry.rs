//! Process-wide registry of SafeBox instances (explicit service object).
//!
//! Scope:
//! - Last known lifecycle state per file name, queryable at any time
//!   (late subscribers can ask instead of waiting for the next transition).
//! - Multiple state listeners per file; drop of StateSubscription unsubscribes.
//! - Single active engine per file name: `claim()` returns an RAII ActiveClaim.
//! - One shared recovery journal per directory (`recovery_journal()`), so every
//!   engine of that directory appends into the same mapping and index.
//!
//! Notes:
//! - The registry is constructed by the application and injected into engines
//!   (`SafeBoxBuilder::registry`); nothing here is a hidden global.
//! - Callbacks run synchronously on the thread that caused the transition, outside
//!   the registry lock. Keep them fast; do not call write APIs from them.

use anyhow::{Context, Result};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::blob::RecoveryBlobStore;
use crate::config::SafeBoxConfig;
use crate::error::SafeBoxError;
use crate::state::SafeBoxState;

type Callback = Arc<dyn Fn(&str, SafeBoxState) + Send + Sync + 'static>;

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    states: HashMap<String, SafeBoxState>,
    listeners: HashMap<u64, (String, Callback)>, // id -> (file name, cb)
    active: HashSet<String>,
    // Один экземпляр журнала на каталог, пока его держит хоть один движок.
    journals: HashMap<PathBuf, Weak<RecoveryBlobStore>>,
}

pub struct SafeBoxRegistry {
    inner: Mutex<RegistryInner>,
}

impl SafeBoxRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Last published state of `file_name` (None if never opened in this registry).
    pub fn current_state(&self, file_name: &str) -> Option<SafeBoxState> {
        self.lock().states.get(file_name).copied()
    }

    /// Subscribe to state transitions of `file_name`.
    /// Returns a handle; dropping it unsubscribes.
    pub fn subscribe<F>(self: &Arc<Self>, file_name: &str, f: F) -> StateSubscription
    where
        F: Fn(&str, SafeBoxState) + Send + Sync + 'static,
    {
        let mut g = self.lock();
        let id = g.next_id;
        g.next_id = g.next_id.wrapping_add(1);
        g.listeners.insert(id, (file_name.to_string(), Arc::new(f)));
        drop(g);
        StateSubscription {
            id,
            reg: Arc::downgrade(self),
        }
    }

    /// Record the new state and notify listeners of that file.
    pub(crate) fn publish(&self, file_name: &str, state: SafeBoxState) {
        let callbacks: Vec<Callback> = {
            let mut g = self.lock();
            g.states.insert(file_name.to_string(), state);
            g.listeners
                .values()
                .filter(|(name, _)| name == file_name)
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        // Execute outside the lock
        for cb in callbacks {
            cb(file_name, state);
        }
    }

    /// Mark `file_name` as having an active engine. Fails if one already exists.
    pub fn claim(self: &Arc<Self>, file_name: &str) -> Result<ActiveClaim> {
        let mut g = self.lock();
        if !g.active.insert(file_name.to_string()) {
            return Err(SafeBoxError::AlreadyOpen {
                name: file_name.to_string(),
            }
            .into());
        }
        Ok(ActiveClaim {
            name: file_name.to_string(),
            reg: Arc::downgrade(self),
        })
    }

    pub fn is_active(&self, file_name: &str) -> bool {
        self.lock().active.contains(file_name)
    }

    /// Shared recovery journal of `dir` (opened on first request).
    pub fn recovery_journal(&self, dir: &Path, cfg: &SafeBoxConfig) -> Result<Arc<RecoveryBlobStore>> {
        std::fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
        let key = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let mut g = self.lock();
        if let Some(j) = g.journals.get(&key).and_then(Weak::upgrade) {
            return Ok(j);
        }
        let j = Arc::new(RecoveryBlobStore::open(dir, cfg)?);
        debug!("registry: opened recovery journal {}", j.path().display());
        g.journals.insert(key, Arc::downgrade(&j));
        Ok(j)
    }

    /// Teardown: forget recorded states and listeners, drop journals nobody holds.
    /// Active claims stay valid; a journal still held by an open engine stays
    /// cached, so engines opened later in that directory share it.
    pub fn clear(&self) {
        let mut g = self.lock();
        g.states.clear();
        g.listeners.clear();
        g.journals.retain(|_, j| j.strong_count() > 0);
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().listeners.remove(&id);
    }

    fn release(&self, file_name: &str) {
        self.lock().active.remove(file_name);
    }
}

/// RAII handle: unsubscribes on drop.
pub struct StateSubscription {
    id: u64,
    reg: Weak<SafeBoxRegistry>,
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(reg) = self.reg.upgrade() {
            reg.unsubscribe(self.id);
        }
    }
}

/// RAII claim of a file name; released on drop (engine close).
pub struct ActiveClaim {
    name: String,
    reg: Weak<SafeBoxRegistry>,
}

impl ActiveClaim {
    pub fn file_name(&self) -> &str {
        &self.name
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        if let Some(reg) = self.reg.upgrade() {
            reg.release(&self.name);
        }
    }
}
