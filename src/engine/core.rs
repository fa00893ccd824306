//! engine/core - общее состояние движка и путь чтения.
//!
//! EngineCore разделяется (Arc) между фасадом SafeBoxEngine, фоновым
//! исполнителем и таймерами слива. Методы записи, слива и зачистки разнесены
//! по соседним модулям (write.rs, drain.rs, sweep.rs).
//!
//! Карта entries: зашифрованный ключ -> зашифрованное значение. Читается без
//! замков; многошаговые изменения идут под узким update_lock.

use dashmap::DashMap;
use log::{error, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::blob::{RecoveryBlobStore, SafeBoxBlobStore};
use crate::config::SafeBoxConfig;
use crate::crypto::{CipherError, SafeBoxCipher};
use crate::state::StateManager;
use crate::subs::ChangeRegistry;

use super::barrier::Latch;
use super::worker::Worker;

pub(crate) struct EngineCore {
    pub(crate) file_name: String,
    pub(crate) cfg: SafeBoxConfig,
    pub(crate) store: SafeBoxBlobStore,
    pub(crate) recovery: Arc<RecoveryBlobStore>,
    pub(crate) key_cipher: Arc<dyn SafeBoxCipher>,
    pub(crate) value_cipher: Arc<dyn SafeBoxCipher>,

    pub(crate) entries: DashMap<Vec<u8>, Vec<u8>>,

    /// Узкая секция: обновление карты + подсчёт изменений + смена барьера.
    pub(crate) update_lock: Mutex<()>,
    /// Сериализация физических записей в store/journal.
    pub(crate) write_lock: Mutex<()>,
    /// Барьер последней поставленной записи (одна ячейка).
    pub(crate) last_barrier: Mutex<Arc<Latch>>,
    pub(crate) loaded: Latch,

    pub(crate) state: StateManager,
    pub(crate) changes: Arc<ChangeRegistry>,
    pub(crate) worker: Worker,

    pub(crate) drain_scheduled: AtomicBool,
    pub(crate) drain_attempt: AtomicU32,
    pub(crate) sweep_running: AtomicBool,
    pub(crate) closed: AtomicBool,
}

pub(crate) fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl EngineCore {
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Первая задача исполнителя: store + записи журнала этого файла.
    pub(crate) fn run_initial_load(self: &Arc<Self>) {
        let res = {
            let _w = relock(&self.write_lock);
            self.load_all()
        };
        match res {
            Ok(has_journal) => {
                if has_journal {
                    warn!(
                        "{}: recovery journal holds entries, scheduling drain",
                        self.file_name
                    );
                    self.schedule_drain();
                }
            }
            Err(e) => error!("{}: initial load failed: {:#}", self.file_name, e),
        }
        self.loaded.signal();
        self.state.load_finished();
    }

    fn load_all(&self) -> anyhow::Result<bool> {
        let mut map = self.store.load_persisted_entries()?;
        let journal = self.recovery.load_persisted_entries(&self.file_name)?;
        let has_journal = !journal.is_empty();
        // Записи журнала новее основного файла.
        map.extend(journal);
        for (k, v) in map {
            self.entries.insert(k, v);
        }
        Ok(has_journal)
    }

    #[inline]
    pub(crate) fn await_loaded(&self) {
        self.loaded.wait();
    }

    pub(crate) fn encrypt_key(&self, key: &str) -> Result<Vec<u8>, CipherError> {
        self.key_cipher.encrypt(key.as_bytes())
    }

    /// Ошибка аутентификации запускает зачистку; прочие только логируются.
    pub(crate) fn on_decrypt_error(self: &Arc<Self>, what: &str, e: &CipherError) {
        if e.is_authentication() {
            warn!("{}: {} failed authentication, entry treated as absent", self.file_name, what);
            self.trigger_sweep();
        } else {
            error!("{}: {} failed: {}", self.file_name, what, e);
        }
    }

    // ---------------- read path ----------------

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.await_loaded();
        match self.encrypt_key(key) {
            Ok(ek) => self.entries.contains_key(&ek),
            Err(e) => {
                error!("{}: key encryption failed: {}", self.file_name, e);
                false
            }
        }
    }

    pub(crate) fn get_value(self: &Arc<Self>, key: &str) -> Option<Vec<u8>> {
        self.await_loaded();
        let ek = match self.encrypt_key(key) {
            Ok(ek) => ek,
            Err(e) => {
                error!("{}: key encryption failed: {}", self.file_name, e);
                return None;
            }
        };
        // Копия шифротекста: не держим шард DashMap во время расшифровки.
        let ev = self.entries.get(&ek).map(|r| r.value().clone())?;
        match self.value_cipher.decrypt(&ev) {
            Ok(v) => Some(v),
            Err(e) => {
                self.on_decrypt_error("value decrypt", &e);
                None
            }
        }
    }

    pub(crate) fn get_entries(self: &Arc<Self>) -> HashMap<String, Vec<u8>> {
        self.await_loaded();
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        let mut out = HashMap::with_capacity(snapshot.len());
        let mut dead_seen = false;
        for (ek, ev) in snapshot {
            let key = match self.key_cipher.decrypt(&ek) {
                Ok(k) => k,
                Err(e) => {
                    dead_seen |= e.is_authentication();
                    continue;
                }
            };
            let Ok(key) = String::from_utf8(key) else {
                continue;
            };
            match self.value_cipher.decrypt(&ev) {
                Ok(v) => {
                    out.insert(key, v);
                }
                Err(e) => dead_seen |= e.is_authentication(),
            }
        }
        if dead_seen {
            warn!("{}: undecryptable entries skipped", self.file_name);
            self.trigger_sweep();
        }
        out
    }
}
