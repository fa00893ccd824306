//! engine - SafeBoxEngine: единая точка доступа к одному логическому файлу.
//!
//! Что делает:
//! - держит авторитетную карту записей в памяти (зашифрованный ключ -> значение);
//! - чтения ждут только начальную загрузку и дальше не блокируются записями;
//! - записи (commit - синхронно, apply - асинхронно) сразу меняют память и
//!   ложатся на диск строго в порядке вызовов (цепочка барьеров);
//! - при отказе основного стора запись уходит в общий журнал восстановления
//!   и позже сливается обратно с экспоненциальной задержкой;
//! - записи, не прошедшие аутентификацию, зачищаются в фоне;
//! - состояние STARTING/IDLE/WRITING публикуется в реестр и слушателю.
//!
//! Модули:
//! - core.rs    - EngineCore (общее состояние, загрузка, путь чтения)
//! - write.rs   - stage/commit/apply/persist
//! - drain.rs   - слив журнала восстановления
//! - sweep.rs   - зачистка мёртвых записей
//! - batch.rs   - SafeBoxBatch
//! - barrier.rs - Latch
//! - worker.rs  - фоновый исполнитель
//! - builder.rs - SafeBoxBuilder

use anyhow::Result;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex};

use crate::blob::{JournalStats, RecoveryBlobStore, SafeBoxBlobStore, StoreStats};
use crate::config::SafeBoxConfig;
use crate::crypto::SafeBoxCipher;
use crate::registry::{ActiveClaim, SafeBoxRegistry};
use crate::state::{SafeBoxState, StateListener, StateManager};
use crate::subs::{ChangeEvent, ChangeRegistry, ChangeSubscription};

mod barrier;
pub mod batch;
pub mod builder;
mod core;
mod drain;
mod sweep;
mod worker;
mod write;

pub use batch::{Action, SafeBoxBatch};
pub use builder::SafeBoxBuilder;

use self::barrier::Latch;
use self::core::{relock, EngineCore};
use self::worker::Worker;

/// Всё, что нужно движку снаружи. Обычно собирается SafeBoxBuilder'ом.
pub struct EngineParts {
    pub key_cipher: Arc<dyn SafeBoxCipher>,
    pub value_cipher: Arc<dyn SafeBoxCipher>,
    pub registry: Arc<SafeBoxRegistry>,
    pub recovery: Arc<RecoveryBlobStore>,
    pub config: SafeBoxConfig,
    pub state_listener: Option<StateListener>,
}

pub struct SafeBoxEngine {
    core: Arc<EngineCore>,
    claim: Mutex<Option<ActiveClaim>>,
}

impl SafeBoxEngine {
    /// Открыть `<dir>/<name>.bin`. Загрузка идёт в фоне (STARTING);
    /// первые чтения/записи дождутся её.
    pub fn open(dir: &Path, name: &str, parts: EngineParts) -> Result<Self> {
        let EngineParts {
            key_cipher,
            value_cipher,
            registry,
            recovery,
            config,
            state_listener,
        } = parts;

        let claim = registry.claim(name)?;
        let store = SafeBoxBlobStore::open(dir, name, &config)?;
        let worker = Worker::spawn(name)?;
        let state = StateManager::new(name, registry.clone(), state_listener);

        let core = Arc::new(EngineCore {
            file_name: name.to_string(),
            cfg: config,
            store,
            recovery,
            key_cipher,
            value_cipher,
            entries: DashMap::new(),
            update_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            last_barrier: Mutex::new(Arc::new(Latch::signaled())),
            loaded: Latch::new(),
            state,
            changes: ChangeRegistry::new(),
            worker,
            drain_scheduled: AtomicBool::new(false),
            drain_attempt: AtomicU32::new(0),
            sweep_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let c = core.clone();
        if let Err(job) = core.worker.submit(Box::new(move || c.run_initial_load())) {
            job();
        }
        debug!("safebox '{}' opened in {}", name, dir.display());

        Ok(Self {
            core,
            claim: Mutex::new(Some(claim)),
        })
    }

    #[inline]
    pub fn file_name(&self) -> &str {
        &self.core.file_name
    }

    pub fn state(&self) -> SafeBoxState {
        self.core.state.state()
    }

    pub fn config(&self) -> &SafeBoxConfig {
        &self.core.cfg
    }

    // ---------------- reads ----------------

    pub fn contains(&self, key: &str) -> bool {
        self.core.contains(key)
    }

    /// None: ключа нет или значение не расшифровалось (запускает зачистку).
    pub fn get_value(&self, key: &str) -> Option<Vec<u8>> {
        self.core.get_value(key)
    }

    /// Все расшифровываемые записи.
    pub fn get_entries(&self) -> HashMap<String, Vec<u8>> {
        self.core.get_entries()
    }

    pub fn len(&self) -> usize {
        self.core.await_loaded();
        self.core.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---------------- writes ----------------

    pub fn edit(&self) -> SafeBoxBatch {
        SafeBoxBatch::new()
    }

    /// Синхронно: true, если батч лёг на диск (или в журнал восстановления).
    pub fn commit_batch(&self, batch: SafeBoxBatch) -> bool {
        self.core.commit(&batch)
    }

    /// Асинхронно: память обновлена сразу, диск позже; ошибки только в лог.
    pub fn apply_batch(&self, batch: SafeBoxBatch) {
        self.core.apply(&batch)
    }

    /// Подписка на изменения ключей; drop отписывает.
    pub fn subscribe_changes<F>(&self, f: F) -> ChangeSubscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.core.changes.subscribe(f)
    }

    // ---------------- lifecycle ----------------

    /// Дождаться загрузки и всех поставленных записей.
    pub fn await_idle(&self) {
        self.core.state.wait_idle();
    }

    pub fn pending_writes(&self) -> usize {
        self.core.state.pending_writes()
    }

    pub fn store_stats(&self) -> StoreStats {
        self.core.store.stats()
    }

    pub fn journal_stats(&self) -> JournalStats {
        self.core.recovery.stats()
    }

    /// Проверка внутренней согласованности основного стора.
    pub fn verify_layout(&self) -> Result<()> {
        self.core.store.verify_layout()
    }

    /// Дождаться записей, остановить исполнитель, закрыть стор, снять claim.
    /// Журнал восстановления общий и остаётся открытым.
    pub fn close(&self) -> Result<()> {
        if !self.core.mark_closed() {
            return Ok(());
        }
        self.core.state.wait_idle();
        let res = self
            .core
            .worker
            .shutdown()
            .and_then(|_| self.core.store.flush())
            .and_then(|_| self.core.recovery.flush());
        let closed = self.core.store.close();
        drop(relock(&self.claim).take());
        info!("safebox '{}' closed", self.core.file_name);
        res.and(closed)
    }
}

impl Drop for SafeBoxEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("safebox '{}' close on drop: {:#}", self.core.file_name, e);
        }
    }
}
