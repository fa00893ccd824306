//! engine/builder - SafeBoxBuilder: конфиг из ENV + явные переопределения.
//!
//! Пример:
//!   let reg = SafeBoxRegistry::new();
//!   let sb = SafeBoxBuilder::new(dir, "prefs")
//!       .registry(reg.clone())
//!       .aes_key(key)
//!       .page_capacity(64 * 1024)
//!       .open()?;

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::blob::RecoveryBlobStore;
use crate::config::SafeBoxConfig;
use crate::crypto::{AesGcmCipher, SafeBoxCipher};
use crate::registry::SafeBoxRegistry;
use crate::state::{SafeBoxState, StateListener};

use super::{EngineParts, SafeBoxEngine};

pub struct SafeBoxBuilder {
    dir: PathBuf,
    name: String,
    cfg: SafeBoxConfig,
    registry: Option<Arc<SafeBoxRegistry>>,
    recovery: Option<Arc<RecoveryBlobStore>>,
    key_cipher: Option<Arc<dyn SafeBoxCipher>>,
    value_cipher: Option<Arc<dyn SafeBoxCipher>>,
    listener: Option<StateListener>,
}

impl SafeBoxBuilder {
    /// Начинаем с ENV (SB_*), затем переопределения.
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            name: name.to_string(),
            cfg: SafeBoxConfig::from_env(),
            registry: None,
            recovery: None,
            key_cipher: None,
            value_cipher: None,
            listener: None,
        }
    }

    pub fn config(mut self, cfg: SafeBoxConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn page_capacity(mut self, bytes: usize) -> Self {
        self.cfg.page_capacity = bytes;
        self
    }

    pub fn max_pages(mut self, pages: usize) -> Self {
        self.cfg.max_pages = pages;
        self
    }

    pub fn flush_on_write(mut self, on: bool) -> Self {
        self.cfg.flush_on_write = on;
        self
    }

    pub fn registry(mut self, reg: Arc<SafeBoxRegistry>) -> Self {
        self.registry = Some(reg);
        self
    }

    /// Явный журнал восстановления (по умолчанию - общий журнал каталога из реестра).
    pub fn recovery(mut self, journal: Arc<RecoveryBlobStore>) -> Self {
        self.recovery = Some(journal);
        self
    }

    /// Шифр ключей. Должен быть детерминированным: поиск идёт по шифротексту.
    pub fn key_cipher(mut self, c: Arc<dyn SafeBoxCipher>) -> Self {
        self.key_cipher = Some(c);
        self
    }

    pub fn value_cipher(mut self, c: Arc<dyn SafeBoxCipher>) -> Self {
        self.value_cipher = Some(c);
        self
    }

    /// AES-256-GCM: детерминированный для ключей, рандомизированный для значений.
    pub fn aes_key(self, key: [u8; 32]) -> Self {
        self.key_cipher(Arc::new(AesGcmCipher::deterministic(key)))
            .value_cipher(Arc::new(AesGcmCipher::randomized(key)))
    }

    pub fn state_listener<F>(mut self, f: F) -> Self
    where
        F: Fn(SafeBoxState) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(f));
        self
    }

    pub fn open(self) -> Result<SafeBoxEngine> {
        let key_cipher = self
            .key_cipher
            .ok_or_else(|| anyhow!("key cipher is not set (use aes_key or key_cipher)"))?;
        let value_cipher = self
            .value_cipher
            .ok_or_else(|| anyhow!("value cipher is not set (use aes_key or value_cipher)"))?;
        let registry = self.registry.unwrap_or_else(SafeBoxRegistry::new);
        let recovery = match self.recovery {
            Some(j) => j,
            None => registry.recovery_journal(&self.dir, &self.cfg)?,
        };
        SafeBoxEngine::open(
            &self.dir,
            &self.name,
            EngineParts {
                key_cipher,
                value_cipher,
                registry,
                recovery,
                config: self.cfg,
                state_listener: self.listener,
            },
        )
    }
}
