//! blob/recovery - RecoveryBlobStore: общий append-only журнал для всех логических файлов.
//!
//! Назначение: принять запись, которую основной стор принять не смог
//! (потолок страниц, ошибка mmap/роста). Один регион фиксированной ёмкости, без роста.
//! Записи разных файлов перемежаются и различаются по полю file_name.
//!
//! Жизненный цикл записи: write() -> (движок ретраит слив в основной стор) -> delete_file().
//! Битые хвосты при сканировании обнуляются, как и в основном сторе.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::SafeBoxConfig;
use crate::consts::{RECOVERY_FILE, RECOVERY_HEADER_SIZE};
use crate::error::SafeBoxError;
use crate::metrics::{record_journal_write, record_load_repair};

use super::codec::{compact, journal_record_size, scan_journal, write_journal_record, ScanEnd};
use super::EntryMeta;

struct RecoveryInner {
    // None после close()
    region: Option<(File, MmapMut)>,
    tail: usize,
    // file_name -> (key -> meta); page всегда 0
    files: HashMap<String, HashMap<Vec<u8>, EntryMeta>>,
    dirty: bool,
}

impl RecoveryInner {
    fn mmap_mut(&mut self) -> Result<&mut MmapMut> {
        self.region
            .as_mut()
            .map(|(_, m)| m)
            .ok_or_else(|| SafeBoxError::Closed.into())
    }

    fn mmap(&self) -> Result<&MmapMut> {
        self.region
            .as_ref()
            .map(|(_, m)| m)
            .ok_or_else(|| SafeBoxError::Closed.into())
    }
}

/// Сводка по журналу (CLI / тесты).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalStats {
    pub capacity: usize,
    pub tail: usize,
    /// file_name -> число записей
    pub files: BTreeMap<String, usize>,
}

pub struct RecoveryBlobStore {
    path: PathBuf,
    capacity: usize,
    inner: Mutex<RecoveryInner>,
}

impl RecoveryBlobStore {
    /// Открыть `<dir>/safebox_recovery.bin`.
    pub fn open(dir: &Path, cfg: &SafeBoxConfig) -> Result<Self> {
        Self::open_path(&dir.join(RECOVERY_FILE), cfg)
    }

    pub fn open_path(path: &Path, cfg: &SafeBoxConfig) -> Result<Self> {
        let capacity = cfg.recovery_capacity;
        if capacity == 0 {
            return Err(anyhow!("recovery capacity must be > 0"));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("open recovery journal {}", path.display()))?;
        if (file.metadata()?.len() as usize) < capacity {
            file.set_len(capacity as u64)
                .with_context(|| format!("set_len {} -> {}", path.display(), capacity))?;
        }
        // SAFETY: журнал мапится одним экземпляром на процесс (владелец - реестр/движки через Arc).
        let mmap = unsafe {
            MmapOptions::new()
                .len(capacity)
                .map_mut(&file)
                .with_context(|| format!("mmap recovery journal {}", path.display()))?
        };

        let store = Self {
            path: path.to_path_buf(),
            capacity,
            inner: Mutex::new(RecoveryInner {
                region: Some((file, mmap)),
                tail: 0,
                files: HashMap::new(),
                dirty: false,
            }),
        };
        {
            let mut g = store.lock();
            store.rescan(&mut g)?;
        }
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, RecoveryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Полный проход по региону: перестроить индекс всех файлов, вернуть записи.
    fn rescan(&self, inner: &mut RecoveryInner) -> Result<Vec<super::codec::JournalRecord>> {
        let scan = scan_journal(&inner.mmap()?[..]);
        if let ScanEnd::Repaired { from } = scan.end {
            warn!(
                "recovery journal {}: corrupted record at offset {}, zero-filling tail",
                self.path.display(),
                from
            );
            inner.mmap_mut()?[from..].fill(0);
            inner.dirty = true;
            record_load_repair();
        }
        inner.tail = scan.end.tail();
        inner.files.clear();
        for rec in scan.records.iter() {
            let meta = EntryMeta { page: 0, offset: rec.offset, size: rec.size };
            inner
                .files
                .entry(rec.file_name.clone())
                .or_default()
                .insert(rec.key.clone(), meta);
        }
        Ok(scan.records)
    }

    /// Просканировать журнал и вернуть записи файла `file_name` (key -> value).
    pub fn load_persisted_entries(&self, file_name: &str) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        let mut g = self.lock();
        let records = self.rescan(&mut g)?;
        let out: HashMap<Vec<u8>, Vec<u8>> = records
            .into_iter()
            .filter(|r| r.file_name == file_name)
            .map(|r| (r.key, r.value))
            .collect();
        debug!("recovery journal: {} entries for '{}'", out.len(), file_name);
        Ok(out)
    }

    /// Записать (или заменить) запись (file, key).
    pub fn write(&self, file_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        if file_name.is_empty() || file_name.len() > u16::MAX as usize {
            return Err(anyhow!("invalid journal file name length {}", file_name.len()));
        }
        if key.is_empty() {
            return Err(anyhow!("empty key is not storable"));
        }
        let size = journal_record_size(file_name.len(), key.len(), value.len());
        if size > self.capacity || key.len() > u16::MAX as usize {
            return Err(SafeBoxError::EntryTooLarge { size, capacity: self.capacity }.into());
        }

        let mut g = self.lock();
        let inner = &mut *g;
        inner.mmap()?;
        let old = inner.files.get(file_name).and_then(|m| m.get(key)).copied();
        let available = self.capacity - inner.tail + old.map(|m| m.size).unwrap_or(0);
        if size > available {
            return Err(SafeBoxError::JournalFull { needed: size, available }.into());
        }
        if let Some(m) = old {
            remove_region(inner, m)?;
        }

        let off = inner.tail;
        write_journal_record(&mut inner.mmap_mut()?[..], off, file_name, key, value);
        inner.tail += size;
        inner.dirty = true;
        inner
            .files
            .entry(file_name.to_string())
            .or_default()
            .insert(key.to_vec(), EntryMeta { page: 0, offset: off, size });
        record_journal_write(size);
        Ok(())
    }

    /// Удалить все записи файла (после успешного слива в основной стор).
    pub fn delete_file(&self, file_name: &str) -> Result<usize> {
        let mut g = self.lock();
        let inner = &mut *g;
        let Some(metas) = inner.files.remove(file_name) else {
            return Ok(0);
        };
        let mut metas: Vec<EntryMeta> = metas.into_values().collect();
        // с конца: более ранние смещения не сдвигаются
        metas.sort_by(|a, b| b.offset.cmp(&a.offset));
        let n = metas.len();
        for m in metas {
            remove_region(inner, m)?;
        }
        debug!("recovery journal: dropped {} record(s) of '{}'", n, file_name);
        Ok(n)
    }

    /// Точечное удаление ключей файла.
    pub fn delete<K: AsRef<[u8]>>(&self, file_name: &str, keys: &[K]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut g = self.lock();
        let inner = &mut *g;
        let mut removed = 0usize;
        for k in keys {
            let meta = inner
                .files
                .get_mut(file_name)
                .and_then(|m| m.remove(k.as_ref()));
            if let Some(m) = meta {
                remove_region(inner, m)?;
                removed += 1;
            }
        }
        if inner.files.get(file_name).is_some_and(|m| m.is_empty()) {
            inner.files.remove(file_name);
        }
        Ok(removed)
    }

    /// Текущие записи файла без пересканирования (по индексу).
    pub fn entries(&self, file_name: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let g = self.lock();
        let Some(metas) = g.files.get(file_name) else {
            return Ok(Vec::new());
        };
        let mut metas: Vec<(Vec<u8>, EntryMeta)> =
            metas.iter().map(|(k, m)| (k.clone(), *m)).collect();
        metas.sort_by_key(|(_, m)| m.offset);
        let buf = &g.mmap()?[..];
        let mut out = Vec::with_capacity(metas.len());
        for (key, m) in metas {
            let value_start = m.offset + RECOVERY_HEADER_SIZE + file_name.len() + key.len();
            out.push((key, buf[value_start..m.offset + m.size].to_vec()));
        }
        Ok(out)
    }

    pub fn contains(&self, file_name: &str, key: &[u8]) -> bool {
        self.lock()
            .files
            .get(file_name)
            .is_some_and(|m| m.contains_key(key))
    }

    /// Есть ли в журнале хоть одна запись файла.
    pub fn has_entries(&self, file_name: &str) -> bool {
        self.lock()
            .files
            .get(file_name)
            .is_some_and(|m| !m.is_empty())
    }

    pub fn stats(&self) -> JournalStats {
        let g = self.lock();
        JournalStats {
            capacity: self.capacity,
            tail: g.tail,
            files: g.files.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
        }
    }

    pub fn flush(&self) -> Result<()> {
        let mut g = self.lock();
        if !g.dirty {
            return Ok(());
        }
        g.mmap()?.flush().context("msync recovery journal")?;
        g.dirty = false;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut g = self.lock();
        let res = match g.region.as_ref() {
            Some((_, m)) if g.dirty => m.flush().context("msync recovery journal"),
            _ => Ok(()),
        };
        g.region = None;
        g.files.clear();
        g.tail = 0;
        res
    }
}

/// Вырезать запись и сдвинуть смещения всех записей (любых файлов) после неё.
fn remove_region(inner: &mut RecoveryInner, m: EntryMeta) -> Result<()> {
    let tail = inner.tail;
    inner.tail = compact(&mut inner.mmap_mut()?[..], m.offset, m.size, tail);
    inner.dirty = true;
    for metas in inner.files.values_mut() {
        for other in metas.values_mut() {
            if other.offset > m.offset {
                other.offset -= m.size;
            }
        }
    }
    Ok(())
}

impl Drop for RecoveryBlobStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("recovery journal {}: close on drop failed: {:#}", self.path.display(), e);
        }
    }
}
