//! blob/store - SafeBoxBlobStore: постраничное mmap-хранилище одного логического файла.
//!
//! Правила:
//! - Запись всегда дописывается в хвост страницы; запись не пересекает границу страницы.
//! - Перезапись/удаление компактирует старую страницу на месте (сдвиг влево + обнуление хвоста)
//!   и правит смещения всех остальных записей этой страницы.
//! - Новая страница выделяется, только если ни одна из существующих не вмещает запись;
//!   потолок - `max_pages`.
//! - Загрузка чинит битые хвосты (обнуляет их) и не возвращает ошибку.
//! - write/delete меняют только mmap-память и метаданные; на диск уходит flush().
//!
//! Все мутации - под одним мьютексом (write-section lock) на стор.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::SafeBoxConfig;
use crate::consts::STORE_FILE_EXT;
use crate::error::SafeBoxError;
use crate::metrics::{
    record_compaction, record_entries_deleted, record_entry_written, record_flush,
    record_load_repair, record_page_allocated,
};

use super::codec::{compact, page_record_size, scan_page, write_page_record, ScanEnd};
use super::page::Page;
use super::EntryMeta;

struct StoreInner {
    // None после close()
    file: Option<File>,
    pages: Vec<Page>,
    entry_meta: HashMap<Vec<u8>, EntryMeta>,
    // Полный flush при следующем вызове (после delete_all / уменьшения числа страниц).
    force_flush: bool,
}

/// Сводка по стору (CLI status / тесты).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub file_name: String,
    pub capacity: usize,
    pub pages: usize,
    pub tails: Vec<usize>,
    pub entries: usize,
}

pub struct SafeBoxBlobStore {
    path: PathBuf,
    file_name: String,
    capacity: usize,
    max_pages: usize,
    inner: Mutex<StoreInner>,
}

impl SafeBoxBlobStore {
    /// Открыть (создать при отсутствии) `<dir>/<name>.bin` и замапить все страницы.
    /// Записи ещё не разбираются - см. load_persisted_entries().
    pub fn open(dir: &Path, name: &str, cfg: &SafeBoxConfig) -> Result<Self> {
        let path = dir.join(format!("{}.{}", name, STORE_FILE_EXT));
        Self::open_path(&path, cfg)
    }

    pub fn open_path(path: &Path, cfg: &SafeBoxConfig) -> Result<Self> {
        let capacity = cfg.page_capacity;
        if capacity == 0 {
            return Err(anyhow!("page capacity must be > 0"));
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
            .with_context(|| format!("open blob store {}", path.display()))?;

        // Длина файла кратна capacity; минимум одна страница.
        let len = file.metadata()?.len() as usize;
        let page_count = len.div_ceil(capacity).max(1);
        let want = (page_count * capacity) as u64;
        if len as u64 != want {
            file.set_len(want)
                .with_context(|| format!("set_len {} -> {}", path.display(), want))?;
        }

        let mut pages = Vec::with_capacity(page_count);
        for i in 0..page_count {
            pages.push(Page::map(&file, i, capacity)?);
        }

        let file_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!(
            "blob store {} opened: {} page(s) x {} B",
            path.display(),
            page_count,
            capacity
        );

        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            capacity,
            max_pages: cfg.max_pages.max(1),
            inner: Mutex::new(StoreInner {
                file: Some(file),
                pages,
                entry_meta: HashMap::new(),
                force_flush: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, StoreInner>> {
        let g = self.lock();
        if g.file.is_none() {
            return Err(SafeBoxError::Closed.into());
        }
        Ok(g)
    }

    /// Имя логического файла (имя файла без расширения).
    #[inline]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Просканировать все страницы, восстановить метаданные и вернуть key -> value.
    ///
    /// Повторный вызов на нетронутом сторе возвращает ту же карту.
    pub fn load_persisted_entries(&self) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        let mut g = self.lock_open()?;
        let inner = &mut *g;
        inner.entry_meta.clear();

        let mut out: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        let mut stale: Vec<(Vec<u8>, EntryMeta)> = Vec::new();

        for (idx, page) in inner.pages.iter_mut().enumerate() {
            page.keys.clear();
            let scan = scan_page(page.bytes());
            if let ScanEnd::Repaired { from } = scan.end {
                warn!(
                    "{}: corrupted tail in page {} at offset {}, zero-filling {} B",
                    self.file_name,
                    idx,
                    from,
                    page.capacity() - from
                );
                page.zero_from(from);
                record_load_repair();
            }
            page.tail = scan.end.tail();

            for rec in scan.records {
                let meta = EntryMeta { page: idx, offset: rec.offset, size: rec.size };
                if let Some(prev) = inner.entry_meta.insert(rec.key.clone(), meta) {
                    stale.push((rec.key.clone(), prev));
                }
                page.keys.insert(rec.key.clone());
                out.insert(rec.key, rec.value);
            }
        }

        // Дубликат ключа (последний выигрывает): старую копию выкидываем компакцией.
        stale.sort_by(|a, b| (b.1.page, b.1.offset).cmp(&(a.1.page, a.1.offset)));
        for (key, m) in stale {
            debug!("{}: dropping stale duplicate at page {} offset {}", self.file_name, m.page, m.offset);
            remove_region(inner, m);
            let live_page = inner.entry_meta.get(&key).map(|cur| cur.page);
            if live_page != Some(m.page) {
                inner.pages[m.page].keys.remove(&key);
            }
        }

        debug!("{}: loaded {} entries", self.file_name, out.len());
        Ok(out)
    }

    /// Вставить или перезаписать запись.
    pub fn write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let size = page_record_size(key.len(), value.len());
        if key.is_empty() {
            // key_len == 0 - маркер конца живых данных
            return Err(anyhow!("empty key is not storable"));
        }
        if size > self.capacity || key.len() > u16::MAX as usize {
            return Err(SafeBoxError::EntryTooLarge { size, capacity: self.capacity }.into());
        }

        let mut g = self.lock_open()?;
        let inner = &mut *g;
        let old = inner.entry_meta.get(key).copied();

        // Первая страница, где хвост (минус заменяемая запись на этой же странице) + size влезает.
        let fits = inner.pages.iter().enumerate().position(|(i, p)| {
            let reclaim = match old {
                Some(m) if m.page == i => m.size,
                _ => 0,
            };
            p.tail - reclaim + size <= self.capacity
        });
        let target = match fits {
            Some(i) => i,
            None => self.allocate_page(inner)?,
        };

        if let Some(m) = old {
            remove_region(inner, m);
            if m.page != target {
                inner.pages[m.page].keys.remove(key);
            }
        }

        let page = &mut inner.pages[target];
        let offset = page.tail;
        write_page_record(page.bytes_mut(), offset, key, value);
        page.tail += size;
        page.keys.insert(key.to_vec());
        page.dirty = true;
        inner
            .entry_meta
            .insert(key.to_vec(), EntryMeta { page: target, offset, size });

        record_entry_written(size);
        Ok(())
    }

    /// Удалить ключи. Неизвестные ключи игнорируются. Возвращает число удалённых.
    pub fn delete<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut g = self.lock_open()?;
        let inner = &mut *g;

        let mut removed: Vec<Vec<u8>> = Vec::new();
        for k in keys {
            let key = k.as_ref();
            let Some(m) = inner.entry_meta.get(key).copied() else {
                continue;
            };
            remove_region(inner, m);
            inner.pages[m.page].keys.remove(key);
            // метаданные правим сразу: следующий ключ может лежать на той же странице
            inner.entry_meta.remove(key);
            removed.push(key.to_vec());
        }
        if !removed.is_empty() {
            record_entries_deleted(removed.len());
        }
        Ok(removed.len())
    }

    /// Обнулить всё, оставить одну пустую страницу, усечь файл до одной страницы.
    pub fn delete_all(&self) -> Result<()> {
        let mut g = self.lock_open()?;
        let inner = &mut *g;

        for page in inner.pages.iter_mut() {
            page.wipe();
        }
        // mmap лишних страниц нужно отпустить до усечения файла
        inner.pages.truncate(1);
        inner.entry_meta.clear();
        if let Some(f) = inner.file.as_ref() {
            f.set_len(self.capacity as u64)
                .with_context(|| format!("truncate {}", self.path.display()))?;
        }
        inner.force_flush = true;
        debug!("{}: delete_all", self.file_name);
        Ok(())
    }

    /// Сбросить на диск страницы, изменённые с прошлого flush (или все после delete_all).
    pub fn flush(&self) -> Result<()> {
        let mut g = self.lock_open()?;
        let inner = &mut *g;
        let force = inner.force_flush;
        let mut flushed = 0usize;
        for page in inner.pages.iter_mut() {
            if force || page.dirty {
                page.flush()?;
                flushed += 1;
            }
        }
        if force {
            if let Some(f) = inner.file.as_ref() {
                f.sync_all()
                    .with_context(|| format!("fsync {}", self.path.display()))?;
            }
            inner.force_flush = false;
        }
        if flushed > 0 {
            record_flush(flushed);
        }
        Ok(())
    }

    #[inline]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.lock().entry_meta.contains_key(key)
    }

    pub fn entry_meta(&self, key: &[u8]) -> Option<EntryMeta> {
        self.lock().entry_meta.get(key).copied()
    }

    pub fn stats(&self) -> StoreStats {
        let g = self.lock();
        StoreStats {
            file_name: self.file_name.clone(),
            capacity: self.capacity,
            pages: g.pages.len(),
            tails: g.pages.iter().map(|p| p.tail()).collect(),
            entries: g.entry_meta.len(),
        }
    }

    /// Проверить раскладку: живые записи каждой страницы покрывают `[0, tail)`
    /// без дыр и пересечений, а всё за хвостом - нули.
    pub fn verify_layout(&self) -> Result<()> {
        let g = self.lock();
        let mut per_page: Vec<Vec<(usize, usize)>> = vec![Vec::new(); g.pages.len()];
        for (key, m) in g.entry_meta.iter() {
            if m.page >= g.pages.len() {
                return Err(anyhow!("entry points to missing page {}", m.page));
            }
            if !g.pages[m.page].keys.contains(key) {
                return Err(anyhow!("page {} key set misses a resident key", m.page));
            }
            if m.offset + m.size > self.capacity {
                return Err(anyhow!("entry at page {} offset {} overruns capacity", m.page, m.offset));
            }
            per_page[m.page].push((m.offset, m.size));
        }
        for (idx, page) in g.pages.iter().enumerate() {
            let ranges = &mut per_page[idx];
            ranges.sort_unstable();
            let mut cursor = 0usize;
            for &(off, size) in ranges.iter() {
                if off != cursor {
                    return Err(anyhow!("page {}: gap/overlap at {} (expected {})", idx, off, cursor));
                }
                cursor += size;
            }
            if cursor != page.tail() {
                return Err(anyhow!("page {}: entries end at {}, tail is {}", idx, cursor, page.tail()));
            }
            if page.keys.len() != ranges.len() {
                return Err(anyhow!("page {}: key set size mismatch", idx));
            }
            if page.bytes()[page.tail()..].iter().any(|&b| b != 0) {
                return Err(anyhow!("page {}: non-zero bytes beyond tail {}", idx, page.tail()));
            }
        }
        Ok(())
    }

    /// Закрыть стор: flush и отпустить mmap/файл. Повторный вызов - no-op.
    pub fn close(&self) -> Result<()> {
        let mut g = self.lock();
        if g.file.is_none() {
            return Ok(());
        }
        let force = g.force_flush;
        let mut res = Ok(());
        for page in g.pages.iter_mut() {
            if force || page.dirty {
                if let Err(e) = page.flush() {
                    res = Err(e);
                }
            }
        }
        g.pages.clear();
        g.entry_meta.clear();
        g.file = None;
        debug!("{}: closed", self.file_name);
        res
    }

    fn allocate_page(&self, inner: &mut StoreInner) -> Result<usize> {
        let idx = inner.pages.len();
        if idx >= self.max_pages {
            return Err(SafeBoxError::PageLimitReached { max_pages: self.max_pages }.into());
        }
        let file = inner.file.as_ref().ok_or(SafeBoxError::Closed)?;
        let need = ((idx + 1) * self.capacity) as u64;
        file.set_len(need)
            .with_context(|| format!("grow {} to {} B", self.path.display(), need))?;
        let page = Page::map(file, idx, self.capacity)?;
        inner.pages.push(page);
        record_page_allocated();
        debug!("{}: allocated page {}", self.file_name, idx);
        Ok(idx)
    }
}

/// Вырезать запись `m` из её страницы и сдвинуть смещения соседей.
/// Множество ключей страницы и entry_meta самого ключа не трогает.
fn remove_region(inner: &mut StoreInner, m: EntryMeta) {
    let page = &mut inner.pages[m.page];
    let tail = page.tail;
    page.tail = compact(page.bytes_mut(), m.offset, m.size, tail);
    page.dirty = true;
    for k in page.keys.iter() {
        if let Some(other) = inner.entry_meta.get_mut(k) {
            if other.page == m.page && other.offset > m.offset {
                other.offset -= m.size;
            }
        }
    }
    record_compaction(m.size);
}

impl Drop for SafeBoxBlobStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}: close on drop failed: {:#}", self.file_name, e);
        }
    }
}
