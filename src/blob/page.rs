//! blob/page - одна mmap-страница логического файла.

use anyhow::{Context, Result};
use memmap2::{MmapMut, MmapOptions};
use std::collections::HashSet;
use std::fs::File;

/// Фиксированный mmap-регион `[index*capacity, (index+1)*capacity)` файла.
///
/// Хранит собственный хвост (nextWritePosition) и множество ключей,
/// лежащих на этой странице, чтобы компакция правила смещения только соседей.
pub struct Page {
    mmap: MmapMut,
    pub(crate) tail: usize,
    pub(crate) keys: HashSet<Vec<u8>>,
    pub(crate) dirty: bool,
}

impl Page {
    /// Замапить страницу `index`. Файл уже должен быть достаточной длины.
    pub fn map(file: &File, index: usize, capacity: usize) -> Result<Self> {
        let offset = (index as u64) * (capacity as u64);
        // SAFETY: файл открыт эксклюзивно этим стором; длина гарантирована set_len до map.
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(capacity)
                .map_mut(file)
                .with_context(|| format!("mmap page {} (offset {}, len {})", index, offset, capacity))?
        };
        Ok(Self {
            mmap,
            tail: 0,
            keys: HashSet::new(),
            dirty: false,
        })
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Обнулить `[from, capacity)` - починка битого хвоста при загрузке.
    pub fn zero_from(&mut self, from: usize) {
        self.mmap[from..].fill(0);
        self.dirty = true;
    }

    /// Обнулить живую часть `[0, tail)` и сбросить хвост.
    pub fn wipe(&mut self) {
        let tail = self.tail;
        self.mmap[..tail].fill(0);
        self.tail = 0;
        self.keys.clear();
        self.dirty = true;
    }

    /// msync страницы. Сбрасывает флаг dirty.
    pub fn flush(&mut self) -> Result<()> {
        self.mmap.flush().context("msync page")?;
        self.dirty = false;
        Ok(())
    }
}
