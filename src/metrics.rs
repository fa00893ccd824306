//! Lightweight global metrics for SafeBox.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Blob store (записи, компакция, страницы, flush, починка при загрузке)
//! - Recovery journal (перенаправления, слив)
//! - Engine (dead entries)

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Blob store -----
static ENTRIES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static ENTRIES_DELETED: AtomicU64 = AtomicU64::new(0);
static COMPACTIONS: AtomicU64 = AtomicU64::new(0);
static BYTES_RECLAIMED: AtomicU64 = AtomicU64::new(0);
static PAGES_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static PAGES_FLUSHED: AtomicU64 = AtomicU64::new(0);
static LOAD_REPAIRS: AtomicU64 = AtomicU64::new(0);

// ----- Recovery journal -----
static JOURNAL_WRITES: AtomicU64 = AtomicU64::new(0);
static JOURNAL_BYTES: AtomicU64 = AtomicU64::new(0);
static JOURNAL_DRAINS: AtomicU64 = AtomicU64::new(0);
static JOURNAL_DRAIN_FAILURES: AtomicU64 = AtomicU64::new(0);

// ----- Engine -----
static DEAD_ENTRIES_SWEPT: AtomicU64 = AtomicU64::new(0);
static WRITE_FAILURES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Blob store
    pub entries_written: u64,
    pub bytes_written: u64,
    pub entries_deleted: u64,
    pub compactions: u64,
    pub bytes_reclaimed: u64,
    pub pages_allocated: u64,
    pub pages_flushed: u64,
    pub load_repairs: u64,

    // Recovery journal
    pub journal_writes: u64,
    pub journal_bytes: u64,
    pub journal_drains: u64,
    pub journal_drain_failures: u64,

    // Engine
    pub dead_entries_swept: u64,
    pub write_failures: u64,
}

impl MetricsSnapshot {
    /// Средний размер вытесненной компакцией записи.
    pub fn avg_reclaimed_bytes(&self) -> f64 {
        if self.compactions == 0 {
            0.0
        } else {
            self.bytes_reclaimed as f64 / self.compactions as f64
        }
    }
}

#[inline]
pub fn record_entry_written(bytes: usize) {
    ENTRIES_WRITTEN.fetch_add(1, Ordering::Relaxed);
    BYTES_WRITTEN.fetch_add(bytes as u64, Ordering::Relaxed);
}

#[inline]
pub fn record_entries_deleted(n: usize) {
    ENTRIES_DELETED.fetch_add(n as u64, Ordering::Relaxed);
}

#[inline]
pub fn record_compaction(reclaimed: usize) {
    COMPACTIONS.fetch_add(1, Ordering::Relaxed);
    BYTES_RECLAIMED.fetch_add(reclaimed as u64, Ordering::Relaxed);
}

#[inline]
pub fn record_page_allocated() {
    PAGES_ALLOCATED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_flush(pages: usize) {
    PAGES_FLUSHED.fetch_add(pages as u64, Ordering::Relaxed);
}

#[inline]
pub fn record_load_repair() {
    LOAD_REPAIRS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_journal_write(bytes: usize) {
    JOURNAL_WRITES.fetch_add(1, Ordering::Relaxed);
    JOURNAL_BYTES.fetch_add(bytes as u64, Ordering::Relaxed);
}

#[inline]
pub fn record_journal_drain(ok: bool) {
    if ok {
        JOURNAL_DRAINS.fetch_add(1, Ordering::Relaxed);
    } else {
        JOURNAL_DRAIN_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub fn record_dead_entries(n: usize) {
    DEAD_ENTRIES_SWEPT.fetch_add(n as u64, Ordering::Relaxed);
}

#[inline]
pub fn record_write_failure() {
    WRITE_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        entries_written: ENTRIES_WRITTEN.load(Ordering::Relaxed),
        bytes_written: BYTES_WRITTEN.load(Ordering::Relaxed),
        entries_deleted: ENTRIES_DELETED.load(Ordering::Relaxed),
        compactions: COMPACTIONS.load(Ordering::Relaxed),
        bytes_reclaimed: BYTES_RECLAIMED.load(Ordering::Relaxed),
        pages_allocated: PAGES_ALLOCATED.load(Ordering::Relaxed),
        pages_flushed: PAGES_FLUSHED.load(Ordering::Relaxed),
        load_repairs: LOAD_REPAIRS.load(Ordering::Relaxed),
        journal_writes: JOURNAL_WRITES.load(Ordering::Relaxed),
        journal_bytes: JOURNAL_BYTES.load(Ordering::Relaxed),
        journal_drains: JOURNAL_DRAINS.load(Ordering::Relaxed),
        journal_drain_failures: JOURNAL_DRAIN_FAILURES.load(Ordering::Relaxed),
        dead_entries_swept: DEAD_ENTRIES_SWEPT.load(Ordering::Relaxed),
        write_failures: WRITE_FAILURES.load(Ordering::Relaxed),
    }
}

pub fn metrics_reset() {
    for c in [
        &ENTRIES_WRITTEN,
        &BYTES_WRITTEN,
        &ENTRIES_DELETED,
        &COMPACTIONS,
        &BYTES_RECLAIMED,
        &PAGES_ALLOCATED,
        &PAGES_FLUSHED,
        &LOAD_REPAIRS,
        &JOURNAL_WRITES,
        &JOURNAL_BYTES,
        &JOURNAL_DRAINS,
        &JOURNAL_DRAIN_FAILURES,
        &DEAD_ENTRIES_SWEPT,
        &WRITE_FAILURES,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}
