//! blob - слой хранения зашифрованных записей.
//!
//! Подмодули:
//! - codec.rs    - форматы записей, сканирование региона (`ScanEnd`), примитив компакции.
//! - page.rs     - одна mmap-страница (хвост, множество ключей, dirty).
//! - store.rs    - SafeBoxBlobStore: страницы логического файла, запись в хвост, компакция, рост.
//! - recovery.rs - RecoveryBlobStore: общий для процесса журнал на случай переполнения стора.
//!
//! Ключи и значения на этом уровне - уже зашифрованные непрозрачные байты.

pub mod codec;
pub mod page;
pub mod recovery;
pub mod store;

pub use recovery::{JournalStats, RecoveryBlobStore};
pub use store::{SafeBoxBlobStore, StoreStats};

/// Где лежит живая запись: страница, смещение, полный размер (с заголовком).
///
/// Инвариант: `offset + size <= capacity`, записи одной страницы не пересекаются.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub page: usize,
    pub offset: usize,
    pub size: usize,
}
