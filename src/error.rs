//! Distinguished failures of the storage layer and the engine.
//!
//! Everything fallible in the crate returns `anyhow::Result`; the variants below
//! travel inside `anyhow::Error` and are recovered with `downcast_ref` where the
//! caller has to react (reroute to the recovery journal, report a closed engine).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SafeBoxError {
    /// Запись не помещается в одну страницу (или в журнал целиком).
    #[error("entry of {size} bytes exceeds capacity of {capacity} bytes")]
    EntryTooLarge { size: usize, capacity: usize },

    /// Достигнут потолок числа страниц логического файла.
    #[error("page limit of {max_pages} pages reached")]
    PageLimitReached { max_pages: usize },

    /// В recovery-журнале не осталось места под запись.
    #[error("recovery journal full: need {needed} bytes, {available} available")]
    JournalFull { needed: usize, available: usize },

    #[error("store is closed")]
    Closed,

    /// Второй экземпляр движка для того же логического файла.
    #[error("SafeBox '{name}' is already open")]
    AlreadyOpen { name: String },
}

impl SafeBoxError {
    #[inline]
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(
            self,
            SafeBoxError::EntryTooLarge { .. }
                | SafeBoxError::PageLimitReached { .. }
                | SafeBoxError::JournalFull { .. }
        )
    }
}

/// True, если ошибка (в любом месте цепочки контекста) - переполнение ёмкости.
pub fn is_capacity_exceeded(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<SafeBoxError>())
        .any(SafeBoxError::is_capacity_exceeded)
}

/// True, если операция упала на закрытом хранилище.
pub fn is_closed(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<SafeBoxError>())
        .any(|e| *e == SafeBoxError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn capacity_detected_through_context() {
        let base: anyhow::Result<()> = Err(SafeBoxError::PageLimitReached { max_pages: 64 }.into());
        let err = base.context("write entry").unwrap_err();
        assert!(is_capacity_exceeded(&err));
        assert!(!is_closed(&err));
    }

    #[test]
    fn io_errors_are_not_capacity() {
        let err = anyhow::Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(!is_capacity_exceeded(&err));
        let closed: anyhow::Error = SafeBoxError::Closed.into();
        assert!(is_closed(&closed));
    }
}
