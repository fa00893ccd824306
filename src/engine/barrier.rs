//! engine/barrier - одноразовая защёлка (completion barrier).
//!
//! Используется в двух местах:
//! - барьер начальной загрузки (его ждут все чтения и записи);
//! - цепочка барьеров записей: каждая запись ждёт барьер предыдущей.

use std::sync::{Condvar, Mutex};

pub(crate) struct Latch {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Уже открытая защёлка (голова цепочки до первой записи).
    pub(crate) fn signaled() -> Self {
        Self {
            done: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        let mut g = self.done.lock().unwrap_or_else(|p| p.into_inner());
        *g = true;
        self.cv.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_signaled(&self) -> bool {
        *self.done.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn wait(&self) {
        let mut g = self.done.lock().unwrap_or_else(|p| p.into_inner());
        while !*g {
            g = self.cv.wait(g).unwrap_or_else(|p| p.into_inner());
        }
    }
}
