//! engine/sweep - зачистка «мёртвых» записей.
//!
//! Запускается первой ошибкой аутентификации при расшифровке (не более одной
//! зачистки одновременно). Удаления идут асинхронно по общему пути записи.

use log::{debug, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::metrics::record_dead_entries;

use super::core::EngineCore;

impl EngineCore {
    pub(crate) fn trigger_sweep(self: &Arc<Self>) {
        if self.is_closed()
            || self
                .sweep_running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        let core = self.clone();
        if self.worker.submit(Box::new(move || core.sweep_dead_entries())).is_err() {
            self.sweep_running.store(false, Ordering::Release);
        }
    }

    fn sweep_dead_entries(self: &Arc<Self>) {
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let dead: Vec<Vec<u8>> = snapshot
            .into_iter()
            .filter(|(ek, ev)| {
                let key_dead = matches!(self.key_cipher.decrypt(ek), Err(e) if e.is_authentication());
                key_dead
                    || matches!(self.value_cipher.decrypt(ev), Err(e) if e.is_authentication())
            })
            .map(|(ek, _)| ek)
            .collect();

        if !dead.is_empty() {
            warn!("{}: removing {} dead entries", self.file_name, dead.len());
            record_dead_entries(dead.len());
            if let Err(e) = self.remove_encrypted(dead, "dead entry sweep") {
                debug!("{}: sweep skipped: {:#}", self.file_name, e);
            }
        }
        self.sweep_running.store(false, Ordering::Release);
    }
}
