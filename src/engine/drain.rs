//! engine/drain - слив журнала восстановления обратно в основной стор.
//!
//! - Debounce: одновременно запланирован максимум один слив (drain_scheduled).
//! - Задержка: cfg.recovery_backoff(attempt), экспоненциально с потолком.
//! - Слив идёт по общему упорядоченному пути записи (барьер + write_lock),
//!   поэтому участвует в WRITING/IDLE и не обгоняет пользовательские записи.
//! - После recovery_max_attempts неудач сдаёмся до следующего перенаправления.

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;

use crate::metrics::record_journal_drain;

use super::core::EngineCore;

impl EngineCore {
    pub(crate) fn schedule_drain(self: &Arc<Self>) {
        if self.is_closed() || self.drain_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let attempt = self.drain_attempt.load(Ordering::Acquire);
        let delay = self.cfg.recovery_backoff(attempt);
        debug!(
            "{}: journal drain #{} scheduled in {:?}",
            self.file_name,
            attempt + 1,
            delay
        );
        let weak: Weak<Self> = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(format!("safebox-drain-{}", self.file_name))
            .spawn(move || {
                thread::sleep(delay);
                if let Some(core) = weak.upgrade() {
                    core.drain_scheduled.store(false, Ordering::Release);
                    core.enqueue_drain();
                }
            });
        if let Err(e) = spawned {
            warn!("{}: cannot spawn drain timer: {}", self.file_name, e);
            self.drain_scheduled.store(false, Ordering::Release);
        }
    }

    fn enqueue_drain(self: &Arc<Self>) {
        if let Err(e) = self.enqueue_background(|core| core.drain_locked(), "journal drain") {
            debug!("{}: drain skipped: {:#}", self.file_name, e);
        }
    }

    /// Под write_lock: перенести записи файла из журнала в стор.
    fn drain_locked(self: &Arc<Self>) -> Result<()> {
        let name = self.file_name.as_str();
        let pending = self.recovery.entries(name)?;
        if pending.is_empty() {
            self.drain_attempt.store(0, Ordering::Release);
            return Ok(());
        }

        let mut moved: Vec<Vec<u8>> = Vec::with_capacity(pending.len());
        let mut last_err = None;
        for (ek, ev) in pending.iter() {
            match self.store.write(ek, ev) {
                Ok(()) => moved.push(ek.clone()),
                Err(e) => last_err = Some(e),
            }
        }
        if !moved.is_empty() {
            self.store.flush()?;
            self.recovery.delete(name, &moved)?;
            self.recovery.flush()?;
        }

        match last_err {
            None => {
                self.recovery.delete_file(name)?;
                self.recovery.flush()?;
                self.drain_attempt.store(0, Ordering::Release);
                record_journal_drain(true);
                info!("{}: recovery journal drained ({} entries)", name, moved.len());
            }
            Some(e) => {
                record_journal_drain(false);
                let attempt = self.drain_attempt.fetch_add(1, Ordering::AcqRel) + 1;
                let limit = self.cfg.recovery_max_attempts;
                // 0 = без ограничения попыток
                if limit != 0 && attempt >= limit {
                    warn!(
                        "{}: journal drain gave up after {} attempts ({} entries left): {:#}",
                        name,
                        attempt,
                        pending.len() - moved.len(),
                        e
                    );
                    self.drain_attempt.store(0, Ordering::Release);
                } else {
                    debug!("{}: journal drain attempt {} failed: {:#}", name, attempt, e);
                    self.schedule_drain();
                }
            }
        }
        Ok(())
    }
}
