//! engine/write - путь записи: память сразу, диск по цепочке барьеров.
//!
//! Шаги одной записи (commit или apply):
//! 1) шифрование действий батча (вне замков);
//! 2) под update_lock: обновление карты, подсчёт изменившихся ключей, смена
//!    барьера в ячейке last_barrier, WRITING;
//! 3) уведомления слушателей изменений (вне замка);
//! 4) persist: ждём барьер предыдущей записи -> write_lock -> store/journal.
//!    Свой барьер сигналится всегда (Finish::drop), даже при ошибке/панике.
//!
//! Порядок физических записей = порядок вызовов commit/apply.

use anyhow::{Context, Result};
use log::{debug, error, warn};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::SafeBoxError;
use crate::metrics::record_write_failure;
use crate::subs::ChangeEvent;

use super::barrier::Latch;
use super::batch::{Action, SafeBoxBatch};
use super::core::{relock, EngineCore};
use super::worker::Job;

/// Физическая часть батча (всё уже зашифровано).
#[derive(Debug, Default)]
pub(crate) struct WritePlan {
    pub(crate) cleared: bool,
    pub(crate) puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub(crate) removes: Vec<Vec<u8>>,
}

impl WritePlan {
    fn is_noop(&self) -> bool {
        !self.cleared && self.puts.is_empty() && self.removes.is_empty()
    }
}

/// Место записи в цепочке: ждём prev, сигналим mine.
pub(crate) struct WriteTicket {
    prev: Arc<Latch>,
    mine: Arc<Latch>,
}

struct Finish<'a> {
    core: &'a EngineCore,
    latch: &'a Latch,
}

impl Drop for Finish<'_> {
    fn drop(&mut self) {
        self.latch.signal();
        self.core.state.write_finished();
    }
}

enum Encrypted {
    Put { ek: Vec<u8>, ev: Vec<u8>, plain: Vec<u8> },
    Remove { ek: Vec<u8> },
}

impl EngineCore {
    /// Занять место в цепочке. Вызывать под update_lock.
    fn take_ticket(&self) -> WriteTicket {
        let mine = Arc::new(Latch::new());
        let prev = std::mem::replace(&mut *relock(&self.last_barrier), mine.clone());
        self.state.write_enqueued();
        WriteTicket { prev, mine }
    }

    /// Шаги 1-3. `dispatch` вызывается под update_lock сразу после получения билета.
    /// None: пустой батч. Err: движок закрыт или шифрование не удалось.
    fn stage<T>(
        &self,
        batch: &SafeBoxBatch,
        dispatch: impl FnOnce(WritePlan, WriteTicket) -> T,
    ) -> Result<Option<T>> {
        self.await_loaded();
        if batch.is_empty() {
            return Ok(None);
        }

        let mut enc = Vec::with_capacity(batch.len());
        for (key, action) in batch.actions() {
            let ek = self
                .encrypt_key(key)
                .with_context(|| format!("encrypt key {:?}", key))?;
            enc.push(match action {
                Action::Put(v) => Encrypted::Put {
                    ek,
                    ev: self
                        .value_cipher
                        .encrypt(v)
                        .with_context(|| format!("encrypt value of {:?}", key))?,
                    plain: v.clone(),
                },
                Action::Remove => Encrypted::Remove { ek },
            });
        }

        let mut cleared_keys: Vec<Vec<u8>> = Vec::new();
        let mut changed: Vec<String> = Vec::new();
        let mut plan = WritePlan {
            cleared: batch.is_cleared(),
            ..WritePlan::default()
        };

        let dispatched = {
            let _u = relock(&self.update_lock);
            if self.is_closed() {
                return Err(SafeBoxError::Closed.into());
            }

            let touched: HashSet<&[u8]> = enc
                .iter()
                .map(|e| match e {
                    Encrypted::Put { ek, .. } | Encrypted::Remove { ek } => ek.as_slice(),
                })
                .collect();
            // Прежние значения ключей батча (до clear).
            let prior: Vec<Option<Vec<u8>>> = enc
                .iter()
                .map(|e| match e {
                    Encrypted::Put { ek, .. } | Encrypted::Remove { ek } => {
                        self.entries.get(ek).map(|r| r.value().clone())
                    }
                })
                .collect();

            if plan.cleared {
                for r in self.entries.iter() {
                    if !touched.contains(r.key().as_slice()) {
                        cleared_keys.push(r.key().clone());
                    }
                }
                self.entries.clear();
            }

            for ((e, prev), (key, _)) in enc.into_iter().zip(prior).zip(batch.actions()) {
                match e {
                    Encrypted::Put { ek, ev, plain } => {
                        let same = match prev.as_deref() {
                            Some(p) => matches!(self.value_cipher.decrypt(p), Ok(old) if old == plain),
                            None => false,
                        };
                        if !same {
                            changed.push(key.to_string());
                        }
                        self.entries.insert(ek.clone(), ev.clone());
                        plan.puts.push((ek, ev));
                    }
                    Encrypted::Remove { ek } => {
                        if prev.is_some() {
                            changed.push(key.to_string());
                        }
                        self.entries.remove(&ek);
                        plan.removes.push(ek);
                    }
                }
            }

            let ticket = self.take_ticket();
            dispatch(plan, ticket)
        };

        self.notify_changes(cleared_keys, changed);
        Ok(Some(dispatched))
    }

    fn notify_changes(&self, cleared_keys: Vec<Vec<u8>>, changed: Vec<String>) {
        if !self.changes.has_subscribers() {
            return;
        }
        let mut events = Vec::with_capacity(cleared_keys.len() + changed.len());
        for ek in cleared_keys.iter().rev() {
            // Нерасшифровываемый ключ некому показать.
            if let Some(key) = self
                .key_cipher
                .decrypt(ek)
                .ok()
                .and_then(|k| String::from_utf8(k).ok())
            {
                events.push(ChangeEvent { key });
            }
        }
        events.extend(changed.into_iter().map(|key| ChangeEvent { key }));
        self.changes.publish_all(&events);
    }

    /// Шаг 4: дождаться предшественника и выполнить f под write_lock.
    pub(crate) fn run_ordered<T>(
        &self,
        ticket: WriteTicket,
        f: impl FnOnce(&Self) -> Result<T>,
    ) -> Result<T> {
        let _finish = Finish {
            core: self,
            latch: &ticket.mine,
        };
        ticket.prev.wait();
        let _w = relock(&self.write_lock);
        f(self)
    }

    /// Физическое применение плана. Вызывается под write_lock.
    pub(crate) fn persist(self: &Arc<Self>, plan: &WritePlan) -> Result<()> {
        if plan.is_noop() {
            return Ok(());
        }
        let name = self.file_name.as_str();
        let mut journal_touched = false;

        if plan.cleared {
            self.store.delete_all().context("clear store")?;
            journal_touched |= self.recovery.delete_file(name).context("clear journal")? > 0;
        }

        let mut rerouted = false;
        for (ek, ev) in plan.puts.iter() {
            match self.store.write(ek, ev) {
                Ok(()) => {
                    if self.recovery.contains(name, ek) {
                        self.recovery.delete(name, &[ek])?;
                        journal_touched = true;
                    }
                }
                Err(e) => {
                    warn!("{}: store write failed ({:#}), rerouting to recovery journal", name, e);
                    self.recovery
                        .write(name, ek, ev)
                        .with_context(|| format!("{}: recovery journal write", name))?;
                    rerouted = true;
                    journal_touched = true;
                }
            }
        }

        if !plan.removes.is_empty() {
            let n = self.store.delete(&plan.removes)?;
            let j = self.recovery.delete(name, &plan.removes)?;
            journal_touched |= j > 0;
            debug!("{}: removed {} entries ({} from journal)", name, n, j);
        }

        if self.cfg.flush_on_write {
            self.store.flush()?;
            if journal_touched {
                self.recovery.flush()?;
            }
        }

        if rerouted {
            self.schedule_drain();
        }
        Ok(())
    }

    /// commit: persist на вызывающем потоке.
    pub(crate) fn commit(self: &Arc<Self>, batch: &SafeBoxBatch) -> bool {
        let (plan, ticket) = match self.stage(batch, |plan, ticket| (plan, ticket)) {
            Ok(Some(staged)) => staged,
            Ok(None) => return true,
            Err(e) => {
                error!("{}: commit rejected: {:#}", self.file_name, e);
                return false;
            }
        };
        match self.run_ordered(ticket, |_| self.persist(&plan)) {
            Ok(()) => true,
            Err(e) => {
                record_write_failure();
                error!("{}: commit failed: {:#}", self.file_name, e);
                false
            }
        }
    }

    /// apply: persist на фоновом исполнителе; ошибки только в лог.
    pub(crate) fn apply(self: &Arc<Self>, batch: &SafeBoxBatch) {
        let staged = self.stage(batch, |plan, ticket| {
            self.enqueue_locked(ticket, move |core| core.persist(&plan), "apply")
        });
        match staged {
            Ok(Some(refused)) => run_refused(refused),
            Ok(None) => {}
            Err(e) => error!("{}: apply rejected: {:#}", self.file_name, e),
        }
    }

    /// Поставить упорядоченную задачу на исполнитель. Вызывать под update_lock
    /// сразу после take_ticket(): очередь исполнителя идёт в порядке билетов.
    /// Отказ исполнителя (поток умер) возвращает задачу вызывающему, который
    /// выполнит её уже без замка, чтобы цепочка барьеров не оборвалась.
    fn enqueue_locked<F>(self: &Arc<Self>, ticket: WriteTicket, f: F, what: &'static str) -> Option<Job>
    where
        F: FnOnce(&Arc<Self>) -> Result<()> + Send + 'static,
    {
        let core = self.clone();
        let job: Job = Box::new(move || {
            let c = core.clone();
            if let Err(e) = core.run_ordered(ticket, move |_| f(&c)) {
                record_write_failure();
                error!("{}: {} failed: {:#}", core.file_name, what, e);
            }
        });
        match self.worker.submit(job) {
            Ok(()) => None,
            Err(job) => {
                warn!("{}: worker is gone, running {} inline", self.file_name, what);
                Some(job)
            }
        }
    }

    /// Зачистка: удаление зашифрованных ключей по общему пути записи.
    pub(crate) fn remove_encrypted(self: &Arc<Self>, keys: Vec<Vec<u8>>, what: &'static str) -> Result<()> {
        let refused = {
            let _u = relock(&self.update_lock);
            if self.is_closed() {
                return Err(SafeBoxError::Closed.into());
            }
            let mut plan = WritePlan::default();
            for ek in keys {
                if self.entries.remove(&ek).is_some() {
                    plan.removes.push(ek);
                }
            }
            if plan.removes.is_empty() {
                return Ok(());
            }
            let ticket = self.take_ticket();
            self.enqueue_locked(ticket, move |core| core.persist(&plan), what)
        };
        run_refused(refused);
        Ok(())
    }

    /// Фоновая задача в общей цепочке без изменения памяти (слив журнала).
    pub(crate) fn enqueue_background<F>(self: &Arc<Self>, f: F, what: &'static str) -> Result<()>
    where
        F: FnOnce(&Arc<Self>) -> Result<()> + Send + 'static,
    {
        let refused = {
            let _u = relock(&self.update_lock);
            if self.is_closed() {
                return Err(SafeBoxError::Closed.into());
            }
            let ticket = self.take_ticket();
            self.enqueue_locked(ticket, f, what)
        };
        run_refused(refused);
        Ok(())
    }

    pub(crate) fn mark_closed(&self) -> bool {
        let _u = relock(&self.update_lock);
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

fn run_refused(job: Option<Job>) {
    if let Some(job) = job {
        job();
    }
}
