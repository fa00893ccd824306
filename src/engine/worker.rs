//! engine/worker - фоновый исполнитель движка.
//!
//! Один поток на экземпляр: начальная загрузка, асинхронные (apply) записи,
//! слив журнала восстановления и зачистка мёртвых записей выполняются здесь
//! строго в порядке постановки.

use anyhow::{anyhow, Context, Result};
use log::{debug, error};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Worker {
    tx: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Worker {
    pub(crate) fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = channel::<Job>();
        let handle = thread::Builder::new()
            .name(format!("safebox-{}", name))
            .spawn(move || {
                // Отправитель закрыт и очередь пуста -> выходим.
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .with_context(|| format!("spawn worker for {}", name))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Поставить задачу. При закрытом исполнителе задача возвращается вызывающему.
    pub(crate) fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        let g = relock(&self.tx);
        match g.as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        relock(&self.tx).is_some()
    }

    /// Закрыть очередь, дождаться выполнения уже поставленных задач.
    pub(crate) fn shutdown(&self) -> Result<()> {
        drop(relock(&self.tx).take());
        let handle = relock(&self.handle).take();
        if let Some(h) = handle {
            if h.thread().id() == thread::current().id() {
                // Закрытие изнутри задачи: join самого себя невозможен.
                debug!("worker shutdown requested from its own thread; detaching");
                return Ok(());
            }
            if h.join().is_err() {
                error!("safebox worker thread panicked");
                return Err(anyhow!("safebox worker thread panicked"));
            }
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
