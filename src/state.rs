//! Lifecycle state machine of one engine: STARTING -> (IDLE <-> WRITING).
//!
//! WRITING держится, пока счётчик незавершённых записей > 0; в IDLE переходим
//! только при возврате счётчика к нулю. Каждый переход публикуется в реестр
//! и в необязательный слушатель экземпляра (в этом порядке).

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::registry::SafeBoxRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafeBoxState {
    Starting,
    Idle,
    Writing,
}

impl fmt::Display for SafeBoxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafeBoxState::Starting => "STARTING",
            SafeBoxState::Idle => "IDLE",
            SafeBoxState::Writing => "WRITING",
        };
        f.write_str(s)
    }
}

impl SafeBoxState {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => SafeBoxState::Starting,
            1 => SafeBoxState::Idle,
            _ => SafeBoxState::Writing,
        }
    }
}

/// Слушатель переходов конкретного экземпляра.
pub type StateListener = Arc<dyn Fn(SafeBoxState) + Send + Sync + 'static>;

struct Machine {
    state: SafeBoxState,
    pending: usize,
}

pub(crate) struct StateManager {
    file_name: String,
    registry: Arc<SafeBoxRegistry>,
    listener: Option<StateListener>,
    machine: Mutex<Machine>,
    cv: Condvar,
    // Зеркало state для чтения без замка (в т.ч. из колбэков слушателей).
    current: AtomicU8,
}

impl StateManager {
    /// Создать в STARTING и сразу опубликовать.
    pub(crate) fn new(
        file_name: &str,
        registry: Arc<SafeBoxRegistry>,
        listener: Option<StateListener>,
    ) -> Self {
        let sm = Self {
            file_name: file_name.to_string(),
            registry,
            listener,
            machine: Mutex::new(Machine {
                state: SafeBoxState::Starting,
                pending: 0,
            }),
            cv: Condvar::new(),
            current: AtomicU8::new(SafeBoxState::Starting.as_u8()),
        };
        sm.notify(SafeBoxState::Starting);
        sm
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(|p| p.into_inner())
    }

    // Публикация под замком машины: порядок уведомлений = порядок переходов.
    fn notify(&self, state: SafeBoxState) {
        self.registry.publish(&self.file_name, state);
        if let Some(l) = self.listener.as_ref() {
            l(state);
        }
    }

    fn transition(&self, m: &mut Machine, next: SafeBoxState) {
        if m.state != next {
            m.state = next;
            self.current.store(next.as_u8(), Ordering::Release);
            self.notify(next);
        }
    }

    pub(crate) fn state(&self) -> SafeBoxState {
        SafeBoxState::from_u8(self.current.load(Ordering::Acquire))
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.lock().pending
    }

    /// Начальная загрузка завершена.
    pub(crate) fn load_finished(&self) {
        let mut m = self.lock();
        let next = if m.pending > 0 {
            SafeBoxState::Writing
        } else {
            SafeBoxState::Idle
        };
        self.transition(&mut m, next);
        self.cv.notify_all();
    }

    /// Поставлена в очередь ещё одна запись.
    pub(crate) fn write_enqueued(&self) {
        let mut m = self.lock();
        m.pending += 1;
        if m.state != SafeBoxState::Starting {
            self.transition(&mut m, SafeBoxState::Writing);
        }
    }

    /// Запись завершилась (успешно или нет).
    pub(crate) fn write_finished(&self) {
        let mut m = self.lock();
        m.pending = m.pending.saturating_sub(1);
        if m.pending == 0 && m.state != SafeBoxState::Starting {
            self.transition(&mut m, SafeBoxState::Idle);
        }
        self.cv.notify_all();
    }

    /// Дождаться окончания загрузки и всех поставленных записей.
    pub(crate) fn wait_idle(&self) {
        let mut m = self.lock();
        while m.state == SafeBoxState::Starting || m.pending > 0 {
            m = self.cv.wait(m).unwrap_or_else(|p| p.into_inner());
        }
    }
}
