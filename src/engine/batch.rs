//! engine/batch - набор правок одного commit/apply.
//!
//! Что держит:
//! - упорядоченный список действий по ключам (Put / Remove); повторная правка
//!   того же ключа заменяет действие на его прежнем месте;
//! - флаг cleared: перед действиями батча файл очищается целиком.

use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Закодированное (ещё не зашифрованное) значение.
    Put(Vec<u8>),
    Remove,
}

#[derive(Clone, Debug, Default)]
pub struct SafeBoxBatch {
    cleared: bool,
    actions: Vec<(String, Action)>,
    index: HashMap<String, usize>,
}

impl SafeBoxBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &str, value: impl Into<Vec<u8>>) -> &mut Self {
        self.set(key, Action::Put(value.into()))
    }

    pub fn remove(&mut self, key: &str) -> &mut Self {
        self.set(key, Action::Remove)
    }

    /// Очистить файл перед применением остальных действий батча.
    pub fn clear(&mut self) -> &mut Self {
        self.cleared = true;
        self
    }

    fn set(&mut self, key: &str, action: Action) -> &mut Self {
        match self.index.get(key) {
            Some(&i) => self.actions[i].1 = action,
            None => {
                self.index.insert(key.to_string(), self.actions.len());
                self.actions.push((key.to_string(), action));
            }
        }
        self
    }

    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// Пустой батч без clear ничего не меняет.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.cleared && self.actions.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn actions(&self) -> impl Iterator<Item = (&str, &Action)> {
        self.actions.iter().map(|(k, a)| (k.as_str(), a))
    }
}
