#![allow(non_snake_case)]

// Базовые модули
pub mod consts;
pub mod error;
pub mod metrics;
pub mod config;

// Хранилище: страницы + журнал восстановления
pub mod blob;   // src/blob/{mod,codec,page,store,recovery}.rs

// Граница шифрования
pub mod crypto; // src/crypto/{mod,aes}.rs

// Состояние, реестр, подписки
pub mod state;
pub mod registry;
pub mod subs;

// Движок
pub mod engine; // src/engine/{mod,core,write,drain,sweep,batch,barrier,worker,builder}.rs

// Удобные реэкспорты
pub use blob::{EntryMeta, JournalStats, RecoveryBlobStore, SafeBoxBlobStore, StoreStats};
pub use config::SafeBoxConfig;
pub use crypto::{AesGcmCipher, CipherError, SafeBoxCipher};
pub use engine::{Action, EngineParts, SafeBoxBatch, SafeBoxBuilder, SafeBoxEngine};
pub use error::{is_capacity_exceeded, is_closed, SafeBoxError};
pub use registry::{ActiveClaim, SafeBoxRegistry, StateSubscription};
pub use state::{SafeBoxState, StateListener};
pub use subs::{ChangeEvent, ChangeSubscription};
