//! Centralized configuration and builder for SafeBox.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - SafeBoxConfig::from_env() reads SB_* variables; Default gives production values.
//! - SafeBoxBuilder (see engine) starts from env and allows fluent overrides.
//!
//! Page layout tunables:
//! - page_capacity = 1 MiB and max_pages = 64 in production. Smaller pages keep the
//!   on-disk format identical (file length is a multiple of page_capacity).
//!
//! Recovery drain policy (journal -> page store retries):
//! - delay = initial * multiplier^attempt, capped at max; give up after max_attempts
//!   until the next reroute schedules a new drain.

use std::fmt;
use std::time::Duration;

use crate::consts::{BUFFER_CAPACITY, MAX_PAGES, RECOVERY_CAPACITY};

/// Top-level configuration for SafeBox stores and the engine.
#[derive(Clone, Debug)]
pub struct SafeBoxConfig {
    /// Page capacity in bytes.
    /// Env: SB_PAGE_CAPACITY (default 1048576)
    pub page_capacity: usize,

    /// Hard ceiling of pages per logical file.
    /// Env: SB_MAX_PAGES (default 64)
    pub max_pages: usize,

    /// Capacity of the shared recovery journal in bytes.
    /// Env: SB_RECOVERY_CAPACITY (default 1048576)
    pub recovery_capacity: usize,

    /// First retry delay for draining the journal back into the page store.
    /// Env: SB_RECOVERY_BACKOFF_MS (default 200)
    pub recovery_initial_backoff_ms: u64,

    /// Upper bound of the retry delay.
    /// Env: SB_RECOVERY_MAX_BACKOFF_MS (default 30000)
    pub recovery_max_backoff_ms: u64,

    /// Backoff growth factor.
    /// Env: SB_RECOVERY_BACKOFF_MULT (default 2)
    pub recovery_backoff_multiplier: u32,

    /// Attempts per scheduled drain before giving up (0 = unlimited).
    /// Env: SB_RECOVERY_MAX_ATTEMPTS (default 10)
    pub recovery_max_attempts: u32,

    /// Flush dirty pages after each persisted batch.
    /// Env: SB_FLUSH_ON_WRITE (default true; "0|false|off|no" => false)
    pub flush_on_write: bool,
}

impl Default for SafeBoxConfig {
    fn default() -> Self {
        Self {
            page_capacity: BUFFER_CAPACITY,
            max_pages: MAX_PAGES,
            recovery_capacity: RECOVERY_CAPACITY,
            recovery_initial_backoff_ms: 200,
            recovery_max_backoff_ms: 30_000,
            recovery_backoff_multiplier: 2,
            recovery_max_attempts: 10,
            flush_on_write: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "on" || s == "yes"
    })
}

impl SafeBoxConfig {
    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<usize>("SB_PAGE_CAPACITY") {
            if n > 0 {
                cfg.page_capacity = n;
            }
        }
        if let Some(n) = env_parse::<usize>("SB_MAX_PAGES") {
            if n > 0 {
                cfg.max_pages = n;
            }
        }
        if let Some(n) = env_parse::<usize>("SB_RECOVERY_CAPACITY") {
            if n > 0 {
                cfg.recovery_capacity = n;
            }
        }

        // ----- recovery drain policy -----
        if let Some(n) = env_parse::<u64>("SB_RECOVERY_BACKOFF_MS") {
            cfg.recovery_initial_backoff_ms = n;
        }
        if let Some(n) = env_parse::<u64>("SB_RECOVERY_MAX_BACKOFF_MS") {
            cfg.recovery_max_backoff_ms = n;
        }
        if let Some(n) = env_parse::<u32>("SB_RECOVERY_BACKOFF_MULT") {
            cfg.recovery_backoff_multiplier = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("SB_RECOVERY_MAX_ATTEMPTS") {
            cfg.recovery_max_attempts = n;
        }

        if let Some(on) = env_flag("SB_FLUSH_ON_WRITE") {
            cfg.flush_on_write = on;
        }

        cfg
    }

    /// Delay before drain attempt `attempt` (0-based), capped at the max backoff.
    pub fn recovery_backoff(&self, attempt: u32) -> Duration {
        let mult = self.recovery_backoff_multiplier.max(1) as u64;
        let mut ms = self.recovery_initial_backoff_ms;
        for _ in 0..attempt {
            ms = ms.saturating_mul(mult);
            if ms >= self.recovery_max_backoff_ms {
                break;
            }
        }
        Duration::from_millis(ms.min(self.recovery_max_backoff_ms))
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_page_capacity(mut self, bytes: usize) -> Self {
        self.page_capacity = bytes;
        self
    }

    pub fn with_max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn with_recovery_capacity(mut self, bytes: usize) -> Self {
        self.recovery_capacity = bytes;
        self
    }

    /// Set initial/max retry delays (ms) for the journal drain.
    pub fn with_recovery_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.recovery_initial_backoff_ms = initial;
        self.recovery_max_backoff_ms = max;
        self
    }

    pub fn with_recovery_backoff_multiplier(mut self, mult: u32) -> Self {
        self.recovery_backoff_multiplier = mult.max(1);
        self
    }

    pub fn with_recovery_max_attempts(mut self, attempts: u32) -> Self {
        self.recovery_max_attempts = attempts;
        self
    }

    pub fn with_flush_on_write(mut self, on: bool) -> Self {
        self.flush_on_write = on;
        self
    }
}

impl fmt::Display for SafeBoxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SafeBoxConfig {{ \
             page_capacity: {}, \
             max_pages: {}, \
             recovery_capacity: {}, \
             recovery_backoff: {}..{} ms x{}, \
             recovery_max_attempts: {}, \
             flush_on_write: {} \
             }}",
            self.page_capacity,
            self.max_pages,
            self.recovery_capacity,
            self.recovery_initial_backoff_ms,
            self.recovery_max_backoff_ms,
            self.recovery_backoff_multiplier,
            if self.recovery_max_attempts == 0 {
                "unlimited".to_string()
            } else {
                self.recovery_max_attempts.to_string()
            },
            self.flush_on_write,
        )
    }
}
