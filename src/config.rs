//! Per-component configuration records (spec.md §6).
//!
//! Plain `Default`-able structs with builder-style `with_*` methods, the way
//! the teacher's `HotReloadConfig` (`lib.rs`) and `ErrorRecoveryConfig`
//! (`error_recovery.rs`) are shaped. There is no external config-file format:
//! persisted state is explicitly out of scope (spec.md §6).

use std::time::Duration;

/// Configuration for a [`crate::registry::PageRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Hard cap on the number of live pages. `Store` rejects beyond this.
    pub max_pages: usize,
    /// Lifetime after last access before a page is eligible for sweeping.
    pub default_ttl: Duration,
    /// How often the background sweeper runs.
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_pages: 10_000,
            default_ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Per-page caps (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageConfig {
    pub max_fragments: usize,
    pub max_memory_mb: u64,
    pub update_batch_size: usize,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            max_fragments: 256,
            max_memory_mb: 16,
            update_batch_size: 64,
        }
    }
}

impl PageConfig {
    pub fn with_max_fragments(mut self, n: usize) -> Self {
        self.max_fragments = n;
        self
    }

    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn with_update_batch_size(mut self, n: usize) -> Self {
        self.update_batch_size = n;
        self
    }
}

/// The one signing algorithm the Token Service ever issues or accepts.
/// Any token declaring a different algorithm is rejected outright,
/// including `"none"` (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Hs256,
}

impl Algorithm {
    pub fn header_value(self) -> &'static str {
        match self {
            Algorithm::Hs256 => "HS256",
        }
    }
}

/// Configuration for a [`crate::token::TokenService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenServiceConfig {
    pub ttl: Duration,
    pub replay_window: Duration,
    pub algorithm: Algorithm,
}

impl Default for TokenServiceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(4 * 60 * 60),
            replay_window: Duration::from_secs(5),
            algorithm: Algorithm::Hs256,
        }
    }
}

impl TokenServiceConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_replay_window(mut self, window: Duration) -> Self {
        self.replay_window = window;
        self
    }
}

/// Configuration for a [`crate::memory::MemoryManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryManagerConfig {
    pub max_memory_mb: u64,
    pub warning_threshold_pct: u8,
    pub critical_threshold_pct: u8,
    pub cleanup_interval: Duration,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            warning_threshold_pct: 75,
            critical_threshold_pct: 90,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl MemoryManagerConfig {
    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn with_thresholds(mut self, warning_pct: u8, critical_pct: u8) -> Self {
        self.warning_threshold_pct = warning_pct;
        self.critical_threshold_pct = critical_pct;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Umbrella configuration threaded through [`crate::application::Application`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationConfig {
    pub registry: RegistryConfig,
    pub page: PageConfig,
    pub token: TokenServiceConfig,
    pub memory: MemoryManagerConfig,
    /// When `true` (the default), `LiveTemplateError::Internal`'s diagnostic
    /// is withheld from anything derived from `Display`/`to_string`; only
    /// `InternalError::diagnostic()` (trusted, internal logging call sites)
    /// can read it.
    pub redact_internal_errors: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            page: PageConfig::default(),
            token: TokenServiceConfig::default(),
            memory: MemoryManagerConfig::default(),
            redact_internal_errors: true,
        }
    }
}

impl ApplicationConfig {
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_page(mut self, page: PageConfig) -> Self {
        self.page = page;
        self
    }

    pub fn with_token(mut self, token: TokenServiceConfig) -> Self {
        self.token = token;
        self
    }

    pub fn with_memory(mut self, memory: MemoryManagerConfig) -> Self {
        self.memory = memory;
        self
    }
}
