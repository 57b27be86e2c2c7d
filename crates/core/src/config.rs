//! Grid runtime configuration with environment overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const DEFAULT_MAX_STORED_PAGES: usize = 5;
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Per-grid configuration. Defaults match the reference behavior
/// (20 rows per page, 5 retained pages, 15 s request timeout).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GridConfig {
    pub page_size: usize,
    pub max_stored_pages: usize,
    pub request_timeout_ms: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_stored_pages: DEFAULT_MAX_STORED_PAGES,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl GridConfig {
    /// Defaults overridden by `TAVOLA_PAGE_SIZE`, `TAVOLA_MAX_STORED_PAGES`
    /// and `TAVOLA_TIMEOUT_MS` when set and parseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            page_size: env_usize("TAVOLA_PAGE_SIZE").unwrap_or(d.page_size).max(1),
            max_stored_pages: env_usize("TAVOLA_MAX_STORED_PAGES")
                .unwrap_or(d.max_stored_pages)
                .max(1),
            request_timeout_ms: env_u64("TAVOLA_TIMEOUT_MS").unwrap_or(d.request_timeout_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behavior() {
        let c = GridConfig::default();
        assert_eq!(c.page_size, 20);
        assert_eq!(c.max_stored_pages, 5);
        assert_eq!(c.request_timeout(), Duration::from_millis(15_000));
    }
}
