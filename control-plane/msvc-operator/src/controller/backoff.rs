use std::time::Duration;

use scc::HashMap;

use super::errors::ErrorClass;
use crate::config::RetryConfig;

/// Per-key requeue delays. Conflicts come back quickly at a fixed delay;
/// everything else doubles from `base` up to `max`.
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    conflict_delay: Duration,
    attempts: HashMap<String, u32>,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration, conflict_delay: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            conflict_delay,
            attempts: HashMap::new(),
        }
    }

    pub fn next_delay(&self, key: &str, class: ErrorClass) -> Duration {
        let attempt = *self
            .attempts
            .entry(key.to_string())
            .and_modify(|n| *n = n.saturating_add(1))
            .or_insert(1)
            .get();
        if class == ErrorClass::Conflict {
            return self.conflict_delay;
        }
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn reset(&self, key: &str) {
        self.attempts.remove(key);
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.read(key, |_, n| *n).unwrap_or(0)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryBackoff {
    fn from(cfg: &RetryConfig) -> Self {
        Self::new(cfg.backoff_base(), cfg.backoff_max(), cfg.conflict_delay())
    }
}
