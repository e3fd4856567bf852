use std::time::Duration;

/// Delay between two requests for the same target, inside the 1-2 s band RFC 5227 suggests.
pub const RETRY_DELAY: Duration = Duration::from_millis(1500);

/// Requests sent after the first one before a query gives up.
pub const MAX_RETRIES: u32 = 3;

/// Knobs for the resolution engine. Build one with `ArpConfig::new()` and chain the setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpConfig {
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for ArpConfig {
    fn default() -> Self {
        ArpConfig {
            retry_delay: RETRY_DELAY,
            max_retries: MAX_RETRIES,
        }
    }
}

impl ArpConfig {
    pub fn new() -> Self {
        ArpConfig::default()
    }

    pub fn retry_delay(self, retry_delay: Duration) -> Self {
        ArpConfig {
            retry_delay,
            ..self
        }
    }

    pub fn max_retries(self, max_retries: u32) -> Self {
        ArpConfig {
            max_retries,
            ..self
        }
    }

    /// Time from the first request until an unanswered query fails.
    pub fn timeout(&self) -> Duration {
        self.retry_delay * self.max_retries.saturating_add(1)
    }
}
