//! Configuration for the sync engine.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for sync cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the REST service (`https://api.example.com/v1`).
    pub base_url: String,
    /// Timeout applied to every remote call.
    pub request_timeout: Duration,
    /// Maximum records requested per pull page.
    pub page_size: u32,
    /// Maximum pages fetched per entity in one cycle.
    pub max_pages_per_pull: u32,
    /// Periodic sync interval while the app is foregrounded.
    pub sync_interval: Duration,
    /// Push retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default limits.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(30),
            page_size: 100,
            max_pages_per_pull: 20,
            sync_interval: Duration::from_secs(5 * 60),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the pull page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the page limit per entity per cycle.
    pub fn with_max_pages_per_pull(mut self, pages: u32) -> Self {
        self.max_pages_per_pull = pages.max(1);
        self
    }

    /// Sets the periodic sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Push retry and backoff policy.
///
/// `delay(r) = min(base_delay * 2^r, max_delay) + jitter`, where the jitter
/// is drawn deterministically per entry so a restart does not reshuffle it.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay unit for the exponential backoff.
    pub base_delay: Duration,
    /// Cap on the exponential part.
    pub max_delay: Duration,
    /// Upper bound of the added jitter.
    pub jitter: Duration,
    /// Retries allowed after the first attempt before an entry is discarded.
    pub max_retries: u32,
}

impl RetryConfig {
    /// Creates a configuration with the given retry ceiling.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter bound.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Exponential delay for an entry attempted `retry_count` times, capped.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus the entry's jitter for this retry count.
    pub fn backoff_with_jitter(&self, retry_count: u32, entry_id: &str) -> Duration {
        self.backoff(retry_count) + self.jitter_for(retry_count, entry_id)
    }

    /// Whether an entry attempted `retry_count` times must be discarded.
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }

    fn jitter_for(&self, retry_count: u32, entry_id: &str) -> Duration {
        let bound = self.jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        let mut hasher = DefaultHasher::new();
        entry_id.hash(&mut hasher);
        retry_count.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());
        Duration::from_millis(rng.gen_range(0..=bound))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5 * 60),
            jitter: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}
