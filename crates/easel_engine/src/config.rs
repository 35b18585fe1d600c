//! Configuration for the history manager and sync session.

use rand::Rng;
use std::time::Duration;

/// Default number of entries kept on the undo/redo stack.
pub const DEFAULT_MAX_ENTRIES: usize = 50;

/// Configuration for the undo/redo history.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum number of entries kept; the oldest entry is evicted first.
    pub max_entries: usize,
}

impl HistoryConfig {
    /// Creates a configuration with the given capacity.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

/// Configuration for a sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Client ID; a random one is generated when unset.
    pub client_id: Option<String>,
    /// Server base URL, used by HTTP transports.
    pub base_url: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Server queue length above which a full upload is requested.
    pub full_upload_threshold: Option<usize>,
    /// Retry configuration for pushes.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client_id: None,
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            full_upload_threshold: None,
            retry: RetryConfig::default(),
        }
    }

    /// Sets a fixed client ID.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requests a full upload once the server queue grows past `threshold`.
    pub fn with_full_upload_threshold(mut self, threshold: usize) -> Self {
        self.full_upload_threshold = Some(threshold);
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

/// Retry policy for pushes.
///
/// The wait before retry `n` is `base_delay * 2^(n-1)`, capped at
/// `max_delay`. With jitter on, the wait is drawn from the upper half of
/// that window.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first one. Never zero.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any wait.
    pub max_delay: Duration,
    /// Randomize waits so clients do not retry in lockstep.
    pub jitter: bool,
}

impl RetryConfig {
    /// Up to `max_attempts` attempts, starting at 100ms and capped at 5s.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Sets the wait before the first retry.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Caps every wait at `delay`.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Turns jitter on or off.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether a failed attempt (0-indexed) may be followed by another.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Wait before `attempt` (0-indexed). The first attempt never waits.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter && !capped.is_zero() {
            let half = capped / 2;
            half + capped.mul_f64(rand::thread_rng().gen_range(0.0..0.5))
        } else {
            capped
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
