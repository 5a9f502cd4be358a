//! Error-classified retry policy with exponential backoff
//!
//! The policy answers three questions for a failed transfer: may it be
//! retried, how long to wait first, and when to give up. The delay is a pure
//! function of `(code, attempt)` plus a single jitter draw, which keeps it
//! independently testable via [`backoff_delay`].
//!
//! # Backoff
//!
//! ```text
//! delay = initial_delay * 2^(attempt - 1) * (1 ± jitter)
//!
//! RATE_LIMIT_EXCEEDED   floor   5s
//! NETWORK_ERROR         ceiling 10s
//! CONNECTION_REFUSED    x0.75,  ceiling 8s
//! TIMEOUT               x1.5,   ceiling 15s
//! CHECKSUM_MISMATCH     floor   2s
//! CORRUPTED_DATA        floor   3s
//! any code              ceiling 30s
//! ```

use crate::error::{ErrorCode, TransferError};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound for any retry delay, regardless of code
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Default multiplicative jitter (±25%)
pub const DEFAULT_JITTER_RATIO: f64 = 0.25;

/// Default number of attempts (including the first one)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Returns true if `code` may be retried after `attempt_count` failed attempts
///
/// `attempt_count < max_attempts` and the code is auto-retry eligible.
#[must_use]
pub fn should_retry(code: ErrorCode, attempt_count: u32, max_attempts: u32) -> bool {
    attempt_count < max_attempts && code.is_auto_retryable()
}

/// Compute the backoff delay for a given code and attempt
///
/// `jitter_draw` is the multiplicative jitter in `[-ratio, ratio]`; callers
/// that want deterministic output pass `0.0`. Attempts are 1-based; attempt
/// `0` is treated as the first attempt.
#[must_use]
pub fn backoff_delay(
    code: ErrorCode,
    attempt_count: u32,
    initial_delay: Duration,
    jitter_draw: f64,
) -> Duration {
    let exponent = attempt_count.max(1).saturating_sub(1).min(30) as i32;
    let base = initial_delay.as_millis() as f64 * 2f64.powi(exponent);
    let jittered = base * (1.0 + jitter_draw);

    let clamped = match code {
        ErrorCode::RateLimitExceeded => jittered.max(5_000.0),
        ErrorCode::NetworkError => jittered.min(10_000.0),
        ErrorCode::ConnectionRefused => (jittered * 0.75).min(8_000.0),
        ErrorCode::Timeout => (jittered * 1.5).min(15_000.0),
        ErrorCode::ChecksumMismatch => jittered.max(2_000.0),
        ErrorCode::CorruptedData => jittered.max(3_000.0),
        _ => jittered,
    };

    let capped = clamped.clamp(0.0, MAX_RETRY_DELAY.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Add random jitter to prevent thundering herd
    pub jitter: bool,

    /// Jitter magnitude as a fraction of the delay
    pub jitter_ratio: f64,

    /// Also retry data integrity failures (checksum/corruption)
    pub retry_integrity_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(1000),
            jitter: true,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            retry_integrity_errors: false,
        }
    }
}

impl RetryConfig {
    /// Preset for network-sensitive operations: more attempts, faster start
    #[must_use]
    pub fn network() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            ..Default::default()
        }
    }

    /// Preset for checksum verification: at most one retry, no jitter
    #[must_use]
    pub fn checksum() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1000),
            jitter: false,
            retry_integrity_errors: true,
            ..Default::default()
        }
    }

    /// Preset for local file operations
    #[must_use]
    pub fn file_operations() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            jitter: false,
            ..Default::default()
        }
    }

    /// Single attempt, never retried
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            jitter: false,
            ..Default::default()
        }
    }

    /// Override the attempt budget
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Retry policy: classification plus backoff for one call site
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from a configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Maximum number of attempts, including the first one
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Returns true if the code may be retried after `attempt_count` failures
    #[must_use]
    pub fn should_retry(&self, code: ErrorCode, attempt_count: u32) -> bool {
        if should_retry(code, attempt_count, self.config.max_attempts) {
            return true;
        }
        self.config.retry_integrity_errors
            && attempt_count < self.config.max_attempts
            && matches!(code, ErrorCode::ChecksumMismatch | ErrorCode::CorruptedData)
    }

    /// Compute the delay before the next attempt, drawing jitter if enabled
    #[must_use]
    pub fn compute_delay(&self, code: ErrorCode, attempt_count: u32) -> Duration {
        let ratio = self.config.jitter_ratio.abs();
        let draw = if self.config.jitter && ratio > 0.0 {
            rand::thread_rng().gen_range(-ratio..=ratio)
        } else {
            0.0
        };
        backoff_delay(code, attempt_count, self.config.initial_delay, draw)
    }
}

/// Per-transfer attempt counters
///
/// Keyed by transfer id. A counter is reset when a transfer starts and
/// cleared once the transfer leaves the retryable error state.
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: HashMap<String, u32>,
}

impl RetryTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the counter for a freshly started transfer
    pub fn reset(&mut self, transfer_id: &str) {
        self.attempts.insert(transfer_id.to_string(), 0);
    }

    /// Carry an attempt count over to a transfer started by a retry
    pub fn carry_over(&mut self, transfer_id: &str, attempts: u32) {
        self.attempts.insert(transfer_id.to_string(), attempts);
    }

    /// Record a failed attempt, returning the updated count
    pub fn record_failure(&mut self, transfer_id: &str) -> u32 {
        let count = self.attempts.entry(transfer_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Failed attempts so far
    #[must_use]
    pub fn attempts(&self, transfer_id: &str) -> u32 {
        self.attempts.get(transfer_id).copied().unwrap_or(0)
    }

    /// Forget a transfer
    pub fn clear(&mut self, transfer_id: &str) {
        self.attempts.remove(transfer_id);
    }

    /// Number of tracked transfers
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Returns true if nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

/// Generic retry wrapper for async operations
///
/// On failure the error is classified into a [`TransferError`], the policy
/// decides whether to retry, an optional caller predicate may override that
/// decision, and the operation is re-invoked after the computed delay. The
/// attempt budget is never exceeded, whatever the predicate says.
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    /// Create a handler from a configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            policy: RetryPolicy::new(config),
        }
    }

    /// Handler for network-sensitive operations
    #[must_use]
    pub fn for_network_operations() -> Self {
        Self::new(RetryConfig::network())
    }

    /// Handler for checksum verification
    #[must_use]
    pub fn for_checksum_verification() -> Self {
        Self::new(RetryConfig::checksum())
    }

    /// Handler for local file operations
    #[must_use]
    pub fn for_file_operations() -> Self {
        Self::new(RetryConfig::file_operations())
    }

    /// Underlying policy
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, retrying according to the policy
    pub async fn retry<F, Fut, T, E>(&self, operation: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<TransferError>,
    {
        self.retry_with(operation, |_, _, decision| decision).await
    }

    /// Run `operation`, letting `should_retry` override the policy decision
    ///
    /// The predicate receives the classified error, the number of attempts
    /// made so far and the policy's own decision.
    pub async fn retry_with<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<TransferError>,
        P: Fn(&TransferError, u32, bool) -> bool,
    {
        let max_attempts = self.policy.max_attempts().max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let err: TransferError = err.into();
                    let decision = self.policy.should_retry(err.code, attempt);
                    let retry = attempt < max_attempts && should_retry(&err, attempt, decision);

                    if !retry {
                        error!(
                            code = %err.code,
                            "Operation failed after {} attempts: {}",
                            attempt,
                            err
                        );
                        if let Some(suggestion) = err.code.suggestion() {
                            debug!("Recovery suggestion: {}", suggestion);
                        }
                        return Err(err);
                    }

                    let delay = self.policy.compute_delay(err.code, attempt);
                    warn!(
                        code = %err.code,
                        "Operation failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempt,
                        max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SECOND: Duration = Duration::from_millis(1000);

    #[test]
    fn test_should_retry_table() {
        assert!(!should_retry(ErrorCode::FileNotFound, 1, 3));
        assert!(should_retry(ErrorCode::NetworkError, 1, 3));
        assert!(!should_retry(ErrorCode::NetworkError, 3, 3));
        assert!(should_retry(ErrorCode::RateLimitExceeded, 2, 3));
        assert!(!should_retry(ErrorCode::ChecksumMismatch, 1, 3));
    }

    #[test]
    fn test_backoff_exponential_without_jitter() {
        let code = ErrorCode::UnknownError;
        assert_eq!(backoff_delay(code, 1, SECOND, 0.0).as_millis(), 1000);
        assert_eq!(backoff_delay(code, 2, SECOND, 0.0).as_millis(), 2000);
        assert_eq!(backoff_delay(code, 3, SECOND, 0.0).as_millis(), 4000);
        // Attempt 0 behaves like attempt 1
        assert_eq!(backoff_delay(code, 0, SECOND, 0.0).as_millis(), 1000);
    }

    #[test]
    fn test_backoff_code_clamps() {
        assert_eq!(
            backoff_delay(ErrorCode::RateLimitExceeded, 1, SECOND, 0.0).as_millis(),
            5000
        );
        assert_eq!(
            backoff_delay(ErrorCode::NetworkError, 6, SECOND, 0.0).as_millis(),
            10_000
        );
        assert_eq!(
            backoff_delay(ErrorCode::ConnectionRefused, 1, SECOND, 0.0).as_millis(),
            750
        );
        assert_eq!(
            backoff_delay(ErrorCode::ConnectionRefused, 5, SECOND, 0.0).as_millis(),
            8000
        );
        assert_eq!(
            backoff_delay(ErrorCode::Timeout, 2, SECOND, 0.0).as_millis(),
            3000
        );
        assert_eq!(
            backoff_delay(ErrorCode::Timeout, 5, SECOND, 0.0).as_millis(),
            15_000
        );
        assert_eq!(
            backoff_delay(ErrorCode::ChecksumMismatch, 1, SECOND, 0.0).as_millis(),
            2000
        );
        assert_eq!(
            backoff_delay(ErrorCode::CorruptedData, 1, SECOND, 0.0).as_millis(),
            3000
        );
    }

    #[test]
    fn test_backoff_global_ceiling() {
        for code in ErrorCode::ALL {
            for attempt in [1, 5, 10, 40, u32::MAX] {
                let delay = backoff_delay(code, attempt, SECOND, 0.25);
                assert!(delay <= MAX_RETRY_DELAY, "{code} attempt {attempt}");
            }
        }
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::new(RetryConfig::default());
        for _ in 0..100 {
            let delay = policy.compute_delay(ErrorCode::UnknownError, 2).as_millis();
            assert!((1500..=2500).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_checksum_preset_has_no_jitter() {
        let policy = RetryPolicy::new(RetryConfig::checksum());
        let first = policy.compute_delay(ErrorCode::ChecksumMismatch, 1);
        for _ in 0..10 {
            assert_eq!(policy.compute_delay(ErrorCode::ChecksumMismatch, 1), first);
        }
        assert!(policy.should_retry(ErrorCode::ChecksumMismatch, 1));
        assert!(!policy.should_retry(ErrorCode::ChecksumMismatch, 2));
    }

    #[test]
    fn test_tracker_lifecycle() {
        let mut tracker = RetryTracker::new();
        tracker.reset("t1");
        assert_eq!(tracker.attempts("t1"), 0);
        assert_eq!(tracker.record_failure("t1"), 1);
        assert_eq!(tracker.record_failure("t1"), 2);

        tracker.carry_over("t2", 2);
        assert_eq!(tracker.record_failure("t2"), 3);

        tracker.clear("t1");
        assert_eq!(tracker.attempts("t1"), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = RetryHandler::default();

        let counter = Arc::clone(&calls);
        let result = handler
            .retry(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(TransferError::new(ErrorCode::NetworkError, "flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = RetryHandler::default();

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = handler
            .retry(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(TransferError::new(ErrorCode::Timeout, format!("attempt {n}")))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert_eq!(err.message, "attempt 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_does_not_retry_fatal_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = RetryHandler::for_network_operations();

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = handler
            .retry(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")) }
            })
            .await;

        assert_eq!(result.unwrap_err().code, ErrorCode::FileNotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_overrides_decision() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = RetryHandler::new(RetryConfig::default().with_max_attempts(4));

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = handler
            .retry_with(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransferError::from_code(ErrorCode::NetworkError)) }
                },
                |_, attempt, _| attempt < 2,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Forcing a retry never exceeds the attempt budget
        calls.store(0, Ordering::SeqCst);
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = handler
            .retry_with(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransferError::from_code(ErrorCode::FileError)) }
                },
                |_, _, _| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
