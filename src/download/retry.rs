//! Retry logic with exponential backoff for failed download attempts.
//!
//! A failed engine call is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - network trouble, stalls, server errors
//! - [`FailureType::Permanent`] - unsupported or removed media
//! - [`FailureType::NeedsAuth`] - the site wants cookies or a login
//! - [`FailureType::RateLimited`] - the site is throttling requests
//!
//! [`RetryPolicy`] then decides whether another attempt is worth making and
//! how long to wait before it.
//!
//! # Example
//!
//! ```
//! use mediaqueue_core::download::{classify_error, RetryDecision, RetryPolicy};
//! use mediaqueue_core::engine::EngineError;
//!
//! let policy = RetryPolicy::default();
//! let error = EngineError::failed(Some(1), "ERROR: HTTP Error 503: Service Unavailable");
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::engine::EngineError;

/// Default maximum attempts per execution, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (30 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Default upper bound of the random jitter added to delays.
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// Engine messages that mean retrying cannot help.
const PERMANENT_MARKERS: &[&str] = &[
    "unsupported url",
    "video unavailable",
    "private video",
    "this video is not available",
    "has been removed",
    "is not a valid url",
    "requested format is not available",
    "no video formats found",
    "http error 404",
    "http error 410",
];

/// Engine messages that point at missing credentials.
const AUTH_MARKERS: &[&str] = &[
    "sign in to confirm",
    "login required",
    "members-only",
    "use --cookies",
    "http error 401",
    "http error 403",
];

const RATE_LIMIT_MARKERS: &[&str] = &["http error 429", "too many requests", "rate limit"];

/// Classification of download failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Failure that won't succeed regardless of retries.
    Permanent,
    /// Cookies or a login are required.
    NeedsAuth,
    /// The site is throttling; retried with backoff.
    RateLimited,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The attempt number about to be made (1-indexed).
        attempt: u32,
    },

    /// Give up.
    DoNotRetry {
        /// Human-readable reason why no retry is attempted.
        reason: String,
    },
}

/// Retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults the waits between the three attempts are roughly 1s and 2s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Disables random jitter, making delays deterministic.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "authentication required - configure a cookie file".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies an engine error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | `Spawn`, `InvalidConfig` | Transient (retried, then reported) |
/// | `Stalled`, `Timeout`, `Io`, `InvalidOutput` | Transient |
/// | `Failed` | by message, defaulting to Transient |
#[instrument(level = "debug")]
pub fn classify_error(error: &EngineError) -> FailureType {
    match error {
        EngineError::Spawn { .. }
        | EngineError::InvalidConfig(_)
        | EngineError::Stalled(_)
        | EngineError::Timeout(_)
        | EngineError::Io(_)
        | EngineError::InvalidOutput(_) => FailureType::Transient,
        EngineError::Failed { message, .. } => classify_message(message),
    }
}

fn classify_message(message: &str) -> FailureType {
    let lower = message.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if contains_any(RATE_LIMIT_MARKERS) {
        FailureType::RateLimited
    } else if contains_any(PERMANENT_MARKERS) {
        FailureType::Permanent
    } else if contains_any(AUTH_MARKERS) {
        FailureType::NeedsAuth
    } else {
        FailureType::Transient
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn failed(message: &str) -> EngineError {
        EngineError::failed(Some(1), message)
    }

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!((policy.backoff_multiplier - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts(), 1);
        assert_eq!(
            RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 2.0).max_attempts(),
            1
        );
    }

    #[test]
    fn test_delay_without_jitter_is_exact() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1), 2.0)
            .without_jitter();
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_respects_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(4), 2.0)
            .without_jitter();
        assert_eq!(policy.calculate_delay(8), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_should_retry_transient_until_exhausted() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry {
                delay: Duration::from_secs(1),
                attempt: 2
            }
        );
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 3),
            RetryDecision::DoNotRetry { reason } if reason.contains("exhausted")
        ));
    }

    #[test]
    fn test_should_retry_permanent_and_auth_stop_immediately() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.should_retry(FailureType::Permanent, 1),
            RetryDecision::DoNotRetry { .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::NeedsAuth, 1),
            RetryDecision::DoNotRetry { reason } if reason.contains("cookie")
        ));
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_classify_permanent_messages() {
        for message in [
            "ERROR: [generic] Unsupported URL: https://example.com",
            "ERROR: [youtube] abc: Video unavailable",
            "ERROR: [youtube] abc: Private video. Sign in if you've been granted access",
            "ERROR: unable to download video data: HTTP Error 404: Not Found",
        ] {
            assert_eq!(classify_error(&failed(message)), FailureType::Permanent, "{message}");
        }
    }

    #[test]
    fn test_classify_auth_messages() {
        assert_eq!(
            classify_error(&failed("ERROR: Sign in to confirm you're not a bot")),
            FailureType::NeedsAuth
        );
        assert_eq!(
            classify_error(&failed("ERROR: HTTP Error 403: Forbidden")),
            FailureType::NeedsAuth
        );
    }

    #[test]
    fn test_classify_rate_limited() {
        assert_eq!(
            classify_error(&failed("ERROR: HTTP Error 429: Too Many Requests")),
            FailureType::RateLimited
        );
    }

    #[test]
    fn test_classify_unknown_failure_is_transient() {
        assert_eq!(
            classify_error(&failed("ERROR: Connection reset by peer")),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&EngineError::Stalled(Duration::from_secs(300))),
            FailureType::Transient
        );
    }

    #[test]
    fn test_classify_config_and_spawn_follow_retry_path() {
        assert_eq!(
            classify_error(&EngineError::InvalidConfig("format expression is empty".into())),
            FailureType::Transient
        );
        let spawn = EngineError::Spawn {
            program: "yt-dlp".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(classify_error(&spawn), FailureType::Transient);
    }
}
