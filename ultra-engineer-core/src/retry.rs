//! Classified retries with jittered exponential backoff.
//!
//! No tokio here: every sleep is a plain `std::thread::sleep` chopped into
//! small slices so the cancellation handle (`Cancel`) can be observed
//! promptly during a bounded grace period rather than blocking a full sleep.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation handle, shared between the scheduler, workers,
/// and every retry loop they drive.
#[derive(Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `dur`, checking for cancellation every 100ms so a caller
    /// never blocks past one short slice after cancellation is requested.
    /// Returns `true` if the sleep ran to completion, `false` if cut short
    /// by cancellation.
    pub fn sleep(&self, dur: Duration) -> bool {
        let slice = Duration::from_millis(100);
        let mut remaining = dur;
        while remaining > Duration::ZERO {
            if self.is_cancelled() {
                return false;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        !self.is_cancelled()
    }
}

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient — retry with exponential backoff.
    Retryable,
    /// Provider/agent signaled rate limiting — retry after a fixed delay.
    RateLimited,
    /// Will never succeed on retry — surface immediately.
    Permanent,
}

/// Error raised when a retry loop observes cancellation.
#[derive(Debug, Clone)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("operation cancelled")
    }
}
impl std::error::Error for Cancelled {}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// `<= 0` means unbounded attempts.
    pub max_attempts: i64,
    pub backoff_base: Duration,
    pub rate_limit_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            rate_limit_delay: Duration::from_secs(5 * 60),
        }
    }
}

const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Compute the exponential-backoff sleep duration for `attempt` (0-indexed),
/// including the `U(0, 0.25 * base * 2^attempt)` jitter term, capped at 5 minutes.
fn backoff_duration(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt);
    let nominal = base.saturating_mul(multiplier as u32);
    let jitter_max = nominal.mul_f64(0.25);
    let jitter = if jitter_max > Duration::ZERO {
        let jitter_secs = rand::thread_rng().gen_range(0.0..jitter_max.as_secs_f64());
        Duration::from_secs_f64(jitter_secs)
    } else {
        Duration::ZERO
    };
    (nominal + jitter).min(BACKOFF_CAP)
}

/// Run `op` under the retry policy in `opts`, classifying each error with
/// `classifier`. Returns `Ok(T)` on success, or the last error (or
/// `Cancelled`, converted into the error type via `E: From<Cancelled>`).
pub fn do_with_result<T, E, F, C>(
    cancel: &Cancel,
    opts: &Options,
    mut op: F,
    classifier: C,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    C: Fn(&E) -> ErrorKind,
    E: From<Cancelled>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                let kind = classifier(&e);
                match kind {
                    ErrorKind::Permanent => return Err(e),
                    ErrorKind::RateLimited => {
                        cancel.sleep(opts.rate_limit_delay);
                        if cancel.is_cancelled() {
                            return Err(Cancelled.into());
                        }
                    }
                    ErrorKind::Retryable => {
                        attempt += 1;
                        let exhausted =
                            opts.max_attempts > 0 && attempt >= opts.max_attempts as u32;
                        if exhausted {
                            return Err(e);
                        }
                        let delay = backoff_duration(opts.backoff_base, attempt - 1);
                        cancel.sleep(delay);
                        if cancel.is_cancelled() {
                            return Err(Cancelled.into());
                        }
                    }
                }
            }
        }
    }
}

/// Convenience wrapper for operations with no useful return value.
pub fn do_op<E, F, C>(cancel: &Cancel, opts: &Options, op: F, classifier: C) -> Result<(), E>
where
    F: FnMut() -> Result<(), E>,
    C: Fn(&E) -> ErrorKind,
    E: From<Cancelled>,
{
    do_with_result(cancel, opts, op, classifier)
}

/// Classifier for HTTP-like provider errors.
///
/// `status` is `None` for non-HTTP failures (timeouts, connection errors).
pub fn classify_http(status: Option<u16>, transient_hint: bool) -> ErrorKind {
    match status {
        Some(429) => ErrorKind::RateLimited,
        Some(408) => ErrorKind::Retryable,
        Some(501) => ErrorKind::Permanent,
        Some(s) if (500..600).contains(&s) => ErrorKind::Retryable,
        Some(s) if (400..500).contains(&s) => ErrorKind::Permanent,
        None if transient_hint => ErrorKind::Retryable,
        None => ErrorKind::Permanent,
        Some(_) => ErrorKind::Permanent,
    }
}

/// Classifier for agent (subprocess) errors — substring match over
/// the error message, case-insensitive.
pub fn classify_agent_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    const RATE_LIMIT_HINTS: [&str; 5] = [
        "rate limit",
        "429",
        "too many requests",
        "overloaded",
        "capacity",
    ];
    const RETRYABLE_HINTS: [&str; 6] = [
        "timeout",
        "deadline",
        "connection refused",
        "connection reset",
        "no such host",
        "5xx",
    ];
    if RATE_LIMIT_HINTS.iter().any(|h| lower.contains(h)) {
        return ErrorKind::RateLimited;
    }
    if RETRYABLE_HINTS.iter().any(|h| lower.contains(h)) {
        return ErrorKind::Retryable;
    }
    if let Some(code) = extract_http_status(&lower) {
        if (500..600).contains(&code) && code != 501 {
            return ErrorKind::Retryable;
        }
    }
    ErrorKind::Permanent
}

fn extract_http_status(lower: &str) -> Option<u16> {
    lower
        .split(|c: char| !c.is_ascii_digit())
        .find(|tok| tok.len() == 3)
        .and_then(|tok| tok.parse::<u16>().ok())
        .filter(|code| (100..600).contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    enum TestError {
        Cancelled,
        Flaky,
        Dead,
    }
    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            TestError::Cancelled
        }
    }

    fn fast_opts() -> Options {
        Options {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            rate_limit_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn permanent_error_makes_exactly_one_attempt() {
        let attempts = Cell::new(0);
        let cancel = Cancel::new();
        let result: Result<(), TestError> = do_with_result(
            &cancel,
            &fast_opts(),
            || {
                attempts.set(attempts.get() + 1);
                Err(TestError::Dead)
            },
            |_| ErrorKind::Permanent,
        );
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn retryable_error_makes_exactly_max_attempts() {
        let attempts = Cell::new(0);
        let cancel = Cancel::new();
        let opts = Options {
            max_attempts: 4,
            ..fast_opts()
        };
        let result: Result<(), TestError> = do_with_result(
            &cancel,
            &opts,
            || {
                attempts.set(attempts.get() + 1);
                Err(TestError::Flaky)
            },
            |_| ErrorKind::Retryable,
        );
        assert!(result.is_err());
        assert_eq!(attempts.get(), 4);
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let attempts = Cell::new(0);
        let cancel = Cancel::new();
        let result: Result<i32, TestError> = do_with_result(
            &cancel,
            &fast_opts(),
            || {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 3 {
                    Err(TestError::Flaky)
                } else {
                    Ok(42)
                }
            },
            |_| ErrorKind::Retryable,
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn unbounded_attempts_when_max_attempts_non_positive() {
        let attempts = Cell::new(0);
        let cancel = Cancel::new();
        let opts = Options {
            max_attempts: 0,
            ..fast_opts()
        };
        let result: Result<i32, TestError> = do_with_result(
            &cancel,
            &opts,
            || {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 10 {
                    Err(TestError::Flaky)
                } else {
                    Ok(1)
                }
            },
            |_| ErrorKind::Retryable,
        );
        assert!(result.is_ok());
        assert_eq!(attempts.get(), 10);
    }

    #[test]
    fn cancellation_before_first_attempt_returns_cancelled() {
        let cancel = Cancel::new();
        cancel.cancel();
        let attempts = Cell::new(0);
        let result: Result<(), TestError> = do_with_result(
            &cancel,
            &fast_opts(),
            || {
                attempts.set(attempts.get() + 1);
                Err(TestError::Flaky)
            },
            |_| ErrorKind::Retryable,
        );
        assert!(matches!(result, Err(TestError::Cancelled)));
        assert_eq!(attempts.get(), 0);
    }

    #[test]
    fn cancellation_during_backoff_sleep_stops_retries() {
        let cancel = Cancel::new();
        let opts = Options {
            max_attempts: 0,
            backoff_base: Duration::from_secs(10),
            rate_limit_delay: Duration::from_secs(10),
        };
        let cancel_clone = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel_clone.cancel();
        });
        let attempts = Cell::new(0);
        let result: Result<(), TestError> = do_with_result(
            &cancel,
            &opts,
            || {
                attempts.set(attempts.get() + 1);
                Err(TestError::Flaky)
            },
            |_| ErrorKind::Retryable,
        );
        handle.join().unwrap();
        assert!(matches!(result, Err(TestError::Cancelled)));
    }

    #[test]
    fn http_classifier_maps_status_codes() {
        assert_eq!(classify_http(Some(429), false), ErrorKind::RateLimited);
        assert_eq!(classify_http(Some(408), false), ErrorKind::Retryable);
        assert_eq!(classify_http(Some(500), false), ErrorKind::Retryable);
        assert_eq!(classify_http(Some(501), false), ErrorKind::Permanent);
        assert_eq!(classify_http(Some(503), false), ErrorKind::Retryable);
        assert_eq!(classify_http(Some(404), false), ErrorKind::Permanent);
        assert_eq!(classify_http(Some(401), false), ErrorKind::Permanent);
        assert_eq!(classify_http(None, true), ErrorKind::Retryable);
        assert_eq!(classify_http(None, false), ErrorKind::Permanent);
    }

    #[test]
    fn agent_classifier_matches_rate_limit_hints() {
        assert_eq!(
            classify_agent_message("Error: rate limit exceeded"),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify_agent_message("HTTP 429 too many requests"),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify_agent_message("server overloaded, try later"),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn agent_classifier_matches_retryable_hints() {
        assert_eq!(
            classify_agent_message("request timeout after 30s"),
            ErrorKind::Retryable
        );
        assert_eq!(
            classify_agent_message("connection refused by host"),
            ErrorKind::Retryable
        );
        assert_eq!(
            classify_agent_message("dial tcp: no such host"),
            ErrorKind::Retryable
        );
        assert_eq!(
            classify_agent_message("internal error 503"),
            ErrorKind::Retryable
        );
    }

    #[test]
    fn agent_classifier_defaults_to_permanent() {
        assert_eq!(
            classify_agent_message("invalid arguments supplied"),
            ErrorKind::Permanent
        );
        assert_eq!(
            classify_agent_message("not implemented (501)"),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn backoff_duration_is_capped() {
        let d = backoff_duration(Duration::from_secs(600), 10);
        assert!(d <= BACKOFF_CAP);
    }
}
