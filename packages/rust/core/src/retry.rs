//! Backoff policy for failed stage attempts.

use std::time::Duration;

use outreach_shared::{RetryConfig, StageError};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Make the unit available again after this delay.
    Retry(Duration),
    /// Stop retrying and record the stage as FAILED.
    GiveUp,
}

/// Attempt budget for this kind of failure.
pub fn max_attempts(config: &RetryConfig, error: &StageError) -> u32 {
    match error {
        StageError::Permanent(_) => 1,
        StageError::Transient(_) => config.max_attempts,
        StageError::ResourceExhausted { .. } => config.rate_limit_max_attempts,
    }
}

/// Delay before attempt `failed_attempts + 1`.
///
/// `base * 2^(n-1)`, capped at `max_delay`. Rate limits use their own, longer
/// base and honor a server-provided `Retry-After` up to the same cap.
pub fn backoff(config: &RetryConfig, error: &StageError, failed_attempts: u32) -> Duration {
    let exponent = failed_attempts.saturating_sub(1).min(16);
    match error {
        StageError::ResourceExhausted { retry_after, .. } => {
            let cap = config.max_delay.max(config.rate_limit_base_delay);
            retry_after
                .unwrap_or_else(|| {
                    config
                        .rate_limit_base_delay
                        .saturating_mul(2u32.pow(exponent))
                })
                .min(cap)
        }
        _ => config
            .base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(config.max_delay),
    }
}

/// Decide the next step once `failed_attempts` (already persisted) is known.
pub fn next_step(config: &RetryConfig, error: &StageError, failed_attempts: u32) -> RetryStep {
    if !error.is_retryable() || failed_attempts >= max_attempts(config, error) {
        RetryStep::GiveUp
    } else {
        RetryStep::Retry(backoff(config, error, failed_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            rate_limit_max_attempts: 2,
            rate_limit_base_delay: Duration::from_millis(15_000),
        }
    }

    #[test]
    fn transient_backoff_doubles_and_caps() {
        let c = config();
        let e = StageError::transient("timeout");
        assert_eq!(backoff(&c, &e, 1), Duration::from_millis(1000));
        assert_eq!(backoff(&c, &e, 2), Duration::from_millis(2000));
        assert_eq!(backoff(&c, &e, 3), Duration::from_millis(4000));
        assert_eq!(backoff(&c, &e, 10), Duration::from_millis(30_000));
    }

    #[test]
    fn transient_gives_up_at_max_attempts() {
        let c = config();
        let e = StageError::transient("reset");
        assert_eq!(next_step(&c, &e, 1), RetryStep::Retry(Duration::from_millis(1000)));
        assert_eq!(next_step(&c, &e, 2), RetryStep::Retry(Duration::from_millis(2000)));
        assert_eq!(next_step(&c, &e, 3), RetryStep::GiveUp);
    }

    #[test]
    fn permanent_never_retries() {
        let c = config();
        assert_eq!(
            next_step(&c, &StageError::permanent("malformed URL"), 1),
            RetryStep::GiveUp
        );
    }

    #[test]
    fn rate_limits_use_separate_schedule() {
        let c = config();
        let e = StageError::rate_limited("429", None);
        assert_eq!(next_step(&c, &e, 1), RetryStep::Retry(Duration::from_millis(15_000)));
        assert_eq!(next_step(&c, &e, 2), RetryStep::GiveUp);

        let hinted = StageError::rate_limited("429", Some(Duration::from_secs(42)));
        assert_eq!(backoff(&c, &hinted, 1), Duration::from_secs(30));
        let short = StageError::rate_limited("429", Some(Duration::from_secs(7)));
        assert_eq!(backoff(&c, &short, 1), Duration::from_secs(7));
    }

    #[test]
    fn retry_after_is_capped() {
        let c = config();
        let day = StageError::rate_limited("429", Some(Duration::from_secs(86_400)));
        assert_eq!(next_step(&c, &day, 1), RetryStep::Retry(Duration::from_millis(30_000)));

        let huge = StageError::rate_limited("429", Some(Duration::MAX));
        assert_eq!(backoff(&c, &huge, 1), Duration::from_millis(30_000));
    }
}
