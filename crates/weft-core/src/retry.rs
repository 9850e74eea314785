//! Retry backoff computation and cancellable sleeping.
//!
//! The executor owns the retry loop; this module supplies the pieces that
//! need to be deterministic under test: delay computation, the jitter
//! source, and a sleep that resolves on either the timer or cancellation.
//! Neither the clock nor the random source is read directly; both are
//! injected so tests can drive them.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use weft_types::workflow::RetryPolicy;

// ---------------------------------------------------------------------------
// Injected time and randomness
// ---------------------------------------------------------------------------

/// Source of sleeps for retry backoff.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// The real clock, backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Source of jitter factors in `[0.5, 1.5]`.
pub trait JitterSource: Send + Sync {
    fn factor(&self) -> f64;
}

/// Thread-local RNG jitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn factor(&self) -> f64 {
        rand::thread_rng().gen_range(0.5..=1.5)
    }
}

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Delay before retrying after `attempt` failed (1-based):
/// `base * multiplier^(attempt - 1)`, clamped to the optional cap.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let mut delay_ms = policy.backoff_base_ms as f64 * policy.backoff_multiplier.powi(exponent);
    if let Some(cap) = policy.max_backoff_ms {
        delay_ms = delay_ms.min(cap as f64);
    }
    Duration::from_millis(delay_ms as u64)
}

/// The backoff delay with the policy's jitter applied. Jitter is applied
/// after clamping, so a jittered delay may exceed the cap by up to 1.5x.
pub fn jittered_delay(policy: &RetryPolicy, attempt: u32, jitter: &impl JitterSource) -> Duration {
    let delay = backoff_delay(policy, attempt);
    if policy.jitter {
        delay.mul_f64(jitter.factor())
    } else {
        delay
    }
}

/// Whether another attempt is allowed after `attempt` failures.
pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
    attempt < policy.max_attempts
}

// ---------------------------------------------------------------------------
// Cancellable sleep
// ---------------------------------------------------------------------------

/// How a [`cancellable_sleep`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Cancelled,
}

/// Sleep for `duration`, returning early if `cancel` fires first.
pub async fn cancellable_sleep(
    clock: &impl Clock,
    cancel: &CancellationToken,
    duration: Duration,
) -> SleepOutcome {
    tokio::select! {
        _ = cancel.cancelled() => SleepOutcome::Cancelled,
        _ = clock.sleep(duration) => SleepOutcome::Elapsed,
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::testing::{FixedJitter, RecordingClock};
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: None,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let p = policy(5);
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&p, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&p, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_clamped_to_cap() {
        let mut p = policy(10);
        p.max_backoff_ms = Some(300);
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&p, 3), Duration::from_millis(300));
        assert_eq!(backoff_delay(&p, 9), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_scales_delay() {
        let mut p = policy(3);
        p.jitter = true;
        assert_eq!(
            jittered_delay(&p, 1, &FixedJitter(0.5)),
            Duration::from_millis(50)
        );
        assert_eq!(
            jittered_delay(&p, 1, &FixedJitter(1.5)),
            Duration::from_millis(150)
        );
    }

    #[test]
    fn test_jitter_disabled_ignores_source() {
        let p = policy(3);
        assert_eq!(
            jittered_delay(&p, 1, &FixedJitter(1.5)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_thread_rng_jitter_in_range() {
        let jitter = ThreadRngJitter;
        for _ in 0..100 {
            let f = jitter.factor();
            assert!((0.5..=1.5).contains(&f));
        }
    }

    #[test]
    fn test_should_retry_bound() {
        let p = policy(3);
        assert!(should_retry(&p, 1));
        assert!(should_retry(&p, 2));
        assert!(!should_retry(&p, 3));
        assert!(!should_retry(&policy(1), 1));
    }

    #[tokio::test]
    async fn test_cancellable_sleep_elapses() {
        let clock = RecordingClock::default();
        let cancel = CancellationToken::new();
        let outcome = cancellable_sleep(&clock, &cancel, Duration::from_millis(250)).await;
        assert_eq!(outcome, SleepOutcome::Elapsed);
        assert_eq!(
            clock.sleeps.lock().unwrap().as_slice(),
            &[Duration::from_millis(250)]
        );
    }

    #[tokio::test]
    async fn test_cancellable_sleep_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome =
            cancellable_sleep(&TokioClock, &cancel, Duration::from_secs(3600)).await;
        assert_eq!(outcome, SleepOutcome::Cancelled);
    }
}
