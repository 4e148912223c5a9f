//! A generic async retry envelope with exponential backoff and jitter.
//!
//! Callers supply a `classify` closure that turns a raw error into either
//! [`Outcome::Retry`] or a terminal failure; `retry_with_backoff` then
//! drives the attempt loop, sleeping between attempts through an injectable
//! clock so tests can run without wall-clock delay.

use std::future::Future;
use std::time::Duration;

pub enum Outcome<E> {
    Retry(E),
    Fatal(E),
}

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Sleep and RNG hooks injected so tests can run the full attempt loop
/// without incurring real delay or nondeterministic jitter.
pub trait Clock: Send + Sync {
    fn sleep<'a>(&'a self, d: Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
    fn random(&self) -> f64;
}

pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep<'a>(&'a self, d: Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep(d))
    }

    fn random(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Runs `f` up to `policy.max_attempts` times. `classify` decides whether a
/// returned error is retryable. `on_retry(attempt, delay, &err)` is invoked
/// before each wait.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut f: F,
    classify: C,
    mut on_retry: impl FnMut(u32, Duration, &E),
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(E) -> Outcome<E>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => match classify(e) {
                Outcome::Fatal(e) => return Err(e),
                Outcome::Retry(e) => {
                    if attempt >= policy.max_attempts {
                        return Err(e);
                    }
                    let jitter_factor = 1.0 + (clock.random() * 2.0 * policy.jitter - policy.jitter);
                    let sleep_for = delay.mul_f64(jitter_factor.max(0.0));
                    on_retry(attempt, sleep_for, &e);
                    clock.sleep(sleep_for).await;
                    delay = delay.mul_f64(policy.multiplier);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedClock;
    impl Clock for FixedClock {
        fn sleep<'a>(&'a self, _d: Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async {})
        }
        fn random(&self) -> f64 {
            0.5
        }
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let sleeps = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let result: Result<(), &str> = retry_with_backoff(
            &policy,
            &FixedClock,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            },
            Outcome::Retry,
            |_, _, _| {
                sleeps.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeps.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::default();
        let result = retry_with_backoff(
            &policy,
            &FixedClock,
            || async { Ok::<_, &str>(42) },
            Outcome::Retry,
            |_, _, _| panic!("should not retry"),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<(), &str> = retry_with_backoff(
            &policy,
            &FixedClock,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("validation error") }
            },
            Outcome::Fatal,
            |_, _, _| panic!("fatal errors do not retry"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
