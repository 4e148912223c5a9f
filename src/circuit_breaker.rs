//! Three-state circuit breaker guarding a single unhealthy-prone dependency
//! (the LLM agent endpoint).

use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    pub fn as_metric_value(&self) -> i64 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
        }
    }
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    since: Option<std::time::Instant>,
}

/// A `threshold` of `0` disables the breaker: every check returns `Allow`.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    cooloff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Allow,
    Deny,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooloff: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                since: None,
            }),
            threshold,
            cooloff,
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Checks whether a call may proceed, transitioning `open -> half_open`
    /// when the cooloff has elapsed.
    pub fn check(&self) -> Permit {
        if self.threshold == 0 {
            return Permit::Allow;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => Permit::Allow,
            State::HalfOpen => Permit::Allow,
            State::Open => {
                let elapsed = inner.since.map(|s| s.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.cooloff {
                    inner.state = State::HalfOpen;
                    Permit::Allow
                } else {
                    Permit::Deny
                }
            }
        }
    }

    pub fn record_success(&self) {
        if self.threshold == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        inner.state = State::Closed;
        inner.since = None;
    }

    pub fn record_failure(&self) {
        if self.threshold == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.since = Some(std::time::Instant::now());
            }
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    inner.state = State::Open;
                    inner.since = Some(std::time::Instant::now());
                }
            }
            State::Open => {
                inner.since = Some(std::time::Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(50));
        assert_eq!(cb.check(), Permit::Allow);
        cb.record_failure();
        assert_eq!(cb.check(), Permit::Allow);
        cb.record_failure();
        assert_eq!(cb.check(), Permit::Deny);
    }

    #[test]
    fn half_open_after_cooloff_then_closes_on_success() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        assert_eq!(cb.check(), Permit::Deny);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.check(), Permit::Allow);
        assert_eq!(cb.state(), State::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.check(), Permit::Allow);
        cb.record_failure();
        assert_eq!(cb.check(), Permit::Deny);
    }

    #[test]
    fn zero_threshold_disables_breaker() {
        let cb = CircuitBreaker::new(0, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.check(), Permit::Allow);
    }
}
