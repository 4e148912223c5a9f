//! Token-bucket rate limiting: one request-count bucket and one optional
//! body-byte bucket per client, refilled continuously and pruned under a
//! single lock no more often than `prune_interval`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Injectable so tests can advance time deterministically instead of
/// sleeping on the wall clock.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Duration;
}

pub struct MonotonicTime(std::time::Instant);

impl Default for MonotonicTime {
    fn default() -> Self {
        Self(std::time::Instant::now())
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> Duration {
        self.0.elapsed()
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Duration,
}

impl Bucket {
    fn refill(&mut self, now: Duration, rate_per_sec: f64, capacity: f64) {
        let elapsed = now.saturating_sub(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(capacity);
        self.last_refill = now;
    }
}

struct ClientState {
    requests: Bucket,
    bytes: Option<Bucket>,
    last_seen: Duration,
}

pub struct Decision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

pub struct RateLimiter {
    requests_per_second: f64,
    bucket_size: f64,
    body_bytes_per_second: Option<f64>,
    body_bytes_capacity: f64,
    idle_timeout: Duration,
    prune_interval: Duration,
    clients: Mutex<HashMap<String, ClientState>>,
    last_prune: Mutex<Duration>,
    time: Box<dyn TimeSource>,
}

impl RateLimiter {
    pub fn new(
        requests_per_minute: f64,
        bucket_size: f64,
        body_bytes_per_minute: Option<f64>,
        idle_timeout: Duration,
        prune_interval: Duration,
    ) -> Self {
        Self::with_time_source(
            requests_per_minute,
            bucket_size,
            body_bytes_per_minute,
            idle_timeout,
            prune_interval,
            Box::new(MonotonicTime::default()),
        )
    }

    pub fn with_time_source(
        requests_per_minute: f64,
        bucket_size: f64,
        body_bytes_per_minute: Option<f64>,
        idle_timeout: Duration,
        prune_interval: Duration,
        time: Box<dyn TimeSource>,
    ) -> Self {
        Self {
            requests_per_second: requests_per_minute / 60.0,
            bucket_size,
            body_bytes_per_second: body_bytes_per_minute.map(|v| v / 60.0),
            // One minute's worth of budget is the burst capacity for the
            // byte bucket, mirroring the request bucket's relation to
            // `requests_per_minute`.
            body_bytes_capacity: body_bytes_per_minute.unwrap_or(0.0),
            idle_timeout,
            prune_interval,
            clients: Mutex::new(HashMap::new()),
            last_prune: Mutex::new(Duration::ZERO),
            time,
        }
    }

    /// Checks and consumes one request token (and, if configured,
    /// `body_bytes` byte-tokens) for `client_id`.
    pub fn check(&self, client_id: &str, body_bytes: Option<u64>) -> Decision {
        let now = self.time.now();
        self.maybe_prune(now);

        let mut clients = self.clients.lock().unwrap();
        let state = clients.entry(client_id.to_string()).or_insert_with(|| ClientState {
            requests: Bucket {
                tokens: self.bucket_size,
                last_refill: now,
            },
            bytes: self.body_bytes_per_second.map(|_| Bucket {
                tokens: self.body_bytes_capacity,
                last_refill: now,
            }),
            last_seen: now,
        });
        state.last_seen = now;

        state.requests.refill(now, self.requests_per_second, self.bucket_size);

        if state.requests.tokens < 1.0 {
            let deficit = 1.0 - state.requests.tokens;
            let wait = deficit / self.requests_per_second.max(f64::MIN_POSITIVE);
            return Decision {
                allowed: false,
                retry_after: Some(Duration::from_secs_f64(wait.max(0.0))),
            };
        }

        if let (Some(bytes), Some(rate)) = (body_bytes, self.body_bytes_per_second) {
            if let Some(bucket) = state.bytes.as_mut() {
                bucket.refill(now, rate, self.body_bytes_capacity);
                if bucket.tokens < bytes as f64 {
                    let deficit = bytes as f64 - bucket.tokens;
                    let wait = deficit / rate.max(f64::MIN_POSITIVE);
                    return Decision {
                        allowed: false,
                        retry_after: Some(Duration::from_secs_f64(wait.max(0.0))),
                    };
                }
                bucket.tokens -= bytes as f64;
            }
        }

        state.requests.tokens -= 1.0;
        Decision {
            allowed: true,
            retry_after: None,
        }
    }

    fn maybe_prune(&self, now: Duration) {
        let mut last_prune = self.last_prune.lock().unwrap();
        if now.saturating_sub(*last_prune) < self.prune_interval {
            return;
        }
        *last_prune = now;
        let idle_timeout = self.idle_timeout;
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|_, state| now.saturating_sub(state.last_seen) < idle_timeout);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeTime(StdMutex<Duration>);
    impl TimeSource for FakeTime {
        fn now(&self) -> Duration {
            *self.0.lock().unwrap()
        }
    }
    impl FakeTime {
        fn advance(&self, d: Duration) {
            let mut t = self.0.lock().unwrap();
            *t += d;
        }
    }

    #[test]
    fn allows_requests_within_bucket_size() {
        let limiter = RateLimiter::new(60.0, 5.0, None, Duration::from_secs(300), Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check("client-a", None).allowed);
        }
        assert!(!limiter.check("client-a", None).allowed);
    }

    #[test]
    fn refills_over_time() {
        let fake = std::sync::Arc::new(FakeTime(StdMutex::new(Duration::ZERO)));
        let limiter = RateLimiter::with_time_source(
            60.0,
            1.0,
            None,
            Duration::from_secs(300),
            Duration::from_secs(60),
            Box::new(FakeTimeRef(fake.clone())),
        );
        assert!(limiter.check("client-a", None).allowed);
        assert!(!limiter.check("client-a", None).allowed);
        fake.advance(Duration::from_secs(1));
        assert!(limiter.check("client-a", None).allowed);
    }

    struct FakeTimeRef(std::sync::Arc<FakeTime>);
    impl TimeSource for FakeTimeRef {
        fn now(&self) -> Duration {
            self.0.now()
        }
    }

    #[test]
    fn separate_clients_have_separate_buckets() {
        let limiter = RateLimiter::new(60.0, 1.0, None, Duration::from_secs(300), Duration::from_secs(60));
        assert!(limiter.check("a", None).allowed);
        assert!(limiter.check("b", None).allowed);
        assert!(!limiter.check("a", None).allowed);
    }

    #[test]
    fn body_byte_bucket_throttles_independently() {
        let limiter = RateLimiter::new(
            6000.0,
            100.0,
            Some(60.0),
            Duration::from_secs(300),
            Duration::from_secs(60),
        );
        assert!(limiter.check("a", Some(50)).allowed);
        assert!(!limiter.check("a", Some(51)).allowed);
    }

    #[test]
    fn denied_decision_carries_retry_after() {
        let limiter = RateLimiter::new(60.0, 1.0, None, Duration::from_secs(300), Duration::from_secs(60));
        limiter.check("a", None);
        let decision = limiter.check("a", None);
        assert!(!decision.allowed);
        assert!(decision.retry_after.is_some());
    }
}
