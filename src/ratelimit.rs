//! Per-session token bucket. Owned by the `Session` value,
//! never shared — dropped on disconnect, no cross-session contention.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct RateBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl RateBucket {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Attempt to spend one token. Returns `true` if the request may
    /// proceed, `false` if the bucket is depleted and the caller should
    /// reject with a rate-limited error.
    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn consumes_up_to_capacity_then_blocks() {
        let mut bucket = RateBucket::new(3.0, 1.0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = RateBucket::new(1.0, 1000.0);
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        sleep(Duration::from_millis(5));
        assert!(bucket.try_consume());
    }

    #[test]
    fn never_exceeds_max_tokens() {
        let mut bucket = RateBucket::new(2.0, 1000.0);
        sleep(Duration::from_millis(50));
        bucket.refill();
        assert!(bucket.tokens <= 2.0);
    }
}
