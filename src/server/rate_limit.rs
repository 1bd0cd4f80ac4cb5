use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    allowance: f64,
    last: Instant,
}

/// Per-peer leaky bucket: capacity equals the configured per-second rate, so
/// a quiet peer can burst up to one second's worth of requests. A rate of 0
/// disables limiting.
pub struct RateLimiter {
    rate: u32,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, peer: IpAddr) -> bool {
        if self.rate == 0 {
            return true;
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(peer).or_insert(Bucket {
            allowance: self.rate as f64,
            last: now,
        });
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.last = now;
        bucket.allowance = (bucket.allowance + elapsed * self.rate as f64).min(self.rate as f64);
        if bucket.allowance >= 1.0 {
            bucket.allowance -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_capped_at_the_rate() {
        let limiter = RateLimiter::new(3);
        let peer: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(limiter.check(peer));
        assert!(limiter.check(peer));
        assert!(limiter.check(peer));
        assert!(!limiter.check(peer));
    }

    #[test]
    fn peers_are_limited_independently() {
        let limiter = RateLimiter::new(1);
        let a: IpAddr = "203.0.113.1".parse().unwrap();
        let b: IpAddr = "203.0.113.2".parse().unwrap();
        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }

    #[test]
    fn zero_rate_disables_limiting() {
        let limiter = RateLimiter::new(0);
        let peer: IpAddr = "203.0.113.3".parse().unwrap();
        for _ in 0..100 {
            assert!(limiter.check(peer));
        }
    }
}
