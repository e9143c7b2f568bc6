use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Per-source-IP admission limiter for login attempts.
///
/// An IP may start one login per configured gap. Entries expire by
/// time-of-last-touch and are pruned opportunistically so the map stays
/// bounded under address churn.
pub struct LoginRateLimiter {
    inner: Mutex<HashMap<IpAddr, Instant>>,
}

/// Prune when the map grows past this many entries.
const PRUNE_WATERMARK: usize = 4096;

impl LoginRateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the attempt is admitted. A `false` must kick the
    /// connection immediately, before any login work.
    pub fn check(&self, ip: IpAddr, gap: Duration) -> bool {
        if gap.is_zero() {
            return true;
        }
        let now = Instant::now();
        let mut map = self.inner.lock();
        if map.len() > PRUNE_WATERMARK {
            map.retain(|_, last| now.duration_since(*last) < gap);
        }
        match map.get(&ip) {
            Some(last) if now.duration_since(*last) < gap => false,
            _ => {
                map.insert(ip, now);
                true
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 5));

    #[test]
    fn first_attempt_is_admitted_second_is_not() {
        let limiter = LoginRateLimiter::new();
        let gap = Duration::from_secs(60);
        assert!(limiter.check(IP, gap));
        assert!(!limiter.check(IP, gap));
    }

    #[test]
    fn different_ips_do_not_interfere() {
        let limiter = LoginRateLimiter::new();
        let gap = Duration::from_secs(60);
        assert!(limiter.check(IP, gap));
        assert!(limiter.check("203.0.113.6".parse().unwrap(), gap));
    }

    #[test]
    fn zero_gap_disables_the_limiter() {
        let limiter = LoginRateLimiter::new();
        assert!(limiter.check(IP, Duration::ZERO));
        assert!(limiter.check(IP, Duration::ZERO));
        assert_eq!(limiter.len(), 0);
    }

    #[test]
    fn attempt_is_admitted_after_the_gap() {
        let limiter = LoginRateLimiter::new();
        let gap = Duration::from_millis(1);
        assert!(limiter.check(IP, gap));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.check(IP, gap));
    }
}
