use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::fetch::Upstream;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub used: usize,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest retained request leaves the window; zero
    /// when the ledger is empty.
    pub reset_in: u64,
}

/// Sliding-window request ledger per upstream. Every retained timestamp
/// satisfies `now - ts < window` after cleanup.
///
/// Quota is consumed at dispatch: a request is recorded before the upstream
/// call and never refunded, so retry storms against a failing upstream
/// cannot blow past the quota.
pub struct RateLimiter {
    window: Duration,
    ledgers: Mutex<HashMap<Upstream, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        RateLimiter {
            window,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    pub fn can_make_request(&self, upstream: Upstream, limit: u32) -> bool {
        self.can_make_request_at(upstream, limit, Instant::now())
    }

    fn can_make_request_at(&self, upstream: Upstream, limit: u32, now: Instant) -> bool {
        let mut ledgers = self.ledgers.lock().unwrap();
        let ledger = ledgers.entry(upstream).or_default();
        Self::cleanup(ledger, now, self.window);
        (ledger.len() as u32) < limit
    }

    pub fn record_request(&self, upstream: Upstream) {
        self.record_request_at(upstream, Instant::now());
    }

    fn record_request_at(&self, upstream: Upstream, now: Instant) {
        let mut ledgers = self.ledgers.lock().unwrap();
        let ledger = ledgers.entry(upstream).or_default();
        Self::cleanup(ledger, now, self.window);
        ledger.push_back(now);
    }

    /// Admission check and charge as one critical section: admits the
    /// request iff the upstream is under quota, recording it in the same
    /// lock acquisition so concurrent callers cannot race past the limit.
    pub fn admit(&self, upstream: Upstream, limit: u32) -> bool {
        self.admit_at(upstream, limit, Instant::now())
    }

    fn admit_at(&self, upstream: Upstream, limit: u32, now: Instant) -> bool {
        let mut ledgers = self.ledgers.lock().unwrap();
        let ledger = ledgers.entry(upstream).or_default();
        Self::cleanup(ledger, now, self.window);
        if (ledger.len() as u32) < limit {
            ledger.push_back(now);
            true
        } else {
            debug!(upstream = %upstream, limit, "quota denied");
            false
        }
    }

    pub fn usage(&self, upstream: Upstream, limit: u32) -> QuotaUsage {
        self.usage_at(upstream, limit, Instant::now())
    }

    fn usage_at(&self, upstream: Upstream, limit: u32, now: Instant) -> QuotaUsage {
        let mut ledgers = self.ledgers.lock().unwrap();
        let ledger = ledgers.entry(upstream).or_default();
        Self::cleanup(ledger, now, self.window);

        let used = ledger.len();
        let reset_in = ledger
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now).as_secs())
            .unwrap_or(0);

        QuotaUsage {
            used,
            limit,
            remaining: limit.saturating_sub(used as u32),
            reset_in,
        }
    }

    pub fn reset(&self) {
        self.ledgers.lock().unwrap().clear();
    }

    fn cleanup(ledger: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = ledger.front() {
            if now.saturating_duration_since(*oldest) >= window {
                ledger.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);
    const UPSTREAM: Upstream = Upstream::AlphaVantage;

    #[test]
    fn admits_up_to_the_limit_and_denies_the_next() {
        let limiter = RateLimiter::new(WINDOW);
        let base = Instant::now();

        for i in 0..5 {
            assert!(
                limiter.admit_at(UPSTREAM, 5, base + Duration::from_secs(i)),
                "request {i} should be admitted"
            );
        }
        assert!(!limiter.admit_at(UPSTREAM, 5, base + Duration::from_secs(5)));
    }

    #[test]
    fn window_slide_frees_quota() {
        let limiter = RateLimiter::new(WINDOW);
        let base = Instant::now();

        for _ in 0..5 {
            assert!(limiter.admit_at(UPSTREAM, 5, base));
        }
        assert!(!limiter.can_make_request_at(UPSTREAM, 5, base + Duration::from_secs(59)));
        // All five recorded at `base` leave the window together at base+60.
        assert!(limiter.can_make_request_at(UPSTREAM, 5, base + WINDOW));
    }

    #[test]
    fn check_then_record_matches_the_ordering_contract() {
        let limiter = RateLimiter::new(WINDOW);
        let base = Instant::now();

        assert!(limiter.can_make_request_at(UPSTREAM, 1, base));
        limiter.record_request_at(UPSTREAM, base);
        assert!(!limiter.can_make_request_at(UPSTREAM, 1, base + Duration::from_secs(1)));
    }

    #[test]
    fn usage_reports_the_window_state() {
        let limiter = RateLimiter::new(WINDOW);
        let base = Instant::now();

        let empty = limiter.usage_at(UPSTREAM, 5, base);
        assert_eq!(
            empty,
            QuotaUsage {
                used: 0,
                limit: 5,
                remaining: 5,
                reset_in: 0
            }
        );

        limiter.record_request_at(UPSTREAM, base);
        limiter.record_request_at(UPSTREAM, base + Duration::from_secs(10));

        let usage = limiter.usage_at(UPSTREAM, 5, base + Duration::from_secs(20));
        assert_eq!(usage.used, 2);
        assert_eq!(usage.remaining, 3);
        assert_eq!(usage.reset_in, 40);
    }

    #[test]
    fn upstreams_have_independent_ledgers() {
        let limiter = RateLimiter::new(WINDOW);
        let base = Instant::now();

        assert!(limiter.admit_at(Upstream::AlphaVantage, 1, base));
        assert!(!limiter.admit_at(Upstream::AlphaVantage, 1, base));
        assert!(limiter.admit_at(Upstream::CoinGecko, 1, base));
    }

    #[test]
    fn reset_clears_every_ledger() {
        let limiter = RateLimiter::new(WINDOW);
        let base = Instant::now();

        assert!(limiter.admit_at(UPSTREAM, 1, base));
        limiter.reset();
        assert!(limiter.admit_at(UPSTREAM, 1, base));
    }

    #[test]
    fn quota_ceiling_holds_over_a_staggered_sequence() {
        // No sliding window of length WINDOW may ever contain more than
        // `limit` admitted requests, however the admissions are spread out.
        let limiter = RateLimiter::new(WINDOW);
        let base = Instant::now();
        let mut admitted: Vec<Instant> = Vec::new();

        for step in 0..300u64 {
            let now = base + Duration::from_secs(step);
            if limiter.admit_at(UPSTREAM, 5, now) {
                admitted.push(now);
            }
        }

        for &start in &admitted {
            let in_window = admitted
                .iter()
                .filter(|&&ts| ts >= start && ts.duration_since(start) < WINDOW)
                .count();
            assert!(in_window <= 5, "window starting at {start:?} holds {in_window}");
        }
    }
}
