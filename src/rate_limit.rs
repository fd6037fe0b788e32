//! Abuse guards, both in memory and process local:
//! - [`LoginAttemptTracker`]: per-email login lockout.
//! - [`RequestRateLimiter`]: per-IP token bucket over the whole API.

use chrono::{DateTime, Duration, Utc};
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Mutex;

pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const LOCKOUT_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    last_failed: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct LoginAttemptTracker {
    attempts: Mutex<HashMap<String, Attempts>>,
}

fn key(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

impl LoginAttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds left on the lockout, or `None` when a login may proceed.
    pub fn check(&self, email: &str) -> Option<i64> {
        self.check_at(email, Utc::now())
    }

    pub fn check_at(&self, email: &str, now: DateTime<Utc>) -> Option<i64> {
        let attempts = self.attempts.lock().ok()?;
        let entry = attempts.get(&key(email))?;
        if entry.count < MAX_FAILED_ATTEMPTS {
            return None;
        }
        let elapsed = (now - entry.last_failed).num_seconds();
        if elapsed >= LOCKOUT_WINDOW_SECS {
            return None;
        }
        Some((LOCKOUT_WINDOW_SECS - elapsed).max(1))
    }

    pub fn record_failure(&self, email: &str) {
        self.record_failure_at(email, Utc::now());
    }

    /// A failure after the window has lapsed starts a fresh count.
    pub fn record_failure_at(&self, email: &str, now: DateTime<Utc>) {
        let Ok(mut attempts) = self.attempts.lock() else {
            return;
        };
        let window = Duration::seconds(LOCKOUT_WINDOW_SECS);
        // entries past the window carry no lockout
        attempts.retain(|_, a| now - a.last_failed < window);
        let entry = attempts.entry(key(email)).or_insert(Attempts {
            count: 0,
            last_failed: now,
        });
        if now - entry.last_failed >= window {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last_failed = now;
        if entry.count >= MAX_FAILED_ATTEMPTS {
            tracing::warn!(email = %key(email), count = entry.count, "login locked out");
        }
    }

    pub fn reset(&self, email: &str) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.remove(&key(email));
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or(0)
    }
}

pub const REQUESTS_PER_SECOND: u32 = 5;
pub const REQUEST_BURST: u32 = 20;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Token bucket per client IP.
pub struct RequestRateLimiter {
    limiter: KeyedLimiter,
}

impl RequestRateLimiter {
    /// Zero values fall back to one request per second with no extra burst.
    pub fn new(per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        Self {
            limiter: RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst)),
        }
    }

    /// `Err` carries the whole seconds `ip` should wait before retrying.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        self.limiter.check_key(&ip).map_err(|not_until| {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1)
        })
    }

    /// Forget buckets that have refilled. Returns how many remain.
    pub fn purge_idle(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.len()
    }
}

impl Default for RequestRateLimiter {
    fn default() -> Self {
        Self::new(REQUESTS_PER_SECOND, REQUEST_BURST)
    }
}

impl std::fmt::Debug for RequestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRateLimiter")
            .field("tracked", &self.limiter.len())
            .finish()
    }
}
