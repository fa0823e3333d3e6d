//! Fixed-window request budget per client identity. Requests beyond the
//! budget are rejected immediately, never queued. Buckets live in memory only;
//! expired ones are swept once per window, or early when the map grows past
//! its cap.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("rate limit exceeded for {identity}, retry in {}s", retry_after.as_secs())]
pub struct RateLimitExceeded {
    pub identity: String,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct RateLimitBucket {
    count: u32,
    window_start: Instant,
}

/// Identities tracked before an early sweep of expired buckets.
pub const DEFAULT_MAX_TRACKED: usize = 10_000;

#[derive(Debug)]
pub struct RateLimiter {
    budget: u32,
    window: Duration,
    max_tracked: usize,
    buckets: DashMap<String, RateLimitBucket>,
    last_sweep: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            budget,
            window,
            max_tracked: DEFAULT_MAX_TRACKED,
            buckets: DashMap::new(),
            last_sweep: Mutex::new(None),
        }
    }

    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked.max(1);
        self
    }

    /// `budget` requests per rolling minute.
    pub fn per_minute(budget: u32) -> Self {
        Self::new(budget, Duration::from_secs(60))
    }

    pub fn check(&self, identity: &str) -> Result<(), RateLimitExceeded> {
        self.check_at(identity, Instant::now())
    }

    pub fn check_at(&self, identity: &str, now: Instant) -> Result<(), RateLimitExceeded> {
        self.maybe_sweep(now);
        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert(RateLimitBucket { count: 0, window_start: now });

        let elapsed = now.saturating_duration_since(bucket.window_start);
        if elapsed >= self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        if bucket.count >= self.budget {
            return Err(RateLimitExceeded {
                identity: identity.to_string(),
                retry_after: self.window.saturating_sub(elapsed),
            });
        }
        bucket.count += 1;
        Ok(())
    }

    /// Drops buckets whose window ended. Runs at most once per window unless
    /// the map is over its cap.
    fn maybe_sweep(&self, now: Instant) {
        let over_cap = self.buckets.len() >= self.max_tracked;
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            let due = last.is_none_or(|at| now.saturating_duration_since(at) >= self.window);
            if !due && !over_cap {
                return;
            }
            *last = Some(now);
        }
        let window = self.window;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.window_start) < window);
    }

    /// Number of identities with a bucket, expired or not.
    pub fn tracked_identities(&self) -> usize {
        self.buckets.len()
    }
}
