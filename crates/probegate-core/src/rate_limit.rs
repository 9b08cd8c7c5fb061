//! Token-bucket admission control.
//!
//! One [`Bucket`] per key, created lazily. The key map is behind an `RwLock`
//! that is only write-locked to insert or prune; each bucket has its own
//! mutex, so admissions for different keys never contend.
//!
//! Denial is immediate. Callers surface it as a throttling signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::{BucketConfig, RateLimitConfig};
use crate::model::CallerKey;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Zero when allowed.
    pub retry_after: Duration,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Invariant: `0 <= tokens <= capacity` at every observation point.
#[derive(Debug, Clone)]
pub struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// New buckets start full.
    pub fn new(config: &BucketConfig, now: Instant) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            capacity,
            refill_per_sec: config.refill_per_sec,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    pub fn try_take(&mut self, now: Instant) -> Decision {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Decision::allow()
        } else {
            let wait = (1.0 - self.tokens) / self.refill_per_sec;
            Decision::deny(Duration::from_secs_f64(wait.max(0.0)))
        }
    }

    /// Return a token taken by a request that was denied further down.
    fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn is_full_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= self.capacity
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: BucketConfig,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn admit(&self, key: &str) -> Decision {
        self.admit_at(key, Instant::now())
    }

    pub fn admit_at(&self, key: &str, now: Instant) -> Decision {
        let bucket = self.bucket(key, now);
        let mut guard = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        guard.try_take(now)
    }

    fn refund(&self, key: &str) {
        let existing = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        if let Some(bucket) = existing {
            bucket.lock().unwrap_or_else(PoisonError::into_inner).refund();
        }
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<Bucket>> {
        if let Some(b) = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return b.clone();
        }
        let mut map = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(&self.config, now))))
            .clone()
    }

    /// Current token count for `key`, if a bucket exists.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let map = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key)
            .map(|b| b.lock().unwrap_or_else(PoisonError::into_inner).tokens())
    }

    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop buckets that have refilled to capacity. A full bucket behaves
    /// exactly like a freshly created one, so this is unobservable to callers.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut map = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, bucket| {
            // Someone else holds the bucket right now: keep it.
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            !bucket
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_full_at(now)
        });
        let removed = before - map.len();
        if removed > 0 {
            debug!(removed, remaining = map.len(), "pruned idle rate-limit buckets");
        }
        removed
    }
}

/// Run admission: a caller-token limiter and a source-IP limiter.
/// A request is admitted only if both allow.
#[derive(Debug)]
pub struct Admission {
    caller: RateLimiter,
    ip: RateLimiter,
}

impl Admission {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            caller: RateLimiter::new(config.caller.clone()),
            ip: RateLimiter::new(config.ip.clone()),
        }
    }

    /// Consumes one token from each bucket, or none at all.
    pub fn admit(&self, key: &CallerKey) -> Decision {
        let now = Instant::now();
        let by_caller = self.caller.admit_at(&key.token, now);
        if !by_caller.allowed {
            return by_caller;
        }
        let ip = key.source_ip.to_string();
        let by_ip = self.ip.admit_at(&ip, now);
        if !by_ip.allowed {
            self.caller.refund(&key.token);
            return by_ip;
        }
        Decision::allow()
    }

    pub fn caller_limiter(&self) -> &RateLimiter {
        &self.caller
    }

    pub fn ip_limiter(&self) -> &RateLimiter {
        &self.ip
    }

    pub fn prune_idle(&self) -> usize {
        self.caller.prune_idle() + self.ip.prune_idle()
    }
}
