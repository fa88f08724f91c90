//! Per-caller admission control for `/execute`.
//!
//! Each caller key owns a token bucket: it starts full at `burst` tokens,
//! regains `refill_per_sec` tokens per second up to `burst`, and every
//! admitted request spends one token. Buckets left untouched for
//! `idle_ttl` are evicted, and the number of tracked keys is capped so a
//! flood of distinct addresses cannot grow the map without bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Refill arithmetic is floating point; a bucket this close to a whole
/// token counts as having it.
const TOKEN_EPSILON: f64 = 1e-9;

/// Shortest period accepted by [`AdmissionLimiter::spawn_eviction`].
const MIN_EVICTION_PERIOD: Duration = Duration::from_secs(1);

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// Request admitted; one token was spent.
    Allowed {
        /// Whole tokens left in the caller's bucket.
        remaining: u32,
    },
    /// Request rejected; nothing was spent.
    Limited {
        /// Time until the next token is available.
        retry_after: Duration,
    },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed { .. })
    }
}

/// Returned to callers that were not admitted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Too many requests, retry in {}s", .retry_after.as_secs().max(1))]
pub struct AdmissionDenied {
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(burst: u32, now: Instant) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec).min(config.burst as f64);
        self.last_refill = now;
    }

    fn time_until_token(&self, config: &RateLimitConfig) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        if config.refill_per_sec <= 0.0 {
            // Never refills; report the idle window as the earliest retry.
            return config.idle_ttl;
        }
        // A tiny refill rate can put the wait beyond what a Duration holds.
        Duration::try_from_secs_f64(missing / config.refill_per_sec).unwrap_or(Duration::MAX)
    }
}

/// Token-bucket limiter keyed by caller identity.
pub struct AdmissionLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl AdmissionLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admit or reject one request from `key`.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    pub fn check(&self, key: &str) -> AdmissionDecision {
        self.check_at(key, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, key: &str, now: Instant) -> AdmissionDecision {
        let mut buckets = self.buckets();

        if !buckets.contains_key(key) && buckets.len() >= self.config.max_keys {
            self.make_room(&mut buckets, now);
        }

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(self.config.burst, now));
        bucket.refill(&self.config, now);

        if bucket.tokens + TOKEN_EPSILON >= 1.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            AdmissionDecision::Allowed {
                remaining: bucket.tokens.floor() as u32,
            }
        } else {
            AdmissionDecision::Limited {
                retry_after: bucket.time_until_token(&self.config),
            }
        }
    }

    /// Admit `key` or return the denial to hand back to the caller.
    pub fn admit(&self, key: &str) -> Result<u32, AdmissionDenied> {
        match self.check(key) {
            AdmissionDecision::Allowed { remaining } => Ok(remaining),
            AdmissionDecision::Limited { retry_after } => Err(AdmissionDenied { retry_after }),
        }
    }

    /// Drop buckets idle for longer than the configured TTL. Returns how
    /// many were removed.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets();
        let before = buckets.len();
        let ttl = self.config.idle_ttl;
        buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < ttl);
        before - buckets.len()
    }

    /// Periodically evict idle buckets until the returned handle is aborted.
    /// Periods below one second are raised to one second.
    pub fn spawn_eviction(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let every = every.max(MIN_EVICTION_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = limiter.evict_idle();
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = limiter.tracked_keys(),
                        "Evicted idle rate limit buckets"
                    );
                }
            }
        })
    }

    /// Number of tracked caller keys.
    pub fn tracked_keys(&self) -> usize {
        self.buckets().len()
    }

    fn make_room(&self, buckets: &mut HashMap<String, Bucket>, now: Instant) {
        let ttl = self.config.idle_ttl;
        buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < ttl);

        // Still full: forget the least recently seen caller. Its next
        // request starts from a fresh bucket.
        if buckets.len() >= self.config.max_keys
            && let Some(oldest) = buckets
                .iter()
                .min_by_key(|(_, b)| b.last_refill)
                .map(|(k, _)| k.clone())
        {
            buckets.remove(&oldest);
            tracing::debug!(key = %oldest, "Evicted rate limit bucket at key cap");
        }
    }
}
