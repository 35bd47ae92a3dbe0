//! Token Bucket Admission Control
//!
//! This module provides per-identity admission control for both the HTTP and
//! the WebSocket request paths. It implements:
//!
//! - One token bucket per identity (connection id or client IP)
//! - Lazy refill computed on access, no background timer
//! - Weighted requests (heavier actions cost more tokens)
//! - A deterministic `retry_after` hint for denied callers
//!
//! # Design
//!
//! The limiter uses a token bucket algorithm where:
//! - Tokens are added at `rate` tokens per `per_secs` seconds
//! - Tokens can accumulate up to `burst`
//! - A request of cost `c` is admitted iff at least `c` tokens are available
//! - Denied requests leave the bucket untouched
//!
//! Buckets live in a [`DashMap`], so updates for one identity are serialized
//! by the shard lock that owns it while unrelated identities proceed in
//! parallel.
//!
//! # Usage
//!
//! ```
//! use gateway_core::rate_limit::{RateLimitConfig, TokenBucketLimiter};
//!
//! let limiter = TokenBucketLimiter::new(RateLimitConfig::http());
//! assert!(limiter.check("203.0.113.7", 1.0).is_allowed());
//!
//! let config = RateLimitConfig::new()
//!     .with_rate(30)
//!     .with_per_secs(60)
//!     .with_burst(50);
//! let ws_limiter = TokenBucketLimiter::new(config);
//! assert!(ws_limiter.check("conn-1", 2.0).is_allowed());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ConfigError;

/// Largest cost a single request can carry (transforms and chat)
pub const MAX_REQUEST_COST: f64 = 2.0;

/// Share of `max_identities` freed at once when the cap is hit
const EVICTION_BATCH_DIVISOR: usize = 100;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a token bucket limiter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens added per `per_secs` window (steady state)
    pub rate: u32,

    /// Length of the refill window in seconds
    pub per_secs: u64,

    /// Bucket capacity: the largest burst an idle identity can spend at once
    pub burst: u32,

    /// Whether to enforce limits at all (can be disabled for testing)
    pub enabled: bool,

    /// Upper bound on tracked identities (0 = unbounded)
    pub max_identities: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::http()
    }
}

impl RateLimitConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits for the HTTP endpoints: 10 per minute, burst 20
    #[must_use]
    pub fn http() -> Self {
        Self {
            rate: 10,
            per_secs: 60,
            burst: 20,
            enabled: true,
            max_identities: 100_000,
        }
    }

    /// Limits for WebSocket frames: 30 per minute, burst 50
    #[must_use]
    pub fn websocket() -> Self {
        Self {
            rate: 30,
            per_secs: 60,
            burst: 50,
            enabled: true,
            max_identities: 100_000,
        }
    }

    /// Create a disabled configuration (for testing)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the refill amount per window
    #[must_use]
    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    /// Set the refill window length
    #[must_use]
    pub fn with_per_secs(mut self, per_secs: u64) -> Self {
        self.per_secs = per_secs;
        self
    }

    /// Set the bucket capacity
    #[must_use]
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    /// Enable or disable enforcement
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the tracked identity cap
    #[must_use]
    pub fn with_max_identities(mut self, max: usize) -> Self {
        self.max_identities = max;
        self
    }

    /// Refill speed in tokens per second
    #[must_use]
    pub fn tokens_per_sec(&self) -> f64 {
        f64::from(self.rate) / self.per_secs.max(1) as f64
    }

    /// Bucket capacity as a float
    #[must_use]
    pub fn capacity(&self) -> f64 {
        f64::from(self.burst)
    }

    /// Reject settings that would make the limiter meaningless
    pub fn validate(&self, section: &'static str) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.rate == 0 {
            return Err(ConfigError::Invalid(format!("{section}.rate must be > 0")));
        }
        if self.per_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "{section}.per_secs must be > 0"
            )));
        }
        if self.burst == 0 {
            return Err(ConfigError::Invalid(format!("{section}.burst must be > 0")));
        }
        if self.capacity() < MAX_REQUEST_COST {
            return Err(ConfigError::Invalid(format!(
                "{section}.burst must be at least {MAX_REQUEST_COST}, the largest request cost"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Admission Result
// =============================================================================

/// Result of an admission check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed; its cost has been deducted
    Allowed,

    /// The request must not proceed
    Denied {
        /// Whole seconds after which the same request will be admitted
        retry_after_secs: u64,
    },
}

impl Admission {
    /// Check if the request was admitted
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Get the retry hint, if denied
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Denied { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

// =============================================================================
// Token Bucket
// =============================================================================

/// State of a single identity's bucket
#[derive(Clone, Debug)]
struct TokenBucket {
    /// Available tokens, always within `0.0..=capacity`
    tokens: f64,
    /// Last time tokens were refilled
    last_refill: Instant,
    /// Last time the identity was seen (for eviction)
    last_seen: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Refill tokens based on elapsed time. Never moves the clock backwards.
    fn refill(&mut self, capacity: f64, tokens_per_sec: f64, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tokens_per_sec).min(capacity);
        self.last_refill = now;
    }

    fn touch(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Whole seconds until `cost` tokens are available, or `None` if they already are
    fn seconds_until(&self, cost: f64, tokens_per_sec: f64) -> Option<u64> {
        if self.tokens >= cost {
            return None;
        }
        let deficit = cost - self.tokens;
        let mut secs = (deficit / tokens_per_sec).floor() as u64 + 1;
        // Guard against float rounding: waiting `secs` must really be enough
        while self.tokens + secs as f64 * tokens_per_sec < cost {
            secs += 1;
        }
        Some(secs)
    }

    /// Whether the bucket would be full at `now` (indistinguishable from a fresh one)
    fn is_full_at(&self, capacity: f64, tokens_per_sec: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * tokens_per_sec >= capacity
    }
}

// =============================================================================
// Limiter
// =============================================================================

/// Per-identity token bucket limiter
///
/// Provides:
/// - Lazy per-identity bucket creation (first reference starts full)
/// - Weighted admission checks
/// - Retry hints for denied callers
/// - Lossless eviction of idle identities
pub struct TokenBucketLimiter {
    /// Configuration
    config: RateLimitConfig,

    /// Buckets keyed by identity
    buckets: DashMap<String, TokenBucket>,

    /// Total admission checks performed
    total_checks: AtomicU64,

    /// Checks that were denied
    denied_checks: AtomicU64,
}

impl TokenBucketLimiter {
    /// Create a new limiter
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            total_checks: AtomicU64::new(0),
            denied_checks: AtomicU64::new(0),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check whether `identity` may spend `cost` tokens now
    pub fn check(&self, identity: &str, cost: f64) -> Admission {
        self.check_at(identity, cost, Instant::now())
    }

    /// Check whether `identity` may spend `cost` tokens at `now`
    ///
    /// On success the cost is deducted. On denial the bucket is left as it
    /// was after refilling.
    pub fn check_at(&self, identity: &str, cost: f64, now: Instant) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }

        self.total_checks.fetch_add(1, Ordering::Relaxed);

        let capacity = self.config.capacity();
        let per_sec = self.config.tokens_per_sec();

        if !self.buckets.contains_key(identity) {
            self.make_room(now);
        }

        let outcome = {
            let mut bucket = self
                .buckets
                .entry(identity.to_string())
                .or_insert_with(|| TokenBucket::full(capacity, now));

            bucket.refill(capacity, per_sec, now);
            bucket.touch(now);

            if cost > capacity {
                // Can never be satisfied; report the time until the bucket is full
                let until_full = bucket.seconds_until(capacity, per_sec).unwrap_or(1);
                Err((until_full, bucket.tokens))
            } else if bucket.tokens >= cost {
                bucket.tokens -= cost;
                Ok(())
            } else {
                let retry = bucket.seconds_until(cost, per_sec).unwrap_or(1);
                Err((retry, bucket.tokens))
            }
        };

        match outcome {
            Ok(()) => Admission::Allowed,
            Err((retry_after_secs, available)) => {
                self.denied_checks.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    identity = identity,
                    available_tokens = available,
                    required_tokens = cost,
                    retry_after_secs = retry_after_secs,
                    "Request rate limited"
                );
                Admission::Denied { retry_after_secs }
            }
        }
    }

    /// Seconds the identity must wait before `cost` would be admitted
    ///
    /// Returns `None` for unknown identities and whenever `check` with the
    /// same cost would currently succeed. A cost above capacity is never
    /// admitted; the hint is then the time until the bucket is full, as
    /// reported by a denied `check`.
    pub fn retry_after(&self, identity: &str, cost: f64) -> Option<u64> {
        self.retry_after_at(identity, cost, Instant::now())
    }

    /// [`retry_after`](Self::retry_after) with an explicit clock
    pub fn retry_after_at(&self, identity: &str, cost: f64, now: Instant) -> Option<u64> {
        if !self.config.enabled {
            return None;
        }
        let capacity = self.config.capacity();
        let per_sec = self.config.tokens_per_sec();

        let mut bucket = self.buckets.get_mut(identity)?;
        bucket.refill(capacity, per_sec, now);
        if cost > capacity {
            return Some(bucket.seconds_until(capacity, per_sec).unwrap_or(1));
        }
        bucket.seconds_until(cost, per_sec)
    }

    /// Tokens currently available to an identity (capacity for unknown ones)
    #[must_use]
    pub fn available_tokens(&self, identity: &str) -> f64 {
        self.available_tokens_at(identity, Instant::now())
    }

    /// [`available_tokens`](Self::available_tokens) with an explicit clock
    #[must_use]
    pub fn available_tokens_at(&self, identity: &str, now: Instant) -> f64 {
        let capacity = self.config.capacity();
        let per_sec = self.config.tokens_per_sec();
        self.buckets.get(identity).map_or(capacity, |bucket| {
            let elapsed = now
                .saturating_duration_since(bucket.last_refill)
                .as_secs_f64();
            (bucket.tokens + elapsed * per_sec).min(capacity)
        })
    }

    /// Drop buckets that would already be full again
    ///
    /// Such buckets carry no information a fresh bucket would not, so the
    /// eviction never changes an admission decision. Returns the number of
    /// identities removed.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    /// [`evict_idle`](Self::evict_idle) with an explicit clock
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let capacity = self.config.capacity();
        let per_sec = self.config.tokens_per_sec();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.is_full_at(capacity, per_sec, now));
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            tracing::debug!(
                removed = removed,
                remaining = self.buckets.len(),
                "Evicted idle rate limit buckets"
            );
        }
        removed
    }

    /// Keep the identity count under `max_identities` before inserting a new one
    ///
    /// Hitting the cap frees a whole batch (1% of the cap), first losslessly
    /// and then stalest-first, so the full scan runs once per batch of new
    /// identities rather than once per insert.
    fn make_room(&self, now: Instant) {
        let max = self.config.max_identities;
        if max == 0 || self.buckets.len() < max {
            return;
        }

        let batch = (max / EVICTION_BATCH_DIVISOR).max(1);
        let target = max.saturating_sub(batch);

        self.evict_idle_at(now);

        let excess = self.buckets.len().saturating_sub(target);
        if excess == 0 {
            return;
        }

        let mut candidates: Vec<(Instant, String)> = self
            .buckets
            .iter()
            .map(|entry| (entry.value().last_seen, entry.key().clone()))
            .collect();
        let excess = excess.min(candidates.len());
        if excess < candidates.len() {
            candidates.select_nth_unstable_by_key(excess, |(seen, _)| *seen);
        }

        for (_, key) in candidates.into_iter().take(excess) {
            self.buckets.remove(&key);
        }
        tracing::warn!(
            evicted = excess,
            remaining = self.buckets.len(),
            "Identity cap reached, evicted stalest buckets"
        );
    }

    /// Number of identities currently tracked
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.buckets.len()
    }

    /// Forget one identity
    pub fn forget(&self, identity: &str) {
        self.buckets.remove(identity);
    }

    /// Remove all tracked identities
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Get aggregate metrics
    #[must_use]
    pub fn metrics(&self) -> LimiterMetrics {
        LimiterMetrics {
            tracked_identities: self.tracked_identities(),
            total_checks: self.total_checks.load(Ordering::Relaxed),
            denied_checks: self.denied_checks.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("config", &self.config)
            .field("tracked_identities", &self.tracked_identities())
            .finish()
    }
}

impl Default for TokenBucketLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Aggregate metrics for a limiter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimiterMetrics {
    /// Identities with a live bucket
    pub tracked_identities: usize,
    /// Admission checks performed
    pub total_checks: u64,
    /// Admission checks denied
    pub denied_checks: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::time::Duration;

    fn limiter(rate: u32, per_secs: u64, burst: u32) -> TokenBucketLimiter {
        TokenBucketLimiter::new(
            RateLimitConfig::new()
                .with_rate(rate)
                .with_per_secs(per_secs)
                .with_burst(burst),
        )
    }

    // =========================================================================
    // Configuration Tests
    // =========================================================================

    #[test]
    fn test_config_default() {
        let config = RateLimitConfig::default();
        assert_eq!(config.rate, 10);
        assert_eq!(config.per_secs, 60);
        assert_eq!(config.burst, 20);
        assert!(config.enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = RateLimitConfig::new()
            .with_rate(200)
            .with_per_secs(10)
            .with_burst(100)
            .with_max_identities(5)
            .with_enabled(false);

        assert_eq!(config.rate, 200);
        assert_eq!(config.per_secs, 10);
        assert_eq!(config.burst, 100);
        assert_eq!(config.max_identities, 5);
        assert!(!config.enabled);
    }

    #[test]
    fn test_config_websocket_is_more_relaxed() {
        let ws = RateLimitConfig::websocket();
        let http = RateLimitConfig::http();
        assert!(ws.rate > http.rate);
        assert!(ws.burst > http.burst);
    }

    #[test]
    fn test_config_validate() {
        assert!(RateLimitConfig::http().validate("http_limits").is_ok());
        assert!(RateLimitConfig::new()
            .with_burst(0)
            .validate("http_limits")
            .is_err());
        assert!(RateLimitConfig::new()
            .with_per_secs(0)
            .validate("ws_limits")
            .is_err());
        // A transform must fit in a full bucket
        assert!(RateLimitConfig::new()
            .with_burst(1)
            .validate("ws_limits")
            .is_err());
        assert!(RateLimitConfig::new()
            .with_burst(2)
            .validate("ws_limits")
            .is_ok());
        // Disabled limiters are never invalid
        assert!(RateLimitConfig::disabled()
            .with_rate(0)
            .validate("ws_limits")
            .is_ok());
    }

    // =========================================================================
    // Admission Tests
    // =========================================================================

    #[test]
    fn test_admission_accessors() {
        assert!(Admission::Allowed.is_allowed());
        assert_eq!(Admission::Allowed.retry_after(), None);

        let denied = Admission::Denied {
            retry_after_secs: 4,
        };
        assert!(!denied.is_allowed());
        assert_eq!(denied.retry_after(), Some(4));
    }

    #[test]
    fn test_allows_full_burst() {
        let limiter = limiter(10, 60, 20);
        let now = Instant::now();

        for i in 0..20 {
            assert!(
                limiter.check_at("alice", 1.0, now).is_allowed(),
                "request {} should be allowed",
                i
            );
        }
    }

    #[test]
    fn test_twenty_first_request_denied() {
        let limiter = limiter(10, 60, 20);
        let now = Instant::now();

        for _ in 0..20 {
            assert!(limiter.check_at("alice", 1.0, now).is_allowed());
        }

        let result = limiter.check_at("alice", 1.0, now);
        let retry_after = result.retry_after().unwrap();
        assert!(!result.is_allowed());
        assert!(retry_after >= 1);
        // One token refills every 6 seconds
        assert_eq!(retry_after, 6);
    }

    #[test]
    fn test_denial_leaves_tokens_unchanged() {
        let limiter = limiter(10, 60, 3);
        let now = Instant::now();

        assert!(limiter.check_at("bob", 2.0, now).is_allowed());
        assert!(!limiter.check_at("bob", 2.0, now).is_allowed());
        assert!((limiter.available_tokens_at("bob", now) - 1.0).abs() < 1e-9);
        // The remaining token can still be spent
        assert!(limiter.check_at("bob", 1.0, now).is_allowed());
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = limiter(10, 60, 2);
        let now = Instant::now();

        assert!(limiter.check_at("a", 2.0, now).is_allowed());
        assert!(!limiter.check_at("a", 1.0, now).is_allowed());
        assert!(limiter.check_at("b", 2.0, now).is_allowed());
        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[test]
    fn test_refill_is_lazy_and_capped() {
        let limiter = limiter(60, 60, 5);
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at("c", 1.0, start).is_allowed());
        }
        assert!(!limiter.check_at("c", 1.0, start).is_allowed());

        // One token per second
        let later = start + Duration::from_secs(2);
        assert!(limiter.check_at("c", 1.0, later).is_allowed());
        assert!(limiter.check_at("c", 1.0, later).is_allowed());
        assert!(!limiter.check_at("c", 1.0, later).is_allowed());

        // A long idle period never overfills the bucket
        let much_later = later + Duration::from_secs(3600);
        assert!((limiter.available_tokens_at("c", much_later) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_never_runs_backwards() {
        let limiter = limiter(60, 60, 1);
        let start = Instant::now();
        let later = start + Duration::from_secs(10);

        assert!(limiter.check_at("d", 1.0, later).is_allowed());
        // An older timestamp must not mint tokens
        assert!(!limiter.check_at("d", 1.0, start).is_allowed());
    }

    #[test]
    fn test_disabled_allows_everything() {
        let limiter = TokenBucketLimiter::new(RateLimitConfig::disabled());
        for _ in 0..1000 {
            assert_eq!(limiter.check("anyone", 2.0), Admission::Allowed);
        }
        assert_eq!(limiter.tracked_identities(), 0);
        assert_eq!(limiter.retry_after("anyone", 2.0), None);
    }

    #[test]
    fn test_cost_above_capacity_is_denied() {
        let limiter = limiter(10, 60, 2);
        let result = limiter.check("e", 3.0);
        assert!(!result.is_allowed());
        assert!(result.retry_after().unwrap() >= 1);
    }

    // =========================================================================
    // Retry-After Tests
    // =========================================================================

    #[test]
    fn test_retry_after_cost_above_capacity() {
        let limiter = limiter(10, 60, 2);
        let now = Instant::now();
        assert!(limiter.check_at("big", 0.0, now).is_allowed());

        // Full bucket, but the cost can never fit
        let hint = limiter.retry_after_at("big", 3.0, now);
        let admission = limiter.check_at("big", 3.0, now);
        assert!(!admission.is_allowed());
        assert_eq!(hint, admission.retry_after());
        assert_eq!(limiter.retry_after_at("big", 3.0, now), Some(1));
    }

    #[test]
    fn test_retry_after_unknown_identity() {
        let limiter = limiter(10, 60, 20);
        assert_eq!(limiter.retry_after("nobody", 1.0), None);
    }

    #[test]
    fn test_retry_after_none_when_allowed() {
        let limiter = limiter(10, 60, 20);
        let now = Instant::now();
        limiter.check_at("f", 1.0, now);
        assert_eq!(limiter.retry_after_at("f", 1.0, now), None);
    }

    #[test]
    fn test_retry_after_waiting_succeeds() {
        let limiter = limiter(10, 60, 20);
        let now = Instant::now();
        for _ in 0..20 {
            limiter.check_at("g", 2.0, now);
        }

        let wait = limiter.retry_after_at("g", 2.0, now).unwrap();
        assert!(wait >= 1);
        let later = now + Duration::from_secs(wait);
        assert!(limiter.check_at("g", 2.0, later).is_allowed());
    }

    #[test]
    fn test_retry_after_matches_check_randomized() {
        let mut rng = rand::thread_rng();
        let limiter = limiter(7, 13, 4);
        let mut now = Instant::now();
        assert!(limiter.check_at("h", 0.0, now).is_allowed());

        for _ in 0..500 {
            now += Duration::from_millis(rng.gen_range(0..3_000));
            let cost = [1.0, 2.0, 5.0][rng.gen_range(0..3)];

            match limiter.retry_after_at("h", cost, now) {
                None => {
                    assert!(limiter.check_at("h", cost, now).is_allowed());
                }
                Some(wait) => {
                    assert!(wait >= 1);
                    assert!(!limiter.check_at("h", cost, now).is_allowed());
                    let later = now + Duration::from_secs(wait);
                    if cost <= 4.0 {
                        assert_eq!(limiter.retry_after_at("h", cost, later), None);
                    } else {
                        assert!(limiter.retry_after_at("h", cost, later).is_some());
                    }
                }
            }
        }
    }

    // =========================================================================
    // No Over-Admission Property
    // =========================================================================

    #[test]
    fn test_never_over_admits() {
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let rate = rng.gen_range(1..50);
            let per = rng.gen_range(1..120);
            let burst = rng.gen_range(2..40);
            let limiter = limiter(rate, per, burst);
            let per_sec = f64::from(rate) / per as f64;

            let start = Instant::now();
            let mut now = start;
            let mut admitted = 0.0;

            for _ in 0..300 {
                now += Duration::from_millis(rng.gen_range(0..2_000));
                let cost = [1.0, 2.0][rng.gen_range(0..2)];
                if limiter.check_at("p", cost, now).is_allowed() {
                    admitted += cost;
                }
                let elapsed = now.duration_since(start).as_secs_f64();
                let ceiling = f64::from(burst) + per_sec * elapsed;
                assert!(
                    admitted <= ceiling + 1e-6,
                    "admitted {admitted} exceeds ceiling {ceiling}"
                );
            }
        }
    }

    // =========================================================================
    // Eviction Tests
    // =========================================================================

    #[test]
    fn test_evict_idle_is_lossless() {
        let limiter = limiter(60, 60, 10);
        let now = Instant::now();

        limiter.check_at("spent", 10.0, now);
        limiter.check_at("fresh", 1.0, now);

        // After 5 seconds "fresh" is full again, "spent" is not
        let later = now + Duration::from_secs(5);
        assert_eq!(limiter.evict_idle_at(later), 1);
        assert_eq!(limiter.tracked_identities(), 1);
        assert!(!limiter.check_at("spent", 10.0, later).is_allowed());
    }

    #[test]
    fn test_identity_cap_evicts_stalest() {
        let limiter = TokenBucketLimiter::new(
            RateLimitConfig::new()
                .with_rate(1)
                .with_per_secs(3600)
                .with_burst(5)
                .with_max_identities(3),
        );
        let start = Instant::now();

        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            limiter.check_at(id, 5.0, start + Duration::from_secs(i as u64));
        }
        assert_eq!(limiter.tracked_identities(), 3);

        limiter.check_at("d", 1.0, start + Duration::from_secs(10));
        assert_eq!(limiter.tracked_identities(), 3);
        // "a" was the stalest and starts over with a full bucket
        assert!((limiter.available_tokens_at("a", start + Duration::from_secs(10)) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_identity_cap_evicts_in_batches() {
        let limiter = TokenBucketLimiter::new(
            RateLimitConfig::new()
                .with_rate(1)
                .with_per_secs(3600)
                .with_burst(5)
                .with_max_identities(200),
        );
        let start = Instant::now();

        for i in 0..200u64 {
            limiter.check_at(&format!("id-{i}"), 5.0, start + Duration::from_secs(i));
        }
        assert_eq!(limiter.tracked_identities(), 200);

        // Hitting the cap frees 1% of it at once
        let later = start + Duration::from_secs(300);
        limiter.check_at("new-0", 1.0, later);
        assert_eq!(limiter.tracked_identities(), 199);
        limiter.check_at("new-1", 1.0, later);
        assert_eq!(limiter.tracked_identities(), 200);

        // The two stalest went first
        assert!((limiter.available_tokens_at("id-0", later) - 5.0).abs() < 1e-9);
        assert!((limiter.available_tokens_at("id-1", later) - 5.0).abs() < 1e-9);
        assert!(limiter.available_tokens_at("id-2", later) < 1.0);
    }

    // =========================================================================
    // Metrics Tests
    // =========================================================================

    #[test]
    fn test_metrics() {
        let limiter = limiter(10, 60, 2);
        let now = Instant::now();
        for _ in 0..5 {
            limiter.check_at("m", 1.0, now);
        }

        let metrics = limiter.metrics();
        assert_eq!(metrics.tracked_identities, 1);
        assert_eq!(metrics.total_checks, 5);
        assert_eq!(metrics.denied_checks, 3);
    }

    #[test]
    fn test_forget_and_clear() {
        let limiter = limiter(10, 60, 2);
        limiter.check("x", 1.0);
        limiter.check("y", 1.0);
        limiter.forget("x");
        assert_eq!(limiter.tracked_identities(), 1);
        limiter.clear();
        assert_eq!(limiter.tracked_identities(), 0);
    }

    // =========================================================================
    // Thread Safety Tests
    // =========================================================================

    #[test]
    fn test_concurrent_checks_same_identity() {
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;
        use std::thread;

        // Practically no refill during the test
        let limiter = Arc::new(limiter(1, 3600, 100));
        let admitted = Arc::new(AtomicU32::new(0));

        let mut handles = vec![];
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    if limiter.check("shared", 1.0).is_allowed() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                    let tokens = limiter.available_tokens("shared");
                    assert!((0.0..=100.0).contains(&tokens));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 100);
        assert_eq!(limiter.metrics().total_checks, 500);
    }
}
