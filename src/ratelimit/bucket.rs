//! Token bucket state and refill arithmetic.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::key::BucketKey;
use crate::error::{Result, TollgateError};

/// Parameters for a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum tokens the bucket can hold
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl BucketConfig {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Reject non-positive or non-finite parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.capacity.is_finite() || self.capacity <= 0.0 {
            return Err(TollgateError::InvalidConfiguration(format!(
                "capacity must be a positive number, got {}",
                self.capacity
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(TollgateError::InvalidConfiguration(format!(
                "refill_rate must be a positive number, got {}",
                self.refill_rate
            )));
        }
        Ok(())
    }
}

/// Request counters for a bucket.
///
/// `total_requests` always equals `allowed + rejected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub total_requests: u64,
    pub allowed: u64,
    pub rejected: u64,
}

/// Outcome of a single consume call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Tokens left in the bucket after the decision
    pub remaining: f64,
    /// How long until the rejected cost could be admitted.
    /// `None` when admitted, when the cost exceeds the capacity, or when the
    /// wait is too long to represent.
    pub retry_after: Option<Duration>,
}

/// Read-only view of a bucket at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub key: BucketKey,
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    pub stats: BucketStats,
    /// Time since the bucket was created or last consumed from
    pub idle_for: Duration,
}

/// A single token bucket.
///
/// Not synchronized on its own; the limiter holds it behind its map shard lock.
#[derive(Debug)]
pub struct TokenBucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
    stats: BucketStats,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: BucketConfig, now: Instant) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tokens: config.capacity,
            last_refill: now,
            last_used: now,
            stats: BucketStats::default(),
        })
    }

    /// Add tokens for the time elapsed since the last refill, clamped to capacity.
    ///
    /// An instant earlier than the last refill is a no-op.
    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = (now - self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.config.refill_rate).min(self.config.capacity);
        self.last_refill = now;
    }

    /// Refill, then debit `cost` if enough tokens are available.
    pub fn try_consume(&mut self, now: Instant, cost: f64) -> Decision {
        self.refill(now);
        self.last_used = now;
        self.stats.total_requests += 1;

        if self.tokens >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            self.stats.allowed += 1;
            Decision {
                allowed: true,
                remaining: self.tokens,
                retry_after: None,
            }
        } else {
            self.stats.rejected += 1;
            Decision {
                allowed: false,
                remaining: self.tokens,
                retry_after: self.time_until_available(cost),
            }
        }
    }

    /// Time until `cost` tokens will have accumulated, assuming no other debits.
    ///
    /// `None` when the wait is unrepresentable, which at a tiny refill rate
    /// means never.
    fn time_until_available(&self, cost: f64) -> Option<Duration> {
        if cost > self.config.capacity {
            return None;
        }
        let deficit = (cost - self.tokens).max(0.0);
        Duration::try_from_secs_f64(deficit / self.config.refill_rate).ok()
    }

    /// Fraction of the capacity currently spent.
    pub fn utilization(&self) -> f64 {
        1.0 - self.tokens / self.config.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn stats(&self) -> BucketStats {
        self.stats
    }

    /// Time since creation or the last consume.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub fn snapshot(&self, key: &BucketKey, now: Instant) -> BucketSnapshot {
        BucketSnapshot {
            key: key.clone(),
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
            tokens: self.tokens(),
            stats: self.stats(),
            idle_for: self.idle_for(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(BucketConfig::new(10.0, 1.0).validate().is_ok());
        assert!(BucketConfig::new(0.0, 1.0).validate().is_err());
        assert!(BucketConfig::new(-5.0, 1.0).validate().is_err());
        assert!(BucketConfig::new(10.0, 0.0).validate().is_err());
        assert!(BucketConfig::new(10.0, f64::NAN).validate().is_err());
        assert!(BucketConfig::new(f64::INFINITY, 1.0).validate().is_err());
    }

    #[test]
    fn test_bucket_rejects_invalid_config() {
        let err = TokenBucket::new(BucketConfig::new(0.0, 1.0), Instant::now()).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidConfiguration(_)));
        assert!(TokenBucket::new(BucketConfig::new(1.0, f64::NAN), Instant::now()).is_err());
    }

    #[test]
    fn test_retry_after_at_negligible_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(BucketConfig::new(1.0, 1e-20), start).unwrap();

        assert!(bucket.try_consume(start, 1.0).allowed);

        let decision = bucket.try_consume(start, 1.0);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0.0);
        assert_eq!(decision.retry_after, None);
    }

    #[test]
    fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(BucketConfig::new(10.0, 1.0), Instant::now()).unwrap();

        assert_eq!(bucket.tokens(), 10.0);
        assert_eq!(bucket.stats(), BucketStats::default());
        assert_eq!(bucket.utilization(), 0.0);
    }

    #[test]
    fn test_refill_is_continuous() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(BucketConfig::new(10.0, 4.0), start).unwrap();

        assert!(bucket.try_consume(start, 10.0).allowed);
        bucket.refill(start + Duration::from_millis(250));
        assert_eq!(bucket.tokens(), 1.0);
        bucket.refill(start + Duration::from_millis(375));
        assert_eq!(bucket.tokens(), 1.5);
    }

    #[test]
    fn test_refill_clamps_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(BucketConfig::new(10.0, 5.0), start).unwrap();

        bucket.refill(start + Duration::from_secs(100));
        assert_eq!(bucket.tokens(), 10.0);
    }

    #[test]
    fn test_rejection_leaves_tokens_unchanged() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(BucketConfig::new(3.0, 1.0), start).unwrap();

        let decision = bucket.try_consume(start, 5.0);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 3.0);
        assert_eq!(bucket.tokens(), 3.0);
        assert_eq!(bucket.stats().rejected, 1);
    }

    #[test]
    fn test_retry_after() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(BucketConfig::new(4.0, 2.0), start).unwrap();

        assert!(bucket.try_consume(start, 4.0).allowed);

        let decision = bucket.try_consume(start, 3.0);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(Duration::from_millis(1500)));

        // More than the bucket can ever hold
        let decision = bucket.try_consume(start, 5.0);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, None);
    }

    #[test]
    fn test_idle_tracks_last_consume() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(BucketConfig::new(4.0, 2.0), start).unwrap();

        bucket.try_consume(start + Duration::from_secs(5), 1.0);
        bucket.refill(start + Duration::from_secs(8));
        assert_eq!(bucket.idle_for(start + Duration::from_secs(8)), Duration::from_secs(3));
    }
}
