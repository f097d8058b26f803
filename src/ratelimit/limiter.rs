//! Core rate limiter implementation.

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::bucket::{BucketConfig, BucketSnapshot, Decision, TokenBucket};
use super::clock::{Clock, SystemClock};
use super::key::BucketKey;
use crate::config::TollgateConfig;
use crate::error::{Result, TollgateError};

/// Default fraction of capacity spent before a usage warning is logged.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

/// When idle buckets are evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEviction {
    /// Buckets unused for longer than this are removed
    pub ttl: Duration,
    /// How often to look for them
    pub every: Duration,
}

/// The core rate limiter that manages token buckets.
///
/// Buckets are kept in a sharded map. A consume holds the write lock of its
/// key's shard for the whole refill-then-debit step, so concurrent callers
/// for one key are serialized while other shards proceed in parallel.
pub struct RateLimiter<C: Clock = SystemClock> {
    /// Token buckets indexed by key
    buckets: DashMap<BucketKey, TokenBucket>,
    /// Time source for refills and idle tracking
    clock: C,
    /// Utilization at which admitted requests are logged as warnings
    warning_threshold: f64,
}

impl RateLimiter<SystemClock> {
    /// Create a new rate limiter on the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for RateLimiter<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create an empty rate limiter on the given clock.
    pub fn with_clock(clock: C) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }

    /// Build a limiter and create every bucket declared in the configuration.
    pub fn from_config(config: &TollgateConfig, clock: C) -> Result<Self> {
        config.validate()?;

        let limiter =
            Self::with_clock(clock).with_warning_threshold(config.limiter.warning_threshold);
        for definition in &config.buckets {
            limiter.create_bucket(definition.key(), definition.bucket_config())?;
        }

        info!(buckets = limiter.bucket_count(), "Rate limiter configured");
        Ok(limiter)
    }

    /// Set the utilization at which admitted requests are logged as warnings.
    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold;
        self
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Create a full bucket for `key`, replacing any existing one.
    pub fn create_bucket(
        &self,
        key: impl Into<BucketKey>,
        config: BucketConfig,
    ) -> Result<BucketSnapshot> {
        let key = key.into();
        let now = self.clock.now();
        let bucket = TokenBucket::new(config, now)?;
        let snapshot = bucket.snapshot(&key, now);

        if self.buckets.insert(key.clone(), bucket).is_some() {
            debug!(key = %key, "Replaced existing bucket");
        }
        debug!(
            key = %key,
            capacity = config.capacity,
            refill_rate = config.refill_rate,
            "Created token bucket"
        );

        Ok(snapshot)
    }

    /// Try to debit `cost` tokens from the bucket for `key`.
    pub fn consume(&self, key: impl Into<BucketKey>, cost: f64) -> Result<Decision> {
        let key = key.into();
        if !cost.is_finite() || cost <= 0.0 {
            return Err(TollgateError::InvalidCost(cost));
        }

        let (decision, utilization) = {
            let mut bucket = self
                .buckets
                .get_mut(&key)
                .ok_or_else(|| TollgateError::NotFound { key: key.clone() })?;
            let decision = bucket.try_consume(self.clock.now(), cost);
            (decision, bucket.utilization())
        };

        trace!(
            key = %key,
            cost = cost,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Consumed from bucket"
        );

        if !decision.allowed {
            debug!(
                key = %key,
                cost = cost,
                remaining = decision.remaining,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        } else if self.exceeds_warning_threshold(&decision, utilization) {
            warn!(
                key = %key,
                remaining = decision.remaining,
                utilization = utilization,
                "Bucket usage above warning threshold"
            );
        }

        Ok(decision)
    }

    /// Whether an outcome should be logged as a usage warning. Only admitted
    /// requests that leave the bucket at or past the threshold qualify.
    fn exceeds_warning_threshold(&self, decision: &Decision, utilization: f64) -> bool {
        decision.allowed && utilization >= self.warning_threshold
    }

    /// Debit a single token.
    pub fn consume_one(&self, key: impl Into<BucketKey>) -> Result<Decision> {
        self.consume(key, 1.0)
    }

    /// Snapshot a bucket with its tokens refilled up to now.
    pub fn get_stats(&self, key: impl Into<BucketKey>) -> Result<BucketSnapshot> {
        let key = key.into();
        let mut bucket = self
            .buckets
            .get_mut(&key)
            .ok_or_else(|| TollgateError::NotFound { key: key.clone() })?;

        let now = self.clock.now();
        bucket.refill(now);
        Ok(bucket.snapshot(&key, now))
    }

    /// Snapshot every bucket, sorted by key.
    pub fn snapshot_all(&self) -> Vec<BucketSnapshot> {
        let mut snapshots: Vec<BucketSnapshot> = self
            .buckets
            .iter_mut()
            .map(|mut entry| {
                let now = self.clock.now();
                entry.value_mut().refill(now);
                entry.value().snapshot(entry.key(), now)
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Remove the bucket for `key`. Returns whether one existed.
    pub fn remove_bucket(&self, key: impl Into<BucketKey>) -> bool {
        let key = key.into();
        let removed = self.buckets.remove(&key).is_some();
        if removed {
            debug!(key = %key, "Removed token bucket");
        }
        removed
    }

    pub fn contains(&self, key: impl Into<BucketKey>) -> bool {
        self.buckets.contains_key(&key.into())
    }

    /// Remove all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Get the number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Remove buckets that have not been consumed from for longer than `ttl`.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        self.buckets.retain(|key, bucket| {
            let idle_for = bucket.idle_for(now);
            if idle_for > ttl {
                debug!(key = %key, idle_for = ?idle_for, "Evicting idle bucket");
                removed += 1;
                false
            } else {
                true
            }
        });

        removed
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `eviction.every` on the
    /// tokio runtime.
    ///
    /// The task holds only a weak reference and stops once the limiter is
    /// dropped. Abort the returned handle to stop it earlier.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, eviction: IdleEviction) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        let period = eviction.every.max(Duration::from_millis(1));
        let ttl = eviction.ttl;

        info!(every = ?period, ttl = ?ttl, "Starting idle bucket sweeper");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let Some(limiter) = limiter.upgrade() else {
                    debug!("Rate limiter dropped, stopping idle sweeper");
                    break;
                };

                let removed = limiter.sweep_idle(ttl);
                if removed > 0 {
                    info!(
                        removed = removed,
                        remaining = limiter.bucket_count(),
                        "Swept idle buckets"
                    );
                }
            }
        })
    }
}
