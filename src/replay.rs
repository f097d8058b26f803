//! Replay of recorded request traces against simulated time.
//!
//! A trace lists requests with their offset from the start of the recording.
//! Replaying advances a [`ManualClock`] to each offset and records the
//! limiter's decision, which makes limit tuning reproducible.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{BucketKey, IdleEviction, ManualClock, RateLimiter, DEFAULT_ENDPOINT};

/// A recorded sequence of requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default)]
    pub requests: Vec<TracedRequest>,
}

/// One request in a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracedRequest {
    /// Milliseconds since the start of the trace
    pub at_ms: u64,
    pub identifier: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_cost")]
    pub cost: f64,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_cost() -> f64 {
    1.0
}

impl TracedRequest {
    pub fn key(&self) -> BucketKey {
        BucketKey::new(&self.identifier, &self.endpoint)
    }
}

/// The limiter's answer to one traced request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayRecord {
    pub at_ms: u64,
    pub key: String,
    pub cost: f64,
    pub allowed: bool,
    /// Tokens left after the decision; absent when the request errored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Trace {
    /// Load a trace from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading request trace");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a trace from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse trace: {}", e)))
    }
}

/// Replay `trace` in time order against `limiter`, driving `clock`.
///
/// Requests with equal offsets keep their recorded order. Per-request errors
/// (unknown key, bad cost) are recorded and do not stop the replay.
///
/// With `eviction`, idle buckets are swept every `eviction.every` of
/// simulated time, so a key idle past its TTL reports `NotFound` afterwards.
pub fn replay(
    limiter: &RateLimiter<ManualClock>,
    clock: &ManualClock,
    trace: &Trace,
    eviction: Option<IdleEviction>,
) -> Vec<ReplayRecord> {
    let mut requests: Vec<&TracedRequest> = trace.requests.iter().collect();
    requests.sort_by_key(|r| r.at_ms);

    let start = clock.elapsed();
    let sweep_every = eviction.map(|e| e.every.max(Duration::from_millis(1)));
    let mut next_sweep = sweep_every.unwrap_or(Duration::MAX);
    let mut records = Vec::with_capacity(requests.len());

    for request in requests {
        let offset = Duration::from_millis(request.at_ms);

        if let (Some(eviction), Some(every)) = (eviction, sweep_every) {
            while next_sweep <= offset {
                clock.advance_to(start + next_sweep);
                let evicted = limiter.sweep_idle(eviction.ttl);
                if evicted > 0 {
                    info!(at = ?next_sweep, evicted = evicted, "Swept idle buckets");
                }
                next_sweep += every;
            }
        }

        clock.advance_to(start + offset);
        let key = request.key();

        let record = match limiter.consume(&key, request.cost) {
            Ok(decision) => ReplayRecord {
                at_ms: request.at_ms,
                key: key.to_string(),
                cost: request.cost,
                allowed: decision.allowed,
                remaining: Some(decision.remaining),
                retry_after_ms: decision
                    .retry_after
                    .map(|d| d.as_nanos().div_ceil(1_000_000).try_into().unwrap_or(u64::MAX)),
                error: None,
            },
            Err(e) => {
                warn!(key = %key, at_ms = request.at_ms, error = %e, "Traced request failed");
                ReplayRecord {
                    at_ms: request.at_ms,
                    key: key.to_string(),
                    cost: request.cost,
                    allowed: false,
                    remaining: None,
                    retry_after_ms: None,
                    error: Some(e.to_string()),
                }
            }
        };
        records.push(record);
    }

    let allowed = records.iter().filter(|r| r.allowed).count();
    info!(
        requests = records.len(),
        allowed = allowed,
        rejected = records.len() - allowed,
        "Trace replay finished"
    );

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::BucketConfig;

    fn limiter() -> (RateLimiter<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(clock.clone());
        limiter
            .create_bucket("client", BucketConfig::new(2.0, 1.0))
            .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_parse_trace() {
        let yaml = r#"
requests:
  - at_ms: 0
    identifier: client
  - at_ms: 250
    identifier: client
    endpoint: upload
    cost: 2.5
"#;
        let trace = Trace::from_yaml(yaml).unwrap();

        assert_eq!(trace.requests.len(), 2);
        assert_eq!(trace.requests[0].cost, 1.0);
        assert_eq!(trace.requests[0].key(), BucketKey::from("client"));
        assert_eq!(trace.requests[1].key(), BucketKey::new("client", "upload"));
    }

    #[test]
    fn test_replay_advances_clock_in_order() {
        let (limiter, clock) = limiter();
        let yaml = r#"
requests:
  - at_ms: 1000
    identifier: client
  - at_ms: 0
    identifier: client
  - at_ms: 0
    identifier: client
  - at_ms: 0
    identifier: client
"#;
        let trace = Trace::from_yaml(yaml).unwrap();

        let records = replay(&limiter, &clock, &trace, None);

        let outcomes: Vec<(u64, bool)> = records.iter().map(|r| (r.at_ms, r.allowed)).collect();
        assert_eq!(
            outcomes,
            vec![(0, true), (0, true), (0, false), (1000, true)]
        );
        assert_eq!(records[2].retry_after_ms, Some(1000));
        assert_eq!(records[3].remaining, Some(0.0));
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn test_replay_records_errors() {
        let (limiter, clock) = limiter();
        let trace = Trace {
            requests: vec![
                TracedRequest {
                    at_ms: 0,
                    identifier: "stranger".to_string(),
                    endpoint: default_endpoint(),
                    cost: 1.0,
                },
                TracedRequest {
                    at_ms: 10,
                    identifier: "client".to_string(),
                    endpoint: default_endpoint(),
                    cost: 1.0,
                },
            ],
        };

        let records = replay(&limiter, &clock, &trace, None);

        assert_eq!(records.len(), 2);
        assert!(!records[0].allowed);
        assert!(records[0].error.as_deref().unwrap().contains("stranger:default"));
        assert!(records[1].allowed);
        assert_eq!(records[1].error, None);
    }

    #[test]
    fn test_replay_sweeps_idle_buckets_on_schedule() {
        let (limiter, clock) = limiter();
        limiter
            .create_bucket("busy", BucketConfig::new(10.0, 1.0))
            .unwrap();
        let yaml = r#"
requests:
  - { at_ms: 0, identifier: client }
  - { at_ms: 0, identifier: busy }
  - { at_ms: 1500, identifier: busy }
  - { at_ms: 3000, identifier: busy }
  - { at_ms: 4500, identifier: busy }
  - { at_ms: 5000, identifier: busy }
  - { at_ms: 5000, identifier: client }
"#;
        let trace = Trace::from_yaml(yaml).unwrap();
        let eviction = IdleEviction {
            ttl: Duration::from_secs(2),
            every: Duration::from_secs(1),
        };

        let records = replay(&limiter, &clock, &trace, Some(eviction));

        // "client" went idle at 0 and was swept at 3s; "busy" never idled past 2s
        assert!(records[..6].iter().all(|r| r.allowed));
        assert!(!records[6].allowed);
        assert!(records[6].error.as_deref().unwrap().contains("client:default"));
        assert!(limiter.contains("busy"));
        assert!(!limiter.contains("client"));
    }

    #[test]
    fn test_replay_without_eviction_keeps_idle_buckets() {
        let (limiter, clock) = limiter();
        let trace = Trace::from_yaml("requests:\n  - { at_ms: 60000, identifier: client }\n").unwrap();

        let records = replay(&limiter, &clock, &trace, None);

        assert!(records[0].allowed);
    }

    #[test]
    fn test_retry_after_ms_rounds_up() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(clock.clone());
        limiter
            .create_bucket("fast", BucketConfig::new(1.0, 2500.0))
            .unwrap();
        let trace = Trace::from_yaml(
            "requests:\n  - { at_ms: 0, identifier: fast }\n  - { at_ms: 0, identifier: fast }\n",
        )
        .unwrap();

        let records = replay(&limiter, &clock, &trace, None);

        // 0.4 ms wait
        assert!(!records[1].allowed);
        assert_eq!(records[1].retry_after_ms, Some(1));
    }
}
