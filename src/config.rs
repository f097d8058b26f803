//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    BucketConfig, BucketKey, IdleEviction, DEFAULT_ENDPOINT, DEFAULT_WARNING_THRESHOLD,
};

/// Prefix for environment variable overrides, e.g.
/// `TOLLGATE__LIMITER__WARNING_THRESHOLD=0.9`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Limiter-wide settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Buckets created at startup
    #[serde(default)]
    pub buckets: Vec<BucketDefinition>,
}

/// Limiter-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Fraction of capacity spent before admitted requests are logged as warnings
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Buckets unused for longer than this are evicted. No eviction when unset.
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,

    /// How often the idle sweeper runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
            idle_ttl_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_warning_threshold() -> f64 {
    DEFAULT_WARNING_THRESHOLD
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl LimiterConfig {
    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Eviction schedule, present only when an idle TTL is configured.
    pub fn idle_eviction(&self) -> Option<IdleEviction> {
        self.idle_ttl().map(|ttl| IdleEviction {
            ttl,
            every: self.sweep_interval(),
        })
    }
}

/// A bucket declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketDefinition {
    /// Who is being limited
    pub identifier: String,
    /// What is being limited
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Maximum tokens
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl BucketDefinition {
    pub fn key(&self) -> BucketKey {
        BucketKey::new(&self.identifier, &self.endpoint)
    }

    pub fn bucket_config(&self) -> BucketConfig {
        BucketConfig::new(self.capacity, self.refill_rate)
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file, overlaid with `TOLLGATE__*`
    /// environment variables.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(TollgateError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        let config: TollgateConfig = settings
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check limiter settings and every declared bucket.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.limiter.warning_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(TollgateError::Config(format!(
                "warning_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.limiter.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for definition in &self.buckets {
            let key = definition.key();
            definition
                .bucket_config()
                .validate()
                .map_err(|e| TollgateError::Config(format!("bucket {}: {}", key, e)))?;
            if !seen.insert(key.clone()) {
                return Err(TollgateError::Config(format!("duplicate bucket {}", key)));
            }
        }

        Ok(())
    }
}
