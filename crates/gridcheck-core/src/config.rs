//! Pipeline configuration with defaults and environment overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default values for pipeline options.
pub mod defaults {
    /// Worker count per stage.
    pub const MAX_PARALLELISM: usize = 4;
    /// Bounded queue capacity per stage.
    pub const BOUNDED_CAPACITY: usize = 100;
    /// Items per persistence batch.
    pub const BATCH_SIZE: usize = 50;
    /// Batch flush window in milliseconds.
    pub const BATCH_WINDOW_MS: u64 = 1_000;
    /// Retries before a full head queue aborts the run.
    pub const MAX_RETRY_COUNT: u32 = 10;
    /// Retry/poll delay in milliseconds.
    pub const WAIT_SPAN_MS: u64 = 200;
}

/// Environment variable names recognized by [`PipelineConfig::from_env`].
pub mod env_vars {
    pub const MAX_PARALLELISM: &str = "GRIDCHECK_MAX_PARALLELISM";
    pub const BOUNDED_CAPACITY: &str = "GRIDCHECK_BOUNDED_CAPACITY";
    pub const BATCH_SIZE: &str = "GRIDCHECK_BATCH_SIZE";
    pub const MAX_RETRY_COUNT: &str = "GRIDCHECK_MAX_RETRY_COUNT";
    pub const WAIT_SPAN_MS: &str = "GRIDCHECK_WAIT_SPAN_MS";
}

/// Options controlling stage sizing, backpressure, and retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Worker count per stage.
    pub max_parallelism: usize,
    /// Bounded queue capacity per stage.
    pub bounded_capacity: usize,
    /// Items coalesced per persistence batch.
    pub batch_size: usize,
    /// Time window after which a partial batch flushes anyway.
    #[serde(with = "duration_ms")]
    pub batch_window: Duration,
    /// Retries before a full head queue aborts the run.
    pub max_retry_count: u32,
    /// Delay between offer retries and completion polls.
    #[serde(with = "duration_ms")]
    pub wait_span: Duration,
    /// Whether draining a stage closes its downstream automatically.
    pub propagate_completion: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: defaults::MAX_PARALLELISM,
            bounded_capacity: defaults::BOUNDED_CAPACITY,
            batch_size: defaults::BATCH_SIZE,
            batch_window: Duration::from_millis(defaults::BATCH_WINDOW_MS),
            max_retry_count: defaults::MAX_RETRY_COUNT,
            wait_span: Duration::from_millis(defaults::WAIT_SPAN_MS),
            propagate_completion: true,
        }
    }
}

impl PipelineConfig {
    /// Build a config from defaults, applying any recognized environment
    /// variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = read_env(env_vars::MAX_PARALLELISM) {
            config.max_parallelism = v;
        }
        if let Some(v) = read_env(env_vars::BOUNDED_CAPACITY) {
            config.bounded_capacity = v;
        }
        if let Some(v) = read_env(env_vars::BATCH_SIZE) {
            config.batch_size = v;
        }
        if let Some(v) = read_env::<u32>(env_vars::MAX_RETRY_COUNT) {
            config.max_retry_count = v;
        }
        if let Some(v) = read_env::<u64>(env_vars::WAIT_SPAN_MS) {
            config.wait_span = Duration::from_millis(v);
        }
        config
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_parallelism, defaults::MAX_PARALLELISM);
        assert_eq!(config.bounded_capacity, defaults::BOUNDED_CAPACITY);
        assert!(config.propagate_completion);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.wait_span, config.wait_span);
        assert_eq!(back.batch_window, config.batch_window);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"maxParallelism": 8}"#)
            .or_else(|_| serde_json::from_str(r#"{"max_parallelism": 8}"#))
            .unwrap();
        assert_eq!(config.max_parallelism, 8);
        assert_eq!(config.batch_size, defaults::BATCH_SIZE);
    }
}
