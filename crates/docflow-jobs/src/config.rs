//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use docflow_core::{defaults, Error, Result, Strategy};

use crate::retry::RetryPolicy;

/// Configuration for [`crate::PipelineEngine`] and its schedulers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub strategy: Strategy,
    /// Pool workers (0 = one per CPU core).
    pub workers: usize,
    /// Jobs a pool worker pulls per dispatch.
    pub chunk_size: usize,
    /// Jobs in flight for the cooperative scheduler.
    pub max_concurrent: usize,
    /// Jobs of one distributed batch leased by workers at once.
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    /// Default per-stage timeout; jobs may override it in their params.
    pub stage_timeout: Duration,
    /// Minimum interval between classification/embedding requests.
    pub ai_min_interval: Duration,
    /// Files above this size get a weak fingerprint.
    pub strong_hash_max_bytes: u64,
    /// Run the Embed stage for submitted jobs.
    pub embed: bool,
    /// Poll interval for distributed progress and batch waits.
    pub poll_interval: Duration,
    /// Rolling window for throughput estimation.
    pub throughput_window: Duration,
    /// How long finished or cancelled batches stay tracked in memory.
    pub batch_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            workers: defaults::POOL_WORKERS,
            chunk_size: defaults::POOL_CHUNK_SIZE,
            max_concurrent: defaults::ASYNC_MAX_CONCURRENT,
            max_in_flight: defaults::DISTRIBUTED_MAX_IN_FLIGHT,
            retry: RetryPolicy::default(),
            stage_timeout: Duration::from_secs(defaults::STAGE_TIMEOUT_SECS),
            ai_min_interval: Duration::from_millis(defaults::AI_MIN_INTERVAL_MS),
            strong_hash_max_bytes: defaults::STRONG_HASH_MAX_BYTES,
            embed: true,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            throughput_window: Duration::from_secs(defaults::THROUGHPUT_WINDOW_SECS),
            batch_retention: Duration::from_secs(defaults::BATCH_RETENTION_SECS),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| !matches!(v.trim(), "false" | "0" | "no" | "off"))
}

impl EngineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DOCFLOW_STRATEGY` | `pool` | `pool`, `async` or `distributed` |
    /// | `DOCFLOW_WORKERS` | `0` | Pool workers (0 = CPU count) |
    /// | `DOCFLOW_CHUNK_SIZE` | `4` | Jobs per pool dispatch |
    /// | `DOCFLOW_MAX_CONCURRENT` | `8` | Cooperative scheduler concurrency |
    /// | `DOCFLOW_MAX_IN_FLIGHT` | `64` | Distributed leases per batch |
    /// | `DOCFLOW_MAX_ATTEMPTS` | `3` | Attempts per job |
    /// | `DOCFLOW_RETRY_BASE_MS` | `500` | Backoff base |
    /// | `DOCFLOW_RETRY_MAX_MS` | `30000` | Backoff cap |
    /// | `DOCFLOW_STAGE_TIMEOUT_SECS` | `120` | Per-stage timeout |
    /// | `DOCFLOW_AI_MIN_INTERVAL_MS` | `0` | Min gap between AI requests |
    /// | `DOCFLOW_STRONG_HASH_MAX_BYTES` | `67108864` | Content-hash size limit |
    /// | `DOCFLOW_EMBED` | `true` | Run the Embed stage |
    /// | `DOCFLOW_POLL_INTERVAL_MS` | `500` | Progress poll interval |
    /// | `DOCFLOW_BATCH_RETENTION_SECS` | `3600` | In-memory batch retention |
    ///
    /// Unparsable numbers fall back to the default; an unknown strategy is an
    /// error.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let strategy = match std::env::var("DOCFLOW_STRATEGY") {
            Ok(v) if !v.trim().is_empty() => v.parse()?,
            _ => d.strategy,
        };

        let retry = RetryPolicy::new(
            env_parse("DOCFLOW_MAX_ATTEMPTS").unwrap_or(d.retry.max_attempts),
            env_parse("DOCFLOW_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.retry.base_delay),
            env_parse("DOCFLOW_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.retry.max_delay),
        );

        Ok(Self {
            strategy,
            workers: env_parse("DOCFLOW_WORKERS").unwrap_or(d.workers),
            chunk_size: env_parse::<usize>("DOCFLOW_CHUNK_SIZE")
                .unwrap_or(d.chunk_size)
                .max(1),
            max_concurrent: env_parse::<usize>("DOCFLOW_MAX_CONCURRENT")
                .unwrap_or(d.max_concurrent)
                .max(1),
            max_in_flight: env_parse::<usize>("DOCFLOW_MAX_IN_FLIGHT")
                .unwrap_or(d.max_in_flight)
                .max(1),
            retry,
            stage_timeout: env_parse("DOCFLOW_STAGE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.stage_timeout),
            ai_min_interval: env_parse("DOCFLOW_AI_MIN_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.ai_min_interval),
            strong_hash_max_bytes: env_parse("DOCFLOW_STRONG_HASH_MAX_BYTES")
                .unwrap_or(d.strong_hash_max_bytes),
            embed: env_flag("DOCFLOW_EMBED").unwrap_or(d.embed),
            poll_interval: env_parse("DOCFLOW_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
            throughput_window: d.throughput_window,
            batch_retention: env_parse("DOCFLOW_BATCH_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.batch_retention),
        })
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_ai_min_interval(mut self, interval: Duration) -> Self {
        self.ai_min_interval = interval;
        self
    }

    pub fn with_strong_hash_max_bytes(mut self, bytes: u64) -> Self {
        self.strong_hash_max_bytes = bytes;
        self
    }

    pub fn with_embed(mut self, embed: bool) -> Self {
        self.embed = embed;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_retention(mut self, retention: Duration) -> Self {
        self.batch_retention = retention;
        self
    }

    /// Pool size with `0` resolved to the CPU count.
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    /// Reject values no scheduler can run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".into()));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be > 0".into()));
        }
        if self.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be > 0".into()));
        }
        if self.stage_timeout.is_zero() {
            return Err(Error::Config("stage_timeout must be > 0".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.strategy, Strategy::Pool);
        assert_eq!(config.chunk_size, defaults::POOL_CHUNK_SIZE);
        assert_eq!(config.max_concurrent, defaults::ASYNC_MAX_CONCURRENT);
        assert!(config.embed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::default()
            .with_strategy(Strategy::Async)
            .with_workers(2)
            .with_chunk_size(1)
            .with_max_concurrent(3)
            .with_embed(false)
            .with_poll_interval(Duration::from_millis(10));

        assert_eq!(config.strategy, Strategy::Async);
        assert_eq!(config.resolved_workers(), 2);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.max_concurrent, 3);
        assert!(!config.embed);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_zero_workers_resolves_to_cpu_count() {
        let config = EngineConfig::default().with_workers(0);
        assert!(config.resolved_workers() >= 1);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(EngineConfig::default().with_chunk_size(0).validate().is_err());
        assert!(EngineConfig::default()
            .with_max_concurrent(0)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_stage_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_env_flag_values() {
        std::env::set_var("DOCFLOW_TEST_FLAG_OFF", "false");
        std::env::set_var("DOCFLOW_TEST_FLAG_ON", "1");
        assert_eq!(env_flag("DOCFLOW_TEST_FLAG_OFF"), Some(false));
        assert_eq!(env_flag("DOCFLOW_TEST_FLAG_ON"), Some(true));
        assert_eq!(env_flag("DOCFLOW_TEST_FLAG_UNSET"), None);
    }
}
