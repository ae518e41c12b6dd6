//! Process configuration read from `REPORTFLOW_*` environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `REPORTFLOW_POOL_MIN_SIZE` | `1` |
//! | `REPORTFLOW_POOL_MAX_SIZE` | `10` |
//! | `REPORTFLOW_POOL_ACQUIRE_TIMEOUT_MS` | `30000` |
//! | `REPORTFLOW_POOL_IDLE_TIMEOUT_SECS` | `600` |
//! | `REPORTFLOW_POOL_EVICTION_INTERVAL_SECS` | `60` |
//! | `REPORTFLOW_RETRY_MAX_ATTEMPTS` | `10` |
//! | `REPORTFLOW_RETRY_DELAY_MS` | `200` |
//! | `REPORTFLOW_DEFAULT_DATABASE` | `REPORTING` |
//! | `REPORTFLOW_DEFAULT_SCHEMA` | `PUBLIC` |
//! | `REPORTFLOW_RESET_FAILURE_POLICY` | `return_to_pool` (or `destroy`) |
//! | `REPORTFLOW_WORKERS` | `3` |
//! | `REPORTFLOW_BATCH_SIZE` | `10` |
//! | `REPORTFLOW_WAIT_TIME_SECS` | `20` |
//! | `REPORTFLOW_IDLE_SLEEP_MS` | `1000` |
//! | `REPORTFLOW_POLL_DELAY_SECS` | `30` |
//! | `REPORTFLOW_EXTRACTION_TTL_DAYS` | `32` |
//! | `REPORTFLOW_BACKGROUND_JOBS_URL` | unset (registration disabled) |
//! | `REPORTFLOW_BACKGROUND_JOB_ATTEMPTS` | `3` |
//! | `REPORTFLOW_BACKGROUND_JOB_DELAY_MS` | `1000` |
//! | `REPORTFLOW_REDIS_URL` | unset (in-memory queue) |
//! | `REPORTFLOW_QUEUE_STREAM` | `reportflow:events` |
//! | `REPORTFLOW_QUEUE_GROUP` | `reportflow-workers` |
//! | `REPORTFLOW_QUEUE_VISIBILITY_TIMEOUT_SECS` | `300` |
//! | `DATABASE_URL` | unset (in-memory repositories) |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use reportflow_core::RetryPolicy;
use reportflow_warehouse::{PoolConfig, ResetFailurePolicy, SchemaScope};

use crate::orchestrator::OrchestratorConfig;
use crate::workers::ConsumerConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Where and how background jobs get registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundJobsConfig {
    pub base_url: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for BackgroundJobsConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            retry: RetryPolicy::fixed(3, Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub redis_url: Option<String>,
    pub stream: String,
    pub group: String,
    /// How long a received message stays invisible before redelivery.
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            stream: "reportflow:events".to_string(),
            group: "reportflow-workers".to_string(),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub default_scope: SchemaScope,
    pub reset_policy: ResetFailurePolicy,
    pub consumer: ConsumerConfig,
    pub orchestrator: OrchestratorConfig,
    pub background_jobs: BackgroundJobsConfig,
    pub queue: QueueConfig,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            default_scope: SchemaScope::new("REPORTING", "PUBLIC"),
            reset_policy: ResetFailurePolicy::default(),
            consumer: ConsumerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            background_jobs: BackgroundJobsConfig::default(),
            queue: QueueConfig::default(),
            database_url: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let pool = defaults
            .pool
            .clone()
            .with_min_size(env.parse_or("REPORTFLOW_POOL_MIN_SIZE", defaults.pool.min_size)?)
            .with_max_size(env.parse_or("REPORTFLOW_POOL_MAX_SIZE", defaults.pool.max_size)?)
            .with_acquire_timeout(env.millis_or(
                "REPORTFLOW_POOL_ACQUIRE_TIMEOUT_MS",
                defaults.pool.acquire_timeout,
            )?)
            .with_idle_timeout(
                env.secs_or("REPORTFLOW_POOL_IDLE_TIMEOUT_SECS", defaults.pool.idle_timeout)?,
            )
            .with_eviction_interval(env.secs_or(
                "REPORTFLOW_POOL_EVICTION_INTERVAL_SECS",
                defaults.pool.eviction_interval,
            )?)
            .with_retry(RetryPolicy::fixed(
                env.parse_or("REPORTFLOW_RETRY_MAX_ATTEMPTS", defaults.pool.retry.max_attempts)?,
                env.millis_or("REPORTFLOW_RETRY_DELAY_MS", defaults.pool.retry.delay)?,
            ));
        if pool.max_size == 0 || pool.min_size > pool.max_size {
            return Err(ConfigError::Invalid {
                key: "REPORTFLOW_POOL_MAX_SIZE",
                value: pool.max_size.to_string(),
            });
        }

        let default_scope = SchemaScope::new(
            env.string_or("REPORTFLOW_DEFAULT_DATABASE", &defaults.default_scope.database),
            env.string_or("REPORTFLOW_DEFAULT_SCHEMA", &defaults.default_scope.schema),
        );
        if default_scope.validate().is_err() {
            return Err(ConfigError::Invalid {
                key: "REPORTFLOW_DEFAULT_DATABASE",
                value: default_scope.to_string(),
            });
        }

        let reset_policy = match env.get("REPORTFLOW_RESET_FAILURE_POLICY").as_deref() {
            None | Some("return_to_pool") => ResetFailurePolicy::ReturnToPool,
            Some("destroy") => ResetFailurePolicy::Destroy,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "REPORTFLOW_RESET_FAILURE_POLICY",
                    value: other.to_string(),
                });
            }
        };

        let consumer = defaults
            .consumer
            .with_workers(env.parse_or("REPORTFLOW_WORKERS", defaults.consumer.workers)?)
            .with_batch_size(env.parse_or("REPORTFLOW_BATCH_SIZE", defaults.consumer.batch_size)?)
            .with_wait_time(env.secs_or("REPORTFLOW_WAIT_TIME_SECS", defaults.consumer.wait_time)?)
            .with_idle_sleep(env.millis_or("REPORTFLOW_IDLE_SLEEP_MS", defaults.consumer.idle_sleep)?);

        let ttl_days: u64 = env.parse_or(
            "REPORTFLOW_EXTRACTION_TTL_DAYS",
            defaults.orchestrator.extraction_ttl.as_secs() / 86_400,
        )?;
        let orchestrator = defaults
            .orchestrator
            .with_poll_delay(
                env.secs_or("REPORTFLOW_POLL_DELAY_SECS", defaults.orchestrator.poll_delay)?,
            )
            .with_extraction_ttl(Duration::from_secs(ttl_days * 86_400));

        let background_jobs = BackgroundJobsConfig {
            base_url: env.get("REPORTFLOW_BACKGROUND_JOBS_URL"),
            retry: RetryPolicy::fixed(
                env.parse_or(
                    "REPORTFLOW_BACKGROUND_JOB_ATTEMPTS",
                    defaults.background_jobs.retry.max_attempts,
                )?,
                env.millis_or(
                    "REPORTFLOW_BACKGROUND_JOB_DELAY_MS",
                    defaults.background_jobs.retry.delay,
                )?,
            ),
        };

        let queue = QueueConfig {
            redis_url: env.get("REPORTFLOW_REDIS_URL"),
            stream: env.string_or("REPORTFLOW_QUEUE_STREAM", &defaults.queue.stream),
            group: env.string_or("REPORTFLOW_QUEUE_GROUP", &defaults.queue.group),
            visibility_timeout: env.secs_or(
                "REPORTFLOW_QUEUE_VISIBILITY_TIMEOUT_SECS",
                defaults.queue.visibility_timeout,
            )?,
        };

        Ok(Self {
            pool,
            default_scope,
            reset_policy,
            consumer,
            orchestrator,
            background_jobs,
            queue,
            database_url: env.get("DATABASE_URL"),
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Blank values count as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: raw }),
        }
    }

    fn secs_or(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse_or(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis_or(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse_or(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = from_pairs(&[]).unwrap();

        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.pool.retry, RetryPolicy::default());
        assert_eq!(config.default_scope, SchemaScope::new("REPORTING", "PUBLIC"));
        assert_eq!(config.reset_policy, ResetFailurePolicy::ReturnToPool);
        assert_eq!(config.consumer.workers, 3);
        assert_eq!(config.consumer.batch_size, 10);
        assert_eq!(config.consumer.wait_time, Duration::from_secs(20));
        assert_eq!(config.orchestrator.poll_delay, Duration::from_secs(30));
        assert_eq!(
            config.orchestrator.extraction_ttl,
            Duration::from_secs(32 * 86_400)
        );
        assert_eq!(config.background_jobs.retry.max_attempts, 3);
        assert!(config.background_jobs.base_url.is_none());
        assert!(config.queue.redis_url.is_none());
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = from_pairs(&[
            ("REPORTFLOW_POOL_MAX_SIZE", "4"),
            ("REPORTFLOW_RETRY_DELAY_MS", "50"),
            ("REPORTFLOW_DEFAULT_DATABASE", "ANALYTICS"),
            ("REPORTFLOW_RESET_FAILURE_POLICY", "destroy"),
            ("REPORTFLOW_WORKERS", "1"),
            ("REPORTFLOW_POLL_DELAY_SECS", "5"),
            ("REPORTFLOW_BACKGROUND_JOBS_URL", "http://jobs.internal"),
            ("REPORTFLOW_REDIS_URL", "redis://localhost:6379"),
        ])
        .unwrap();

        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.retry.delay, Duration::from_millis(50));
        assert_eq!(config.default_scope.database, "ANALYTICS");
        assert_eq!(config.default_scope.schema, "PUBLIC");
        assert_eq!(config.reset_policy, ResetFailurePolicy::Destroy);
        assert_eq!(config.consumer.workers, 1);
        assert_eq!(config.orchestrator.poll_delay, Duration::from_secs(5));
        assert_eq!(
            config.background_jobs.base_url.as_deref(),
            Some("http://jobs.internal")
        );
        assert_eq!(
            config.queue.redis_url.as_deref(),
            Some("redis://localhost:6379")
        );
    }

    #[test]
    fn invalid_values_name_the_key() {
        assert_eq!(
            from_pairs(&[("REPORTFLOW_BATCH_SIZE", "ten")]).unwrap_err(),
            ConfigError::Invalid {
                key: "REPORTFLOW_BATCH_SIZE",
                value: "ten".into()
            }
        );
        assert!(matches!(
            from_pairs(&[("REPORTFLOW_RESET_FAILURE_POLICY", "panic")]),
            Err(ConfigError::Invalid { key: "REPORTFLOW_RESET_FAILURE_POLICY", .. })
        ));
        assert!(matches!(
            from_pairs(&[("REPORTFLOW_POOL_MIN_SIZE", "5"), ("REPORTFLOW_POOL_MAX_SIZE", "2")]),
            Err(ConfigError::Invalid { key: "REPORTFLOW_POOL_MAX_SIZE", .. })
        ));
    }
}
