//! Configuration loading from the environment.
//!
//! Every setting has a default except `DATABASE_URL`, which only the binary
//! requires. Malformed values are errors, never silently defaulted.

use std::str::FromStr;
use std::time::Duration;

use feedq_ai::ProviderConfig;

use crate::guard::GuardConfig;
use crate::jobs::{ProcessorConfig, RetryPolicy, DEFAULT_LOCK_TTL, DEFAULT_MAX_ATTEMPTS};
use crate::workers::FeedbackWorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub worker_id: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub lock_ttl: Duration,
    pub guard: GuardConfig,
    pub provider: ProviderConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let provider_defaults = ProviderConfig::default();
        let guard_defaults = GuardConfig::default();

        let mut retry = provider_defaults.retry;
        retry.max_retries = env.parse("AI_MAX_RETRIES", retry.max_retries)?;

        Ok(Self {
            database_url: env.string("DATABASE_URL"),
            worker_id: env
                .string("FEEDQ_WORKER_ID")
                .unwrap_or_else(|| format!("feedq-{}", std::process::id())),
            poll_interval: Duration::from_millis(env.parse("FEEDQ_POLL_INTERVAL_MS", 3_000)?),
            batch_size: env.parse("FEEDQ_BATCH_SIZE", 5)?,
            max_attempts: env.positive("FEEDQ_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            lock_ttl: Duration::from_secs(
                env.parse("FEEDQ_LOCK_TTL_SECS", DEFAULT_LOCK_TTL.as_secs())?,
            ),
            guard: GuardConfig {
                max_concurrency: env.positive("FEEDQ_MAX_CONCURRENCY", guard_defaults.max_concurrency)?,
                rate_limit: env.parse("FEEDQ_RATE_LIMIT_PER_MIN", guard_defaults.rate_limit)?,
                max_tracked_keys: env.parse("FEEDQ_RATE_LIMIT_MAX_KEYS", guard_defaults.max_tracked_keys)?,
                ..guard_defaults
            },
            provider: ProviderConfig {
                enabled: env.flag("AI_ENABLED", provider_defaults.enabled)?,
                api_key: env.string("AI_API_KEY"),
                base_url: env.string("AI_BASE_URL").unwrap_or(provider_defaults.base_url),
                model: env.string("AI_MODEL").unwrap_or(provider_defaults.model),
                timeout: Duration::from_millis(
                    env.positive("AI_TIMEOUT_MS", provider_defaults.timeout.as_millis() as u64)?,
                ),
                max_code_chars: env.positive("AI_MAX_CODE_CHARS", provider_defaults.max_code_chars)?,
                max_items: env.positive("AI_MAX_ITEMS", provider_defaults.max_items)?,
                retry,
                ..provider_defaults
            },
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            worker_id: self.worker_id.clone(),
            lock_ttl: self.lock_ttl,
            retry: RetryPolicy::default(),
        }
    }

    pub fn worker_config(&self) -> FeedbackWorkerConfig {
        FeedbackWorkerConfig {
            name: self.worker_id.clone(),
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        }
    }

    fn positive<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + ToString,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
            });
        }
        Ok(value)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError::Invalid { key, value: v }),
        }
    }
}
