use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use liftlog_core::aggregates::StatusPolicy;
use liftlog_core::extraction::BandWeights;

use crate::agent::RetryPolicy;

const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub retry: RetryPolicy,
}

/// Startup configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub port: u16,
    pub agent: AgentConfig,
    pub status_policy: StatusPolicy,
    pub band_weights: BandWeights,
    pub tracking_cache_ttl: Duration,
    pub cors_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let retry = RetryPolicy {
            max_retries: env.parsed("LIFTLOG_AGENT_MAX_RETRIES", 3_u32)?,
            base_delay: Duration::from_millis(env.parsed("LIFTLOG_AGENT_BACKOFF_BASE_MS", 1000_u64)?),
            max_delay: Duration::from_millis(env.parsed("LIFTLOG_AGENT_BACKOFF_MAX_MS", 30_000_u64)?),
            jitter: env.parsed("LIFTLOG_AGENT_BACKOFF_JITTER", true)?,
            attempt_timeout: Duration::from_secs(env.parsed("LIFTLOG_AGENT_TIMEOUT_SECS", 30_u64)?),
        };
        if retry.max_retries == 0 {
            return Err(ConfigError::Invalid {
                name: "LIFTLOG_AGENT_MAX_RETRIES",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        let band_weights = BandWeights {
            primary: env.parsed("LIFTLOG_PRIMARY_WEIGHT", 0.6_f64)?,
            secondary: env.parsed("LIFTLOG_SECONDARY_WEIGHT", 0.4_f64)?,
            tertiary: env.parsed("LIFTLOG_TERTIARY_WEIGHT", 0.2_f64)?,
        };
        if !band_weights.is_valid() {
            return Err(ConfigError::Invalid {
                name: "LIFTLOG_PRIMARY_WEIGHT",
                value: format!(
                    "{}/{}/{}",
                    band_weights.primary, band_weights.secondary, band_weights.tertiary
                ),
                reason: "band weights must be positive with primary >= secondary >= tertiary"
                    .to_string(),
            });
        }

        let volume_threshold: f64 = env.parsed("LIFTLOG_VOLUME_THRESHOLD", 1000.0)?;
        if !volume_threshold.is_finite() || volume_threshold < 0.0 {
            return Err(ConfigError::Invalid {
                name: "LIFTLOG_VOLUME_THRESHOLD",
                value: volume_threshold.to_string(),
                reason: "must be a non-negative number".to_string(),
            });
        }

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            database_max_connections: env.parsed("DATABASE_MAX_CONNECTIONS", 20_u32)?,
            port: env.parsed("PORT", 3000_u16)?,
            agent: AgentConfig {
                url: env.required("LIFTLOG_AGENT_URL")?,
                api_key: env.optional("LIFTLOG_AGENT_API_KEY"),
                retry,
            },
            status_policy: StatusPolicy {
                volume_threshold,
                undertrained_after_days: env.parsed("LIFTLOG_UNDERTRAINED_AFTER_DAYS", 14_i64)?,
            },
            band_weights,
            tracking_cache_ttl: Duration::from_secs(
                env.parsed("LIFTLOG_TRACKING_CACHE_TTL_SECS", 300_u64)?,
            ),
            cors_origins: env
                .optional("LIFTLOG_CORS_ORIGINS")
                .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string())
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn parsed<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
                name,
                value: raw.clone(),
                reason: err.to_string(),
            }),
        }
    }
}
