//! API server configuration

use std::time::Duration;

use recap_billing::{JobOptions, DEFAULT_TOLERANCE};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// `whsec_<base64>` or a raw shared secret
    pub webhook_secret: String,
    pub webhook_tolerance: Duration,
    /// Requests allowed per delivery id per window
    pub webhook_rate_limit: u32,
    pub webhook_rate_window: Duration,
    /// Shared rate limit counters; in-process when unset
    pub redis_url: Option<String>,
    /// Enables the admin audit routes
    pub admin_api_token: Option<String>,
    pub job_options: JobOptions,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("webhook_tolerance", &self.webhook_tolerance)
            .field("webhook_rate_limit", &self.webhook_rate_limit)
            .field("webhook_rate_window", &self.webhook_rate_window)
            .field("redis", &self.redis_url.is_some())
            .field("admin_api", &self.admin_api_token.is_some())
            .field("job_options", &self.job_options)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        // Refuse to start without a secret rather than accept unsigned webhooks
        let webhook_secret = lookup("WEBHOOK_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("WEBHOOK_SECRET"))?;

        let bind_address = lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let webhook_tolerance = match lookup("WEBHOOK_TOLERANCE_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .map_err(|_| ConfigError::Invalid("WEBHOOK_TOLERANCE_SECS"))?,
            ),
            None => DEFAULT_TOLERANCE,
        };

        let webhook_rate_limit = parse_or(&lookup, "WEBHOOK_RATE_LIMIT", 10)?;
        let webhook_rate_window =
            Duration::from_secs(parse_or(&lookup, "WEBHOOK_RATE_WINDOW_SECS", 60)?);
        if webhook_rate_window.is_zero() {
            return Err(ConfigError::Invalid("WEBHOOK_RATE_WINDOW_SECS"));
        }

        let attempts: u32 = parse_or(&lookup, "JOB_ATTEMPTS", 3)?;
        if attempts == 0 {
            return Err(ConfigError::Invalid("JOB_ATTEMPTS"));
        }
        let backoff_ms: u64 = parse_or(&lookup, "JOB_BACKOFF_MS", 2000)?;

        Ok(Self {
            database_url,
            bind_address,
            webhook_secret,
            webhook_tolerance,
            webhook_rate_limit,
            webhook_rate_window,
            redis_url: lookup("REDIS_URL").filter(|s| !s.trim().is_empty()),
            admin_api_token: lookup("ADMIN_API_TOKEN").filter(|s| !s.trim().is_empty()),
            job_options: JobOptions {
                attempts,
                backoff_delay: Duration::from_millis(backoff_ms),
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}
