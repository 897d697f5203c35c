//! Worker configuration

use std::time::Duration;

use recap_billing::{EmailConfig, JobOptions};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Fixed number of worker tasks
    pub concurrency: usize,
    /// Sleep between polls of an idle queue
    pub poll_interval: Duration,
    /// Reservation lease; an expired lease is redelivered
    pub lease: Duration,
    /// Age after which a `received` event counts as stuck
    pub stuck_after: Duration,
    pub job_options: JobOptions,
    pub email: EmailConfig,
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("concurrency", &self.concurrency)
            .field("poll_interval", &self.poll_interval)
            .field("lease", &self.lease)
            .field("stuck_after", &self.stuck_after)
            .field("job_options", &self.job_options)
            .field("email_enabled", &self.email.api_key.is_some())
            .finish_non_exhaustive()
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let concurrency: usize = parse_or(&lookup, "WORKER_CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid("WORKER_CONCURRENCY"));
        }

        let attempts: u32 = parse_or(&lookup, "JOB_ATTEMPTS", 3)?;
        if attempts == 0 {
            return Err(ConfigError::Invalid("JOB_ATTEMPTS"));
        }

        let stuck_minutes: u64 = parse_or(&lookup, "STUCK_EVENT_MINUTES", 15)?;
        let stuck_after = stuck_minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or(ConfigError::Invalid("STUCK_EVENT_MINUTES"))?;

        Ok(Self {
            database_url,
            concurrency,
            poll_interval: Duration::from_millis(parse_or(&lookup, "WORKER_POLL_INTERVAL_MS", 1000)?),
            lease: Duration::from_secs(parse_or(&lookup, "WORKER_LEASE_SECS", 300)?),
            stuck_after,
            job_options: JobOptions {
                attempts,
                backoff_delay: Duration::from_millis(parse_or(&lookup, "JOB_BACKOFF_MS", 2000)?),
            },
            email: EmailConfig::new(lookup("RESEND_API_KEY"), lookup("EMAIL_FROM")),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            WorkerConfig::from_lookup(env(&[("DATABASE_URL", "postgres://localhost/recap")]))
                .unwrap();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.lease, Duration::from_secs(300));
        assert_eq!(config.stuck_after, Duration::from_secs(15 * 60));
        assert_eq!(config.job_options, JobOptions::default());
        assert!(config.email.api_key.is_none());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = WorkerConfig::from_lookup(env(&[
            ("DATABASE_URL", "postgres://localhost/recap"),
            ("WORKER_CONCURRENCY", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("WORKER_CONCURRENCY")));
    }

    #[test]
    fn test_oversized_stuck_minutes_rejected() {
        let err = WorkerConfig::from_lookup(env(&[
            ("DATABASE_URL", "postgres://localhost/recap"),
            ("STUCK_EVENT_MINUTES", "18446744073709551615"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("STUCK_EVENT_MINUTES")));
    }

    #[test]
    fn test_missing_database_url() {
        let err = WorkerConfig::from_lookup(env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }
}
