//! Operator tuning knobs, read from the environment at startup

use std::time::Duration;

use tracing::warn;

/// Requeue interval while a primary is not ready
const DEFAULT_REQUEUE_NOT_READY_SECS: u64 = 10;

/// Polling interval while external references are drift-watched
const DEFAULT_WATCHED_POLL_SECS: u64 = 300;

/// Active deadline for the update-compatibility probe Job
const DEFAULT_UPDATE_JOB_DEADLINE_SECS: i64 = 300;

/// TTL for finished probe Jobs
const DEFAULT_UPDATE_JOB_TTL_SECS: i32 = 600;

/// Operator configuration
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Requeue delay while the primary is not ready
    pub requeue_not_ready: Duration,
    /// Requeue delay while ready but drift-watching external references
    pub watched_poll_interval: Duration,
    /// Bound on probe Job runtime; expiry surfaces as a failed Job
    pub update_job_active_deadline_secs: i64,
    /// Automatic cleanup delay for finished probe Jobs
    pub update_job_ttl_secs: i32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            requeue_not_ready: Duration::from_secs(DEFAULT_REQUEUE_NOT_READY_SECS),
            watched_poll_interval: Duration::from_secs(DEFAULT_WATCHED_POLL_SECS),
            update_job_active_deadline_secs: DEFAULT_UPDATE_JOB_DEADLINE_SECS,
            update_job_ttl_secs: DEFAULT_UPDATE_JOB_TTL_SECS,
        }
    }
}

impl OperatorConfig {
    /// Read configuration from the environment, falling back to defaults on
    /// unset or unparseable values
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            requeue_not_ready: env_secs("REQUEUE_NOT_READY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.requeue_not_ready),
            watched_poll_interval: env_secs("WATCHED_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.watched_poll_interval),
            update_job_active_deadline_secs: env_secs("UPDATE_JOB_ACTIVE_DEADLINE_SECS")
                .map(|v| v as i64)
                .unwrap_or(defaults.update_job_active_deadline_secs),
            update_job_ttl_secs: env_secs("UPDATE_JOB_TTL_SECS")
                .map(|v| v as i32)
                .unwrap_or(defaults.update_job_ttl_secs),
        }
    }
}

fn env_secs(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.requeue_not_ready, Duration::from_secs(10));
        assert_eq!(config.watched_poll_interval, Duration::from_secs(300));
        assert_eq!(config.update_job_active_deadline_secs, 300);
        assert_eq!(config.update_job_ttl_secs, 600);
    }
}
