//! Orchestrator configuration.

use std::time::Duration;

use crate::error::ConfigError;

/// Pipeline orchestrator configuration.
///
/// The three timing knobs are ordered: an executor must report progress at
/// least every `max_report_interval`, a task is only considered stale after
/// `staleness_threshold` of silence, and a file recovered once is left alone
/// for `recovery_backoff` before it may be recovered again. `validate()`
/// rejects configurations that break that ordering.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of worker tasks pulling from the admitted queue.
    pub worker_count: usize,
    /// Capacity of the admitted-task queue.
    pub queue_capacity: usize,
    /// Silence duration after which a live task is considered stale.
    pub staleness_threshold: Duration,
    /// Worst-case interval between progress reports from any executor.
    pub max_report_interval: Duration,
    /// Interval between stuck-task sweeps.
    pub detector_interval: Duration,
    /// Minimum time between recovery attempts for the same file.
    pub recovery_backoff: Duration,
    /// Whether retry budgets are enforced at all.
    pub retry_limits_enabled: bool,
    /// Default retry budget for new files (0 = unlimited when limits are on).
    pub default_max_retries: u32,
    /// Capacity of the notification broadcast channel.
    pub notification_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 64,
            staleness_threshold: Duration::from_secs(300), // 5 minutes
            max_report_interval: Duration::from_secs(60),
            detector_interval: Duration::from_secs(60),
            recovery_backoff: Duration::from_secs(600), // 10 minutes
            retry_limits_enabled: true,
            default_max_retries: 3,
            notification_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    /// Read configuration from `SCRIBED_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_parse("SCRIBED_WORKER_COUNT", defaults.worker_count),
            queue_capacity: env_parse("SCRIBED_QUEUE_CAPACITY", defaults.queue_capacity),
            staleness_threshold: env_secs(
                "SCRIBED_STALENESS_THRESHOLD_SECS",
                defaults.staleness_threshold,
            ),
            max_report_interval: env_secs(
                "SCRIBED_MAX_REPORT_INTERVAL_SECS",
                defaults.max_report_interval,
            ),
            detector_interval: env_secs(
                "SCRIBED_DETECTOR_INTERVAL_SECS",
                defaults.detector_interval,
            ),
            recovery_backoff: env_secs("SCRIBED_RECOVERY_BACKOFF_SECS", defaults.recovery_backoff),
            retry_limits_enabled: env_parse(
                "SCRIBED_RETRY_LIMITS_ENABLED",
                defaults.retry_limits_enabled,
            ),
            default_max_retries: env_parse(
                "SCRIBED_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            ),
            notification_capacity: defaults.notification_capacity,
        }
    }

    /// Validate the timing relationships at startup instead of trusting
    /// operators to keep them consistent.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.staleness_threshold <= self.max_report_interval {
            return Err(ConfigError::InvalidValue {
                key: "staleness_threshold".to_string(),
                message: format!(
                    "must exceed max_report_interval ({:?} <= {:?}); anything tighter \
                     turns a slow-but-alive executor into a false positive",
                    self.staleness_threshold, self.max_report_interval
                ),
            });
        }
        if self.recovery_backoff <= self.staleness_threshold {
            return Err(ConfigError::InvalidValue {
                key: "recovery_backoff".to_string(),
                message: format!(
                    "must exceed staleness_threshold ({:?} <= {:?}) to avoid re-recovering \
                     the same file every sweep",
                    self.recovery_backoff, self.staleness_threshold
                ),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        let config = OrchestratorConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_threshold_below_report_interval() {
        let config = OrchestratorConfig {
            staleness_threshold: Duration::from_secs(30),
            max_report_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("staleness_threshold"));
    }

    #[test]
    fn rejects_backoff_below_threshold() {
        let config = OrchestratorConfig {
            staleness_threshold: Duration::from_secs(300),
            recovery_backoff: Duration::from_secs(300),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("recovery_backoff"));
    }
}
