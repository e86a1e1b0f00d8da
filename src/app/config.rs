//! Tracker configuration.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::domain::{AppError, ConfigError};

use super::scheduler::PollSchedule;

/// Default maximum wait for a destination confirmation (15 minutes)
const DEFAULT_DESTINATION_TIMEOUT_SECS: u64 = 900;

/// Default delay-window cache lifetime (6 hours; the window rarely changes)
const DEFAULT_DELAY_WINDOW_TTL_SECS: u64 = 21_600;

/// Configuration for the tracker engines and scheduler
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Poll cadence for transfer confirmation
    pub transfer_poll: PollSchedule,
    /// Poll cadence for delayed-request readiness re-checks
    pub redemption_poll: PollSchedule,
    /// Maximum wait for a destination confirmation before a transfer fails
    pub destination_timeout: Duration,
    /// Per-route overrides; ledger pairs have different expected latencies
    pub route_destination_timeouts: HashMap<(String, String), Duration>,
    /// How long a fetched delay window stays cached
    pub delay_window_ttl: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            transfer_poll: PollSchedule::default(),
            redemption_poll: PollSchedule {
                fast_interval: Duration::from_secs(5),
                fast_window: Duration::from_secs(60),
                steady_interval: Duration::from_secs(20),
            },
            destination_timeout: Duration::from_secs(DEFAULT_DESTINATION_TIMEOUT_SECS),
            route_destination_timeouts: HashMap::new(),
            delay_window_ttl: Duration::from_secs(DEFAULT_DELAY_WINDOW_TTL_SECS),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for unset keys. An explicitly set but unparsable value is a
    /// configuration error rather than a silent fallback.
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        let transfer_poll = PollSchedule {
            fast_interval: env_secs(
                "TRACKER_FAST_POLL_SECS",
                defaults.transfer_poll.fast_interval,
            )?,
            fast_window: env_secs(
                "TRACKER_FAST_WINDOW_SECS",
                defaults.transfer_poll.fast_window,
            )?,
            steady_interval: env_secs(
                "TRACKER_STEADY_POLL_SECS",
                defaults.transfer_poll.steady_interval,
            )?,
        };
        let redemption_poll = PollSchedule {
            fast_interval: env_secs(
                "TRACKER_REDEMPTION_POLL_SECS",
                defaults.redemption_poll.fast_interval,
            )?,
            fast_window: defaults.redemption_poll.fast_window,
            steady_interval: env_secs(
                "TRACKER_REDEMPTION_STEADY_POLL_SECS",
                defaults.redemption_poll.steady_interval,
            )?,
        };

        Ok(Self {
            transfer_poll,
            redemption_poll,
            destination_timeout: env_secs(
                "TRACKER_DESTINATION_TIMEOUT_SECS",
                defaults.destination_timeout,
            )?,
            route_destination_timeouts: HashMap::new(),
            delay_window_ttl: env_secs(
                "TRACKER_DELAY_WINDOW_TTL_SECS",
                defaults.delay_window_ttl,
            )?,
        })
    }

    /// Override the destination timeout for one (source, destination) route
    #[must_use]
    pub fn with_route_timeout(
        mut self,
        source_ledger: impl Into<String>,
        destination_ledger: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        self.route_destination_timeouts
            .insert((source_ledger.into(), destination_ledger.into()), timeout);
        self
    }

    /// Destination timeout for a route, honoring per-route overrides
    #[must_use]
    pub fn destination_timeout_for(&self, source_ledger: &str, destination_ledger: &str) -> Duration {
        self.route_destination_timeouts
            .get(&(source_ledger.to_string(), destination_ledger.to_string()))
            .copied()
            .unwrap_or(self.destination_timeout)
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, AppError> {
    parse_secs(key, env::var(key).ok(), default)
}

fn parse_secs(key: &str, value: Option<String>, default: Duration) -> Result<Duration, AppError> {
    match value {
        None => Ok(default),
        Some(raw) => {
            let secs: u64 = raw.parse().map_err(|_| {
                AppError::Config(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected whole seconds, got {:?}", raw),
                })
            })?;
            Ok(Duration::from_secs(secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.transfer_poll.fast_interval, Duration::from_secs(2));
        assert_eq!(config.transfer_poll.steady_interval, Duration::from_secs(30));
        assert_eq!(config.destination_timeout, Duration::from_secs(900));
        assert_eq!(config.delay_window_ttl, Duration::from_secs(21_600));
        assert!(config.route_destination_timeouts.is_empty());
    }

    #[test]
    fn test_route_timeout_override() {
        let config = TrackerConfig::default().with_route_timeout(
            "ledger-a",
            "ledger-b",
            Duration::from_secs(60),
        );

        assert_eq!(
            config.destination_timeout_for("ledger-a", "ledger-b"),
            Duration::from_secs(60)
        );
        // reverse direction is a different route
        assert_eq!(
            config.destination_timeout_for("ledger-b", "ledger-a"),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn test_parse_secs() {
        let default = Duration::from_secs(30);

        assert_eq!(parse_secs("KEY", None, default).unwrap(), default);
        assert_eq!(
            parse_secs("KEY", Some("12".to_string()), default).unwrap(),
            Duration::from_secs(12)
        );

        let err = parse_secs("KEY", Some("soon".to_string()), default).unwrap_err();
        assert!(matches!(
            err,
            AppError::Config(ConfigError::InvalidValue { .. })
        ));
    }
}
