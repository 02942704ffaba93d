//! Application configuration.
//!
//! TOML file with serde defaults for every section; the broker password
//! can be supplied via `DAYBATCH_API_PASSWORD` instead of the file and is
//! redacted from `Debug` output either way.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use daybatch_broker::{RestBrokerConfig, RetryPolicy};
use daybatch_core::OcoMode;
use daybatch_engine::SupervisorConfig;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Environment variable that overrides `broker.api_password`.
pub const API_PASSWORD_ENV: &str = "DAYBATCH_API_PASSWORD";

/// Secret string whose `Debug`/`Display` never leak the value.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub eod: EodConfig,
    #[serde(default)]
    pub oco: OcoConfig,
    #[serde(default)]
    pub cancel: CancelConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub clock: ClockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://daybatch.sqlite?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_password: Secret,
    /// Default market code. 1 is refused for new orders since the
    /// 2026-02-28 exchange change.
    #[serde(default = "default_market_code")]
    pub market_code: i32,
    #[serde(default = "default_broker_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_market_code() -> i32 {
    9
}

fn default_broker_timeout_ms() -> u64 {
    5000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:18080/kabusapi".to_string(),
            api_password: Secret::default(),
            market_code: default_market_code(),
            timeout_ms: default_broker_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    pub order_per_sec: u32,
    pub info_per_sec: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            order_per_sec: 5,
            info_per_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub orders_interval_ms: u64,
    pub positions_interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            orders_interval_ms: 1500,
            positions_interval_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub miss_grace_sec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            miss_grace_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EodConfig {
    pub default_close_time: String,
    pub enabled: bool,
}

impl Default for EodConfig {
    fn default() -> Self {
        Self {
            default_close_time: "14:30".to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoConfig {
    pub mode: OcoMode,
    pub hold_wait_ms: u64,
}

impl Default for OcoConfig {
    fn default() -> Self {
        Self {
            mode: OcoMode::PerPartial,
            hold_wait_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelConfig {
    pub wait_ms: u64,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self { wait_ms: 3000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    pub utc_offset_hours: i32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self { utc_offset_hours: 9 }
    }
}

impl AppConfig {
    /// Load from file, falling back to defaults when the file is absent.
    /// The env var override for the secret is applied either way.
    pub fn load(path: &str) -> AppResult<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!(path, "Config file not found, using defaults");
            Self::default()
        };
        if let Ok(password) = std::env::var(API_PASSWORD_ENV) {
            config.broker.api_password = Secret::new(password);
        }
        Ok(config)
    }

    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("failed to read {path}: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("failed to parse {path}: {e}")))
    }

    pub fn rest_broker_config(&self) -> RestBrokerConfig {
        RestBrokerConfig {
            base_url: self.broker.base_url.clone(),
            api_password: self.broker.api_password.expose().to_string(),
            market_code: self.broker.market_code,
            timeout: Duration::from_millis(self.broker.timeout_ms),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_backoff: Duration::from_millis(self.retry.base_backoff_ms),
            },
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            market_code: self.broker.market_code,
            scheduler_tick: Duration::from_millis(self.scheduler.tick_interval_ms),
            miss_grace: Duration::from_secs(self.scheduler.miss_grace_sec),
            orders_poll_interval: Duration::from_millis(self.poll.orders_interval_ms),
            positions_poll_interval: Duration::from_millis(self.poll.positions_interval_ms),
            oco_mode: self.oco.mode,
            oco_scan_interval: Duration::from_secs(1),
            hold_wait: Duration::from_millis(self.oco.hold_wait_ms),
            cancel_wait: Duration::from_millis(self.cancel.wait_ms),
            eod_enabled: self.eod.enabled,
            eod_tick: Duration::from_secs(1),
            eod_default_close_time: self.eod.default_close_time.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.rate.order_per_sec, 5);
        assert_eq!(config.rate.info_per_sec, 10);
        assert_eq!(config.poll.orders_interval_ms, 1500);
        assert_eq!(config.scheduler.miss_grace_sec, 300);
        assert_eq!(config.eod.default_close_time, "14:30");
        assert_eq!(config.oco.mode, OcoMode::PerPartial);
        assert_eq!(config.broker.market_code, 9);
        assert_eq!(config.clock.utc_offset_hours, 9);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[broker]
base_url = "http://localhost:18081/kabusapi"
api_password = "pw"

[oco]
mode = "post_complete"
hold_wait_ms = 5000
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.broker.base_url, "http://localhost:18081/kabusapi");
        assert_eq!(config.broker.api_password.expose(), "pw");
        assert_eq!(config.oco.mode, OcoMode::PostComplete);
        assert_eq!(config.oco.hold_wait_ms, 5000);
        // Untouched sections keep their defaults.
        assert_eq!(config.rate.order_per_sec, 5);
        assert_eq!(config.cancel.wait_ms, 3000);
    }

    #[test]
    fn test_secret_is_redacted_in_debug() {
        let config = AppConfig {
            broker: BrokerConfig {
                api_password: Secret::new("super-secret"),
                ..Default::default()
            },
            ..Default::default()
        };
        let debugged = format!("{config:?}");
        assert!(!debugged.contains("super-secret"));
        assert!(debugged.contains("Secret(***)"));
    }

    #[test]
    fn test_supervisor_config_mapping() {
        let config = AppConfig::default();
        let sup = config.supervisor_config();
        assert_eq!(sup.miss_grace, Duration::from_secs(300));
        assert_eq!(sup.orders_poll_interval, Duration::from_millis(1500));
        assert_eq!(sup.cancel_wait, Duration::from_millis(3000));
        assert!(sup.eod_enabled);
    }
}
