//! Typed configuration for the risk engine and the risk-management service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rg_types::config_error;
use rg_types::errors::RiskResult;
use rg_types::limits::{GlobalRiskLimits, RiskLimits};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::var::VaRConfig;

/// Upper bound for any retention, window or cooldown given in seconds
/// (100 years).
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3_600;

/// Seconds as a signed time delta, saturating at `TimeDelta::MAX`.
pub fn secs_delta(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskEngineConfig {
    /// Period of the monitor limit-check loop.
    pub check_interval_ms: u64,
    /// Capacity of the alert queue.
    pub alert_buffer_size: usize,
    /// Violations older than this are purged.
    pub violation_retention_secs: u64,
    pub violation_cleanup_interval_secs: u64,
    /// Worker threads used to evaluate monitors on each tick.
    pub max_concurrent_checks: usize,
    pub enable_circuit_breaker: bool,
    /// Defaults for lazily created breakers.
    pub circuit_breaker: CircuitBreakerConfig,
    pub global_limits: GlobalRiskLimits,
}

impl Default for RiskEngineConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1_000,
            alert_buffer_size: 1_000,
            violation_retention_secs: 24 * 3_600,
            violation_cleanup_interval_secs: 3_600,
            max_concurrent_checks: 4,
            enable_circuit_breaker: true,
            circuit_breaker: CircuitBreakerConfig::default(),
            global_limits: GlobalRiskLimits::default(),
        }
    }
}

impl RiskEngineConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn violation_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.violation_cleanup_interval_secs)
    }

    pub fn validate(&self) -> RiskResult<()> {
        if self.check_interval_ms == 0 {
            return Err(config_error!("check_interval_ms must be positive"));
        }
        if self.alert_buffer_size == 0 {
            return Err(config_error!("alert_buffer_size must be positive"));
        }
        if self.violation_cleanup_interval_secs == 0 {
            return Err(config_error!("violation_cleanup_interval_secs must be positive"));
        }
        if self.max_concurrent_checks == 0 {
            return Err(config_error!("max_concurrent_checks must be positive"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(config_error!("circuit_breaker.failure_threshold must be positive"));
        }
        let bounded = [
            ("check_interval_ms", self.check_interval_ms / 1_000),
            ("violation_retention_secs", self.violation_retention_secs),
            ("violation_cleanup_interval_secs", self.violation_cleanup_interval_secs),
            ("circuit_breaker.time_window_secs", self.circuit_breaker.time_window_secs),
            ("circuit_breaker.cooldown_secs", self.circuit_breaker.cooldown_secs),
        ];
        for (name, secs) in bounded {
            if secs > MAX_DURATION_SECS {
                return Err(config_error!(
                    "{name} must be at most {MAX_DURATION_SECS}, got {secs}"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskServiceConfig {
    pub engine: RiskEngineConfig,
    pub var: VaRConfig,
    pub enable_var_calculation: bool,
    pub var_update_interval_secs: u64,
    pub metrics_update_interval_secs: u64,
    /// Poll period of the alert-processing loop.
    pub alert_poll_interval_ms: u64,
    pub max_portfolios: usize,
    /// Number of value points kept per portfolio for VaR.
    pub var_history_size: usize,
    /// Limits attached to the monitor of each newly registered portfolio.
    pub portfolio_limits: RiskLimits,
}

impl Default for RiskServiceConfig {
    fn default() -> Self {
        Self {
            engine: RiskEngineConfig::default(),
            var: VaRConfig::default(),
            enable_var_calculation: true,
            var_update_interval_secs: 300,
            metrics_update_interval_secs: 30,
            alert_poll_interval_ms: 100,
            max_portfolios: 1_000,
            var_history_size: 1_000,
            portfolio_limits: RiskLimits::placeholder(),
        }
    }
}

impl RiskServiceConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> RiskResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn var_update_interval(&self) -> Duration {
        Duration::from_secs(self.var_update_interval_secs)
    }

    pub fn metrics_update_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_update_interval_secs)
    }

    pub fn alert_poll_interval(&self) -> Duration {
        Duration::from_millis(self.alert_poll_interval_ms)
    }

    pub fn validate(&self) -> RiskResult<()> {
        self.engine.validate()?;
        self.var.validate()?;
        if self.var_update_interval_secs == 0
            || self.metrics_update_interval_secs == 0
            || self.alert_poll_interval_ms == 0
        {
            return Err(config_error!("service loop intervals must be positive"));
        }
        let bounded = [
            ("var_update_interval_secs", self.var_update_interval_secs),
            ("metrics_update_interval_secs", self.metrics_update_interval_secs),
            ("alert_poll_interval_ms", self.alert_poll_interval_ms / 1_000),
        ];
        for (name, secs) in bounded {
            if secs > MAX_DURATION_SECS {
                return Err(config_error!("{name} must span at most {MAX_DURATION_SECS}s"));
            }
        }
        if self.max_portfolios == 0 {
            return Err(config_error!("max_portfolios must be positive"));
        }
        if self.var_history_size < 2 {
            return Err(config_error!(
                "var_history_size must be at least 2, got {}",
                self.var_history_size
            ));
        }
        Ok(())
    }
}
