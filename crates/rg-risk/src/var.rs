//! Value-at-Risk and stress testing.
//!
//! [`VaRCalculator`] is stateless apart from its configuration: it derives
//! simple returns from a time-ordered value series and estimates VaR and
//! Expected Shortfall by one of four [`VaRMethod`]s. Statistics run in `f64`;
//! monetary results are converted back to `Decimal`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use rg_types::config_error;
use rg_types::errors::{RiskError, RiskResult};

use crate::portfolio::PortfolioRisk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VaRMethod {
    Historical,
    Parametric,
    MonteCarlo,
    Ewma,
}

impl fmt::Display for VaRMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VaRMethod::Historical => "historical",
            VaRMethod::Parametric => "parametric",
            VaRMethod::MonteCarlo => "monte_carlo",
            VaRMethod::Ewma => "ewma",
        };
        f.write_str(s)
    }
}

impl FromStr for VaRMethod {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "historical" => Ok(VaRMethod::Historical),
            "parametric" | "variance_covariance" => Ok(VaRMethod::Parametric),
            "monte_carlo" | "montecarlo" => Ok(VaRMethod::MonteCarlo),
            "ewma" => Ok(VaRMethod::Ewma),
            other => Err(RiskError::UnsupportedMethod {
                method: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaRConfig {
    pub method: VaRMethod,
    pub confidence_level: f64,
    pub time_horizon_days: u32,
    /// EWMA decay factor (lambda).
    pub decay_factor: f64,
    pub monte_carlo_sims: usize,
    /// Fixed seed for reproducible Monte Carlo runs.
    pub monte_carlo_seed: Option<u64>,
}

impl Default for VaRConfig {
    fn default() -> Self {
        Self {
            method: VaRMethod::Historical,
            confidence_level: 0.95,
            time_horizon_days: 1,
            decay_factor: 0.94,
            monte_carlo_sims: 10_000,
            monte_carlo_seed: None,
        }
    }
}

impl VaRConfig {
    pub fn validate(&self) -> RiskResult<()> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(config_error!(
                "confidence_level must be in (0, 1), got {}",
                self.confidence_level
            ));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
            return Err(config_error!(
                "decay_factor must be in (0, 1), got {}",
                self.decay_factor
            ));
        }
        if self.time_horizon_days == 0 {
            return Err(config_error!("time_horizon_days must be positive"));
        }
        if self.monte_carlo_sims == 0 {
            return Err(config_error!("monte_carlo_sims must be positive"));
        }
        Ok(())
    }
}

/// One observation of portfolio value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValuePoint {
    pub timestamp: DateTime<Utc>,
    pub value: Decimal,
}

impl ValuePoint {
    pub fn new(timestamp: DateTime<Utc>, value: Decimal) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaRResult {
    pub method: VaRMethod,
    pub confidence_level: f64,
    pub time_horizon_days: u32,
    /// Loss threshold as a positive amount.
    pub var: Decimal,
    pub expected_shortfall: Decimal,
    pub portfolio_value: Decimal,
    /// Standard deviation of the returns used.
    pub volatility: f64,
    pub sample_size: usize,
    pub timestamp: DateTime<Utc>,
}

/// Named shock definition. Shocks are fractional price moves, e.g. `-0.2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressTestScenario {
    pub name: String,
    pub description: String,
    /// Applied to every symbol without its own override.
    pub market_shock: f64,
    pub symbol_shocks: HashMap<String, f64>,
}

impl StressTestScenario {
    pub fn market_wide(name: &str, shock: f64) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            market_shock: shock,
            symbol_shocks: HashMap::new(),
        }
    }

    pub fn with_symbol_shock(mut self, symbol: &str, shock: f64) -> Self {
        self.symbol_shocks.insert(symbol.to_string(), shock);
        self
    }

    pub fn shock_for(&self, symbol: &str) -> f64 {
        self.symbol_shocks
            .get(symbol)
            .copied()
            .unwrap_or(self.market_shock)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressTestResult {
    pub scenario_name: String,
    pub portfolio_value: Decimal,
    pub stressed_value: Decimal,
    /// Positive for a loss, negative for a gain.
    pub total_loss: Decimal,
    pub loss_pct: f64,
    pub position_losses: HashMap<String, Decimal>,
    pub timestamp: DateTime<Utc>,
}

pub struct VaRCalculator {
    config: VaRConfig,
}

impl VaRCalculator {
    pub fn new(config: VaRConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VaRConfig {
        &self.config
    }

    /// VaR with the configured default method.
    pub fn calculate(&self, series: &[ValuePoint]) -> RiskResult<VaRResult> {
        self.calculate_var(series, self.config.method)
    }

    /// Method given by name, e.g. from a request parameter.
    pub fn calculate_var_named(&self, series: &[ValuePoint], method: &str) -> RiskResult<VaRResult> {
        self.calculate_var(series, method.parse()?)
    }

    pub fn calculate_var(&self, series: &[ValuePoint], method: VaRMethod) -> RiskResult<VaRResult> {
        let returns = returns_from_series(series)?;
        let portfolio_value = series
            .iter()
            .max_by_key(|p| p.timestamp)
            .map(|p| p.value)
            .unwrap_or(Decimal::ZERO);
        let value_f = portfolio_value.to_f64().unwrap_or(0.0);

        let confidence = self.config.confidence_level;
        let (mean, std_dev) = mean_std(&returns);

        let (var_frac, es_frac, volatility) = match method {
            VaRMethod::Historical => {
                let (v, es) = historical_var(&returns, confidence);
                (v, es, std_dev)
            }
            VaRMethod::Parametric => {
                let (v, es) = parametric_var(mean, std_dev, confidence);
                (v, es, std_dev)
            }
            VaRMethod::MonteCarlo => {
                let simulated = self.simulate_returns(mean, std_dev)?;
                let (v, es) = historical_var(&simulated, confidence);
                (v, es, std_dev)
            }
            VaRMethod::Ewma => {
                let sigma = ewma_volatility(&returns, self.config.decay_factor);
                let (v, es) = ewma_var(sigma, confidence);
                (v, es, sigma)
            }
        };

        let horizon_scale = f64::from(self.config.time_horizon_days.max(1)).sqrt();
        let var = to_decimal(var_frac * value_f * horizon_scale);
        let expected_shortfall = to_decimal(es_frac * value_f * horizon_scale);

        debug!(
            method = %method,
            samples = returns.len(),
            var = %var,
            es = %expected_shortfall,
            "VaR computed"
        );

        Ok(VaRResult {
            method,
            confidence_level: confidence,
            time_horizon_days: self.config.time_horizon_days,
            var,
            expected_shortfall,
            portfolio_value,
            volatility,
            sample_size: returns.len(),
            timestamp: Utc::now(),
        })
    }

    fn simulate_returns(&self, mean: f64, std_dev: f64) -> RiskResult<Vec<f64>> {
        let normal = Normal::new(mean, std_dev).map_err(|e| {
            RiskError::Internal(format!("invalid normal parameters ({mean}, {std_dev}): {e}"))
        })?;
        let n = self.config.monte_carlo_sims;
        let sample: Vec<f64> = match self.config.monte_carlo_seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                normal.sample_iter(&mut rng).take(n).collect()
            }
            None => normal.sample_iter(rand::rng()).take(n).collect(),
        };
        Ok(sample)
    }

    /// Apply each scenario to the portfolio's positions. Scenarios that fail
    /// validation are logged and skipped.
    pub fn run_stress_test(
        &self,
        portfolio: &PortfolioRisk,
        scenarios: &[StressTestScenario],
    ) -> Vec<StressTestResult> {
        scenarios
            .iter()
            .filter_map(|scenario| match stress_scenario(portfolio, scenario) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(
                        portfolio = %portfolio.portfolio_id,
                        scenario = %scenario.name,
                        error = %e,
                        "skipping stress scenario"
                    );
                    None
                }
            })
            .collect()
    }
}

fn stress_scenario(
    portfolio: &PortfolioRisk,
    scenario: &StressTestScenario,
) -> RiskResult<StressTestResult> {
    let invalid = |message: String| RiskError::InvalidScenario {
        scenario: scenario.name.clone(),
        message,
    };

    let mut position_losses = HashMap::with_capacity(portfolio.positions.len());
    let mut total_loss = Decimal::ZERO;

    for (symbol, position) in &portfolio.positions {
        let shock = scenario.shock_for(symbol);
        if !shock.is_finite() || shock < -1.0 {
            return Err(invalid(format!("shock {shock} for {symbol} is out of range")));
        }
        let shock_dec = Decimal::from_f64(shock)
            .ok_or_else(|| invalid(format!("shock {shock} is not representable")))?;
        let loss = position
            .market_value
            .checked_mul(shock_dec)
            .map(|gain| -gain)
            .ok_or_else(|| invalid(format!("loss on {symbol} exceeds the decimal range")))?;
        total_loss = total_loss
            .checked_add(loss)
            .ok_or_else(|| invalid("total loss exceeds the decimal range".to_string()))?;
        position_losses.insert(symbol.clone(), loss);
    }

    let stressed_value = portfolio
        .total_value
        .checked_sub(total_loss)
        .ok_or_else(|| invalid("stressed value exceeds the decimal range".to_string()))?;
    let loss_pct = if portfolio.total_value.is_zero() {
        0.0
    } else {
        total_loss
            .checked_div(portfolio.total_value)
            .map_or(f64::INFINITY, |r| r.to_f64().unwrap_or(0.0))
    };

    Ok(StressTestResult {
        scenario_name: scenario.name.clone(),
        portfolio_value: portfolio.total_value,
        stressed_value,
        total_loss,
        loss_pct,
        position_losses,
        timestamp: Utc::now(),
    })
}

/// Simple returns between consecutive points of a series, ordered by time.
/// Steps starting from a zero value are skipped.
pub fn returns_from_series(series: &[ValuePoint]) -> RiskResult<Vec<f64>> {
    let mut ordered = series.to_vec();
    ordered.sort_by_key(|p| p.timestamp);

    let returns: Vec<f64> = ordered
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].value.to_f64()?;
            let curr = w[1].value.to_f64()?;
            (prev != 0.0).then(|| (curr - prev) / prev)
        })
        .collect();

    if returns.is_empty() {
        return Err(RiskError::InsufficientData {
            message: format!("{} value points yield no returns", series.len()),
        });
    }
    Ok(returns)
}

/// Historical-simulation VaR and ES as fractions of portfolio value.
pub fn historical_var(returns: &[f64], confidence: f64) -> (f64, f64) {
    if returns.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let alpha = 1.0 - confidence;
    let n = sorted.len();
    // Nudge so that e.g. 0.1 * 10 lands on 1, not 0.999...
    let index = ((alpha * n as f64 + 1e-9).floor() as usize).min(n - 1);
    let var = -sorted[index];

    let tail = &sorted[..index];
    let es = if tail.is_empty() {
        var
    } else {
        -(tail.iter().sum::<f64>() / tail.len() as f64)
    };
    (var, es)
}

/// Variance-covariance VaR and ES as fractions of portfolio value.
pub fn parametric_var(mean: f64, std_dev: f64, confidence: f64) -> (f64, f64) {
    let z = z_score(confidence);
    let alpha = 1.0 - confidence;
    let var = -(mean + z * std_dev);
    let es = std_dev * normal_pdf(z) / alpha - mean;
    (var, es)
}

/// `v_t = lambda * v_{t-1} + (1 - lambda) * r_t^2`, seeded with the first
/// squared return.
pub fn ewma_volatility(returns: &[f64], lambda: f64) -> f64 {
    let Some((first, rest)) = returns.split_first() else {
        return 0.0;
    };
    let variance = rest
        .iter()
        .fold(first * first, |v, r| lambda * v + (1.0 - lambda) * r * r);
    variance.sqrt()
}

pub fn ewma_var(sigma: f64, confidence: f64) -> (f64, f64) {
    let z = z_score(confidence);
    let alpha = 1.0 - confidence;
    (-z * sigma, sigma * normal_pdf(z) / alpha)
}

/// Lower-tail z-score for the supported confidence levels; anything else
/// falls back to the 95% value.
pub fn z_score(confidence: f64) -> f64 {
    const TABLE: [(f64, f64); 4] = [(0.99, -2.326), (0.975, -1.96), (0.95, -1.645), (0.90, -1.282)];
    TABLE
        .iter()
        .find(|(c, _)| (confidence - c).abs() < 1e-9)
        .map(|(_, z)| *z)
        .unwrap_or(-1.645)
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Sample mean and standard deviation (n - 1 denominator).
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

fn to_decimal(x: f64) -> Decimal {
    Decimal::from_f64_retain(x).unwrap_or_default()
}
