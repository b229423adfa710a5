//! Portfolio and position risk tracking.
//!
//! Aggregates use checked arithmetic: an update whose totals do not fit in a
//! [`Decimal`] is refused with [`RiskError::Overflow`] and leaves the
//! portfolio as it was. Ratios that overflow saturate instead.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use rg_types::errors::{RiskError, RiskResult};

use crate::compliance::ComplianceStatus;
use crate::monitor::RiskMetrics;
use crate::var::{VaRResult, ValuePoint};

/// Per-symbol exposure inside a portfolio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionRisk {
    pub symbol: String,
    /// Signed: negative for shorts.
    pub quantity: Decimal,
    pub average_price: Decimal,
    pub current_price: Decimal,
    /// Signed market value (`quantity * current_price`).
    pub market_value: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub daily_pnl: Decimal,
    pub volatility: f64,
    pub beta: f64,
    pub var: Decimal,
    /// Share of portfolio gross exposure (0–1).
    pub risk_contribution: f64,
}

impl PositionRisk {
    pub fn new(symbol: &str, quantity: Decimal, average_price: Decimal, current_price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity,
            average_price,
            current_price,
            market_value: quantity.saturating_mul(current_price),
            unrealized_pnl: current_price.saturating_sub(average_price).saturating_mul(quantity),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioRisk {
    pub portfolio_id: String,
    pub strategy_id: String,
    pub name: String,
    /// ID of the engine monitor mirroring this portfolio.
    pub monitor_id: String,
    /// Always `cash + sum(position.market_value)`.
    pub total_value: Decimal,
    pub cash: Decimal,
    pub positions: HashMap<String, PositionRisk>,
    pub metrics: RiskMetrics,
    pub var_result: Option<VaRResult>,
    /// Composite score in `[0, 100]`.
    pub risk_score: f64,
    pub compliance_status: ComplianceStatus,
    /// High-water mark of `total_value`.
    pub peak_value: Decimal,
    /// Time-ordered total values, bounded by the service's history size.
    pub value_history: Vec<ValuePoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PortfolioRisk {
    pub fn new(portfolio_id: &str, strategy_id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            portfolio_id: portfolio_id.to_string(),
            strategy_id: strategy_id.to_string(),
            name: name.to_string(),
            monitor_id: format!("portfolio:{portfolio_id}"),
            total_value: Decimal::ZERO,
            cash: Decimal::ZERO,
            positions: HashMap::new(),
            metrics: RiskMetrics::default(),
            var_result: None,
            risk_score: 0.0,
            compliance_status: ComplianceStatus::Compliant,
            peak_value: Decimal::ZERO,
            value_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace positions and cash, then recompute every derived field.
    pub fn apply_update(
        &mut self,
        positions: HashMap<String, PositionRisk>,
        cash: Decimal,
        history_size: usize,
        now: DateTime<Utc>,
    ) -> RiskResult<()> {
        let totals = Totals::compute(&positions, cash)?;
        self.positions = positions;
        self.cash = cash;
        self.apply_totals(totals);

        self.value_history.push(ValuePoint::new(now, self.total_value));
        if self.value_history.len() > history_size {
            let excess = self.value_history.len() - history_size;
            self.value_history.drain(..excess);
        }

        self.risk_score = portfolio_risk_score(self);
        self.updated_at = now;
        Ok(())
    }

    /// Store a fresh VaR estimate and spread it over positions by exposure.
    pub fn apply_var(&mut self, result: VaRResult) {
        self.metrics.var = result.var;
        for position in self.positions.values_mut() {
            position.var = Decimal::from_f64_retain(position.risk_contribution)
                .map(|share| share.saturating_mul(result.var))
                .unwrap_or_default();
        }
        self.var_result = Some(result);
        self.risk_score = portfolio_risk_score(self);
    }

    pub fn recompute_metrics(&mut self) -> RiskResult<()> {
        let totals = Totals::compute(&self.positions, self.cash)?;
        self.apply_totals(totals);
        Ok(())
    }

    fn apply_totals(&mut self, totals: Totals) {
        let gross = totals.gross;
        self.total_value = totals.total_value;
        for position in self.positions.values_mut() {
            position.risk_contribution = if gross.is_zero() {
                0.0
            } else {
                (position.market_value.abs() / gross).to_f64().unwrap_or(0.0)
            };
        }

        if self.total_value > self.peak_value {
            self.peak_value = self.total_value;
        }
        let current_drawdown = if self.peak_value > Decimal::ZERO {
            self.peak_value
                .saturating_sub(self.total_value)
                .checked_div(self.peak_value)
                .unwrap_or(Decimal::MAX)
                .max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        let m = &mut self.metrics;
        m.total_exposure = gross;
        m.gross_exposure = gross;
        m.net_exposure = totals.market_value;
        m.unrealized_pnl = totals.unrealized_pnl;
        m.realized_pnl = totals.realized_pnl;
        m.daily_pnl = totals.daily_pnl;
        m.leverage = if self.total_value > Decimal::ZERO {
            gross.checked_div(self.total_value).unwrap_or(Decimal::MAX)
        } else {
            Decimal::ZERO
        };
        m.cash_balance = self.cash;
        m.position_count = self.positions.len();
        m.current_drawdown = current_drawdown;
        m.max_drawdown = m.max_drawdown.max(current_drawdown);
    }
}

/// Portfolio-wide sums, computed before any field is touched.
struct Totals {
    market_value: Decimal,
    total_value: Decimal,
    gross: Decimal,
    unrealized_pnl: Decimal,
    realized_pnl: Decimal,
    daily_pnl: Decimal,
}

impl Totals {
    fn compute(positions: &HashMap<String, PositionRisk>, cash: Decimal) -> RiskResult<Self> {
        let market_value = checked_sum(positions.values().map(|p| p.market_value), "market value")?;
        let total_value = cash
            .checked_add(market_value)
            .ok_or_else(|| overflow("total value"))?;
        Ok(Self {
            market_value,
            total_value,
            gross: checked_sum(positions.values().map(|p| p.market_value.abs()), "gross exposure")?,
            unrealized_pnl: checked_sum(positions.values().map(|p| p.unrealized_pnl), "unrealized pnl")?,
            realized_pnl: checked_sum(positions.values().map(|p| p.realized_pnl), "realized pnl")?,
            daily_pnl: checked_sum(positions.values().map(|p| p.daily_pnl), "daily pnl")?,
        })
    }
}

fn checked_sum(mut values: impl Iterator<Item = Decimal>, what: &str) -> RiskResult<Decimal> {
    values
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
        .ok_or_else(|| overflow(what))
}

fn overflow(what: &str) -> RiskError {
    RiskError::Overflow {
        context: format!("portfolio {what} exceeds the decimal range"),
    }
}

/// Portfolio risk score in `[0, 100]`: leverage above 2x, fewer than five
/// positions, drawdown above 10% and VaR above 5% of value each add a penalty.
pub fn portfolio_risk_score(portfolio: &PortfolioRisk) -> f64 {
    let m = &portfolio.metrics;
    let mut score = 0.0;

    let leverage = m.leverage.to_f64().unwrap_or(0.0);
    if leverage > 2.0 {
        score += leverage * 10.0;
    }

    if portfolio.positions.len() < 5 {
        score += 20.0;
    }

    let drawdown = m.current_drawdown.to_f64().unwrap_or(0.0);
    if drawdown > 0.10 {
        score += drawdown * 100.0;
    }

    if portfolio.total_value > Decimal::ZERO {
        let var_ratio = m
            .var
            .checked_div(portfolio.total_value)
            .map_or(f64::INFINITY, |r| r.to_f64().unwrap_or(0.0));
        if var_ratio > 0.05 {
            score += var_ratio * 200.0;
        }
    }

    clamp_score(score)
}

/// Clamp to `[0, 100]`; non-finite input saturates at 100.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 100.0;
    }
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn positions(entries: &[(&str, Decimal, Decimal)]) -> HashMap<String, PositionRisk> {
        entries
            .iter()
            .map(|(sym, qty, px)| (sym.to_string(), PositionRisk::new(sym, *qty, *px, *px)))
            .collect()
    }

    #[test]
    fn total_value_is_cash_plus_market_value() {
        let mut p = PortfolioRisk::new("p1", "s1", "Main");
        p.apply_update(
            positions(&[("BTCUSDT", dec!(1), dec!(60_000)), ("ETHUSDT", dec!(-10), dec!(3_000))]),
            dec!(20_000),
            100,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(p.total_value, dec!(50_000));
        assert_eq!(p.metrics.total_exposure, dec!(90_000));
        assert_eq!(p.metrics.net_exposure, dec!(30_000));
        assert_eq!(p.metrics.leverage, dec!(1.8));
        assert_eq!(p.metrics.position_count, 2);
    }

    #[test]
    fn drawdown_tracks_peak() {
        let mut p = PortfolioRisk::new("p1", "s1", "Main");
        p.apply_update(HashMap::new(), dec!(100_000), 100, Utc::now()).unwrap();
        p.apply_update(HashMap::new(), dec!(80_000), 100, Utc::now()).unwrap();
        assert_eq!(p.peak_value, dec!(100_000));
        assert_eq!(p.metrics.current_drawdown, dec!(0.2));
        p.apply_update(HashMap::new(), dec!(90_000), 100, Utc::now()).unwrap();
        assert_eq!(p.metrics.current_drawdown, dec!(0.1));
        assert_eq!(p.metrics.max_drawdown, dec!(0.2));
    }

    #[test]
    fn history_is_bounded() {
        let mut p = PortfolioRisk::new("p1", "s1", "Main");
        for i in 0..10 {
            p.apply_update(HashMap::new(), Decimal::from(1_000 + i), 4, Utc::now()).unwrap();
        }
        assert_eq!(p.value_history.len(), 4);
        assert_eq!(p.value_history[3].value, dec!(1_009));
    }

    #[test]
    fn concentration_penalty_only() {
        let mut p = PortfolioRisk::new("p1", "s1", "Main");
        p.apply_update(positions(&[("BTCUSDT", dec!(1), dec!(1_000))]), dec!(9_000), 10, Utc::now())
            .unwrap();
        assert_eq!(p.risk_score, 20.0);
    }

    #[test]
    fn all_penalties_saturate_at_100() {
        let mut p = PortfolioRisk::new("p1", "s1", "Main");
        p.total_value = dec!(1_000);
        p.metrics.leverage = dec!(8);
        p.metrics.current_drawdown = dec!(0.5);
        p.metrics.var = dec!(500);
        assert_eq!(portfolio_risk_score(&p), 100.0);
    }

    #[test]
    fn diversified_low_leverage_scores_zero() {
        let mut p = PortfolioRisk::new("p1", "s1", "Main");
        let entries: Vec<(String, Decimal, Decimal)> = (0..5)
            .map(|i| (format!("SYM{i}"), dec!(1), dec!(100)))
            .collect();
        let map = entries
            .iter()
            .map(|(s, q, px)| (s.clone(), PositionRisk::new(s, *q, *px, *px)))
            .collect();
        p.apply_update(map, dec!(10_000), 10, Utc::now()).unwrap();
        assert_eq!(p.risk_score, 0.0);
    }

    #[test]
    fn var_is_spread_by_contribution() {
        let mut p = PortfolioRisk::new("p1", "s1", "Main");
        p.apply_update(
            positions(&[("A", dec!(3), dec!(100)), ("B", dec!(1), dec!(100))]),
            dec!(0),
            10,
            Utc::now(),
        )
        .unwrap();
        let result = VaRResult {
            method: crate::var::VaRMethod::Historical,
            confidence_level: 0.95,
            time_horizon_days: 1,
            var: dec!(40),
            expected_shortfall: dec!(50),
            portfolio_value: dec!(400),
            volatility: 0.02,
            sample_size: 10,
            timestamp: Utc::now(),
        };
        p.apply_var(result);
        assert_eq!(p.metrics.var, dec!(40));
        assert_eq!(p.positions["A"].var, dec!(30));
        assert_eq!(p.positions["B"].var, dec!(10));
        // 40 / 400 = 10% > 5%: 20 + 20
        assert!((p.risk_score - 40.0).abs() < 1e-9);
    }

    #[test]
    fn overflowing_update_is_refused_without_changes() {
        let mut p = PortfolioRisk::new("p1", "s1", "Main");
        p.apply_update(positions(&[("BTCUSDT", dec!(1), dec!(100))]), dec!(900), 10, Utc::now())
            .unwrap();
        let before = p.clone();

        let huge = positions(&[("A", dec!(1), Decimal::MAX), ("B", dec!(1), Decimal::MAX)]);
        let err = p.apply_update(huge, dec!(0), 10, Utc::now()).unwrap_err();
        assert!(matches!(err, RiskError::Overflow { .. }));
        p.apply_update(HashMap::new(), Decimal::MAX, 10, Utc::now()).unwrap();
        let err = p
            .apply_update(positions(&[("A", dec!(1), dec!(1))]), Decimal::MAX, 10, Utc::now())
            .unwrap_err();
        assert!(matches!(err, RiskError::Overflow { .. }));

        // Only the successful cash-only update landed.
        assert_eq!(p.total_value, Decimal::MAX);
        assert_eq!(p.value_history.len(), before.value_history.len() + 1);
    }

    #[test]
    fn extreme_position_values_saturate() {
        let p = PositionRisk::new("BTCUSDT", Decimal::MAX, Decimal::MIN, Decimal::MAX);
        assert_eq!(p.market_value, Decimal::MAX);
        assert_eq!(p.unrealized_pnl, Decimal::MAX);

        let mut p = PortfolioRisk::new("p1", "s1", "Main");
        p.apply_update(positions(&[("A", dec!(1), Decimal::MAX)]), Decimal::MIN + dec!(1), 10, Utc::now())
            .unwrap();
        // total_value is 1: leverage saturates rather than panicking.
        assert_eq!(p.total_value, dec!(1));
        assert_eq!(p.metrics.leverage, Decimal::MAX);
        assert_eq!(p.risk_score, 100.0);
    }

    #[test]
    fn clamp_handles_non_finite() {
        assert_eq!(clamp_score(f64::NAN), 100.0);
        assert_eq!(clamp_score(f64::INFINITY), 100.0);
        assert_eq!(clamp_score(-5.0), 0.0);
    }
}
