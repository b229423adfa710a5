//! Risk management service: the facade the order path calls before any
//! order goes out.
//!
//! Composes the [`RiskEngine`] and [`VaRCalculator`] with a portfolio map.
//! [`RiskManagementService::check_risk`] always returns a full
//! [`RiskCheckResponse`]; callers must treat `approved == false` as a hard
//! block. A check commits to the engine (order-rate window, half-open
//! trials) only once compliance has also passed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use rg_types::errors::{RiskError, RiskResult};
use rg_types::limits::{GlobalRiskLimits, RiskLimits};
use rg_types::signal::TradingSignal;
use rg_types::violation::RiskViolation;

use crate::alerts::RiskAlert;
use crate::circuit_breaker::BlockingBreaker;
use crate::compliance::{ComplianceChecker, ComplianceStatus};
use crate::config::RiskServiceConfig;
use crate::engine::{RiskEngine, GLOBAL_MONITOR_ID};
use crate::monitor::{MonitorType, RiskMetrics, RiskMonitor};
use crate::portfolio::{clamp_score, PortfolioRisk, PositionRisk};
use crate::tasks::TaskGroup;
use crate::var::{StressTestResult, StressTestScenario, VaRCalculator, VaRMethod, VaRResult};

/// Signals above this notional pick up a flat score penalty.
const LARGE_NOTIONAL: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheckRequest {
    pub signal: TradingSignal,
    /// Empty when the signal is not tied to a tracked portfolio.
    pub portfolio_id: String,
    pub strategy_id: String,
}

impl RiskCheckRequest {
    pub fn new(signal: TradingSignal, portfolio_id: &str) -> Self {
        let strategy_id = signal.strategy_id.clone();
        Self {
            signal,
            portfolio_id: portfolio_id.to_string(),
            strategy_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheckResponse {
    pub request_id: Uuid,
    pub signal_id: Uuid,
    pub approved: bool,
    /// Composite score in `[0, 100]`.
    pub risk_score: f64,
    pub violations: Vec<RiskViolation>,
    /// Governing breakers that refused the signal.
    pub open_circuit_breakers: Vec<BlockingBreaker>,
    pub compliance_status: ComplianceStatus,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl RiskCheckResponse {
    fn approved_for(signal: &TradingSignal, now: DateTime<Utc>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            signal_id: signal.id,
            approved: true,
            risk_score: 0.0,
            violations: Vec::new(),
            open_circuit_breakers: Vec::new(),
            compliance_status: ComplianceStatus::Compliant,
            warnings: Vec::new(),
            timestamp: now,
        }
    }
}

/// Aggregate over every tracked portfolio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_value: Decimal,
    pub total_cash: Decimal,
    pub total_exposure: Decimal,
    pub net_exposure: Decimal,
    pub daily_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub total_var: Decimal,
    pub max_drawdown: Decimal,
    pub portfolio_count: usize,
    pub position_count: usize,
    pub average_risk_score: f64,
    pub max_risk_score: f64,
    pub active_monitors: usize,
    pub open_circuit_breakers: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub total_checks: u64,
    pub approved_checks: u64,
    pub rejected_checks: u64,
    pub violations: u64,
    pub portfolios: usize,
    pub alerts_processed: u64,
    pub var_calculations: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: i64,
}

#[derive(Default)]
struct Counters {
    total_checks: AtomicU64,
    approved_checks: AtomicU64,
    rejected_checks: AtomicU64,
    violations: AtomicU64,
    alerts_processed: AtomicU64,
    var_calculations: AtomicU64,
}

pub struct RiskManagementService {
    config: RiskServiceConfig,
    engine: Arc<RiskEngine>,
    var_calculator: VaRCalculator,
    portfolios: RwLock<HashMap<String, PortfolioRisk>>,
    global_metrics: RwLock<GlobalMetrics>,
    recent_alerts: Mutex<VecDeque<RiskAlert>>,
    compliance: Option<Arc<dyn ComplianceChecker>>,
    counters: Counters,
    started_at: RwLock<Option<DateTime<Utc>>>,
    tasks: TaskGroup,
}

impl RiskManagementService {
    /// Build the service and register the global monitor with the engine.
    pub fn new(config: RiskServiceConfig) -> RiskResult<Self> {
        config.validate()?;
        let engine = Arc::new(RiskEngine::new(config.engine.clone())?);
        engine.register_monitor(RiskMonitor::new(
            GLOBAL_MONITOR_ID,
            MonitorType::Global,
            GLOBAL_MONITOR_ID,
            RiskLimits::from(&config.engine.global_limits),
        ))?;

        Ok(Self {
            var_calculator: VaRCalculator::new(config.var.clone()),
            engine,
            portfolios: RwLock::new(HashMap::new()),
            global_metrics: RwLock::new(GlobalMetrics::default()),
            recent_alerts: Mutex::new(VecDeque::new()),
            compliance: None,
            counters: Counters::default(),
            started_at: RwLock::new(None),
            tasks: TaskGroup::new("risk-service"),
            config,
        })
    }

    pub fn with_compliance(mut self, checker: Arc<dyn ComplianceChecker>) -> Self {
        self.compliance = Some(checker);
        self
    }

    pub fn engine(&self) -> &Arc<RiskEngine> {
        &self.engine
    }

    pub fn config(&self) -> &RiskServiceConfig {
        &self.config
    }

    /// Replace global limits and keep the global monitor's limits in step.
    pub fn set_global_limits(&self, limits: GlobalRiskLimits) -> RiskResult<()> {
        self.engine
            .update_limits(GLOBAL_MONITOR_ID, RiskLimits::from(&limits))?;
        self.engine.set_global_limits(limits);
        Ok(())
    }

    // ---- lifecycle ----

    pub fn start(self: &Arc<Self>) {
        *self.started_at.write() = Some(Utc::now());
        self.engine.start();

        if self.config.enable_var_calculation {
            let service = Arc::clone(self);
            self.tasks
                .spawn_periodic("var_update", self.config.var_update_interval(), move || {
                    let service = Arc::clone(&service);
                    async move {
                        service.recalculate_var();
                    }
                });
        }

        let service = Arc::clone(self);
        self.tasks.spawn_periodic(
            "global_metrics",
            self.config.metrics_update_interval(),
            move || {
                let service = Arc::clone(&service);
                async move {
                    service.refresh_global_metrics();
                }
            },
        );

        let service = Arc::clone(self);
        self.tasks
            .spawn_periodic("alert_processing", self.config.alert_poll_interval(), move || {
                let service = Arc::clone(&service);
                async move {
                    service.process_pending_alerts();
                }
            });

        info!(
            var_enabled = self.config.enable_var_calculation,
            max_portfolios = self.config.max_portfolios,
            "risk management service started"
        );
    }

    /// Stop every loop, then flush alerts still queued in the engine.
    pub async fn stop(&self) {
        self.tasks.shutdown().await;
        self.engine.stop().await;
        let flushed = self.process_pending_alerts();
        info!(flushed, "risk management service stopped");
    }

    // ---- checks ----

    pub fn check_risk(&self, request: &RiskCheckRequest) -> RiskCheckResponse {
        self.check_risk_at(request, Utc::now())
    }

    pub fn check_risk_at(&self, request: &RiskCheckRequest, now: DateTime<Utc>) -> RiskCheckResponse {
        let signal = &request.signal;
        let mut response = RiskCheckResponse::approved_for(signal, now);
        self.counters.total_checks.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.engine.evaluate_signal_at(signal, now) {
            self.reject(&mut response, e);
        }

        response.open_circuit_breakers = self.engine.blocking_breakers_at(signal, now);
        if !response.open_circuit_breakers.is_empty() {
            response.approved = false;
        }

        if let Some(checker) = &self.compliance {
            match checker.check_compliance(request) {
                Ok(status) => {
                    if !status.is_compliant() {
                        response.approved = false;
                    }
                    response.compliance_status = status;
                }
                Err(e) => {
                    warn!(signal = %signal.id, error = %e, "compliance check failed, continuing without it");
                    response.compliance_status = ComplianceStatus::Unknown;
                    response.warnings.push(format!("compliance check failed: {e}"));
                }
            }
        }

        let portfolio_score = if request.portfolio_id.is_empty() {
            None
        } else {
            let score = self
                .portfolios
                .read()
                .get(&request.portfolio_id)
                .map(|p| p.risk_score);
            if score.is_none() {
                response
                    .warnings
                    .push(format!("unknown portfolio {}", request.portfolio_id));
            }
            score
        };
        response.risk_score = composite_risk_score(signal, portfolio_score);

        // Every veto has passed; count the order and claim any trials.
        if response.approved {
            if let Err(e) = self.engine.commit_signal_at(signal, now) {
                self.reject(&mut response, e);
            }
        }

        if response.approved {
            self.counters.approved_checks.fetch_add(1, Ordering::Relaxed);
            debug!(signal = %signal.id, score = response.risk_score, "risk check approved");
        } else {
            self.counters.rejected_checks.fetch_add(1, Ordering::Relaxed);
            info!(
                signal = %signal.id,
                strategy = %request.strategy_id,
                symbol = %signal.symbol,
                violations = response.violations.len(),
                breakers = response.open_circuit_breakers.len(),
                "risk check rejected"
            );
        }
        response
    }

    fn reject(&self, response: &mut RiskCheckResponse, error: RiskError) {
        response.approved = false;
        match error {
            RiskError::Violation(violation) => {
                self.counters.violations.fetch_add(1, Ordering::Relaxed);
                response.violations.push(*violation);
            }
            other => response.warnings.push(other.to_string()),
        }
    }

    /// Report how an approved order fared at the exchange. Failures count
    /// toward tripping the breakers that govern the signal.
    pub fn record_execution_outcome(&self, signal: &TradingSignal, success: bool) {
        self.engine.record_outcome(signal, success);
        if !success {
            debug!(signal = %signal.id, symbol = %signal.symbol, "execution failure recorded");
        }
    }

    // ---- portfolios ----

    pub fn register_portfolio(&self, id: &str, strategy_id: &str, name: &str) -> RiskResult<()> {
        let mut portfolios = self.portfolios.write();
        if portfolios.len() >= self.config.max_portfolios {
            return Err(RiskError::MaxPortfoliosReached {
                max: self.config.max_portfolios,
            });
        }
        if portfolios.contains_key(id) {
            return Err(RiskError::DuplicatePortfolio {
                portfolio_id: id.to_string(),
            });
        }

        let portfolio = PortfolioRisk::new(id, strategy_id, name);
        self.engine.register_monitor(RiskMonitor::new(
            &portfolio.monitor_id,
            MonitorType::Portfolio,
            id,
            self.config.portfolio_limits.clone(),
        ))?;
        portfolios.insert(id.to_string(), portfolio);

        info!(portfolio = %id, strategy = %strategy_id, "portfolio registered");
        Ok(())
    }

    /// Replace a portfolio's positions and cash, recompute its metrics and
    /// push them to its engine monitor.
    pub fn update_portfolio(
        &self,
        id: &str,
        positions: Vec<PositionRisk>,
        cash: Decimal,
    ) -> RiskResult<()> {
        let positions: HashMap<String, PositionRisk> = positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let (monitor_id, metrics) = {
            let mut portfolios = self.portfolios.write();
            let portfolio = portfolios
                .get_mut(id)
                .ok_or_else(|| RiskError::PortfolioNotFound {
                    portfolio_id: id.to_string(),
                })?;
            portfolio.apply_update(positions, cash, self.config.var_history_size, Utc::now())?;
            debug!(
                portfolio = %id,
                total_value = %portfolio.total_value,
                score = portfolio.risk_score,
                "portfolio updated"
            );
            (portfolio.monitor_id.clone(), portfolio.metrics.clone())
        };

        self.engine.update_metrics(&monitor_id, metrics)
    }

    pub fn get_portfolio_risk(&self, id: &str) -> RiskResult<PortfolioRisk> {
        self.portfolios
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RiskError::PortfolioNotFound {
                portfolio_id: id.to_string(),
            })
    }

    pub fn portfolio_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.portfolios.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// On-demand VaR over a portfolio's value history.
    pub fn calculate_portfolio_var(&self, id: &str, method: VaRMethod) -> RiskResult<VaRResult> {
        let history = self.get_portfolio_risk(id)?.value_history;
        let result = self.var_calculator.calculate_var(&history, method)?;
        self.counters.var_calculations.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    pub fn run_stress_test(
        &self,
        portfolio_id: &str,
        scenarios: &[StressTestScenario],
    ) -> RiskResult<Vec<StressTestResult>> {
        let portfolio = self.get_portfolio_risk(portfolio_id)?;
        Ok(self.var_calculator.run_stress_test(&portfolio, scenarios))
    }

    // ---- periodic work ----

    /// Recompute VaR for every portfolio with enough history. Returns the
    /// number of portfolios updated.
    pub fn recalculate_var(&self) -> usize {
        if !self.config.enable_var_calculation {
            return 0;
        }
        let histories: Vec<(String, Vec<_>)> = self
            .portfolios
            .read()
            .values()
            .filter(|p| p.value_history.len() >= 2)
            .map(|p| (p.portfolio_id.clone(), p.value_history.clone()))
            .collect();

        let mut updated = 0;
        for (id, history) in histories {
            let result = match self.var_calculator.calculate(&history) {
                Ok(result) => result,
                Err(e) => {
                    warn!(portfolio = %id, error = %e, "VaR recalculation failed");
                    continue;
                }
            };
            self.counters.var_calculations.fetch_add(1, Ordering::Relaxed);

            let pushed = {
                let mut portfolios = self.portfolios.write();
                portfolios.get_mut(&id).map(|p| {
                    p.apply_var(result);
                    (p.monitor_id.clone(), p.metrics.clone())
                })
            };
            if let Some((monitor_id, metrics)) = pushed {
                if let Err(e) = self.engine.update_metrics(&monitor_id, metrics) {
                    warn!(portfolio = %id, error = %e, "failed to push VaR to monitor");
                }
                updated += 1;
            }
        }
        if updated > 0 {
            debug!(portfolios = updated, "VaR recalculated");
        }
        updated
    }

    /// Aggregate all portfolios into [`GlobalMetrics`] and feed the result
    /// to the global monitor.
    pub fn refresh_global_metrics(&self) -> GlobalMetrics {
        let mut global = GlobalMetrics::default();
        {
            let portfolios = self.portfolios.read();
            for p in portfolios.values() {
                // Each portfolio fits in a Decimal; their sum may not.
                global.total_value = global.total_value.saturating_add(p.total_value);
                global.total_cash = global.total_cash.saturating_add(p.cash);
                global.total_exposure = global.total_exposure.saturating_add(p.metrics.total_exposure);
                global.net_exposure = global.net_exposure.saturating_add(p.metrics.net_exposure);
                global.daily_pnl = global.daily_pnl.saturating_add(p.metrics.daily_pnl);
                global.unrealized_pnl = global.unrealized_pnl.saturating_add(p.metrics.unrealized_pnl);
                global.realized_pnl = global.realized_pnl.saturating_add(p.metrics.realized_pnl);
                global.total_var = global.total_var.saturating_add(p.metrics.var);
                global.max_drawdown = global.max_drawdown.max(p.metrics.current_drawdown);
                global.position_count += p.positions.len();
                global.average_risk_score += p.risk_score;
                global.max_risk_score = global.max_risk_score.max(p.risk_score);
            }
            global.portfolio_count = portfolios.len();
        }
        if global.portfolio_count > 0 {
            global.average_risk_score /= global.portfolio_count as f64;
        }
        global.active_monitors = self.engine.monitor_count();
        global.open_circuit_breakers = self.engine.circuit_breakers().open_breakers().len();
        global.updated_at = Some(Utc::now());

        let leverage = if global.total_value > Decimal::ZERO {
            global
                .total_exposure
                .checked_div(global.total_value)
                .unwrap_or(Decimal::MAX)
        } else {
            Decimal::ZERO
        };
        let metrics = RiskMetrics {
            total_exposure: global.total_exposure,
            net_exposure: global.net_exposure,
            gross_exposure: global.total_exposure,
            daily_pnl: global.daily_pnl,
            unrealized_pnl: global.unrealized_pnl,
            realized_pnl: global.realized_pnl,
            current_drawdown: global.max_drawdown,
            max_drawdown: global.max_drawdown,
            var: global.total_var,
            leverage,
            cash_balance: global.total_cash,
            position_count: global.position_count,
            ..Default::default()
        };
        if let Err(e) = self.engine.update_metrics(GLOBAL_MONITOR_ID, metrics) {
            warn!(error = %e, "failed to update global monitor");
        }

        *self.global_metrics.write() = global.clone();
        global
    }

    /// Drain the engine's alert queue, log each alert and keep the most
    /// recent ones for [`recent_alerts`](Self::recent_alerts).
    pub fn process_pending_alerts(&self) -> usize {
        let capacity = self.config.engine.alert_buffer_size;
        let alerts = self.engine.get_alerts(capacity);
        if alerts.is_empty() {
            return 0;
        }
        let count = alerts.len();

        let mut recent = self.recent_alerts.lock();
        for alert in alerts {
            alert.log();
            recent.push_back(alert);
        }
        while recent.len() > capacity {
            recent.pop_front();
        }
        self.counters
            .alerts_processed
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    // ---- accessors ----

    /// The `limit` most recently processed alerts, oldest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<RiskAlert> {
        let recent = self.recent_alerts.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    pub fn get_global_metrics(&self) -> GlobalMetrics {
        self.global_metrics.read().clone()
    }

    pub fn get_service_metrics(&self) -> ServiceMetrics {
        let started_at = *self.started_at.read();
        ServiceMetrics {
            total_checks: self.counters.total_checks.load(Ordering::Relaxed),
            approved_checks: self.counters.approved_checks.load(Ordering::Relaxed),
            rejected_checks: self.counters.rejected_checks.load(Ordering::Relaxed),
            violations: self.counters.violations.load(Ordering::Relaxed),
            portfolios: self.portfolios.read().len(),
            alerts_processed: self.counters.alerts_processed.load(Ordering::Relaxed),
            var_calculations: self.counters.var_calculations.load(Ordering::Relaxed),
            started_at,
            uptime_secs: started_at
                .map(|t| (Utc::now() - t).num_seconds())
                .unwrap_or(0),
        }
    }
}

/// Composite check score: a confidence penalty, 30% of the portfolio score,
/// a flat penalty for large notionals and a constant volatility term,
/// clamped to `[0, 100]`.
pub fn composite_risk_score(signal: &TradingSignal, portfolio_score: Option<f64>) -> f64 {
    let mut score = (1.0 - signal.confidence) * 30.0;
    if let Some(portfolio_score) = portfolio_score {
        score += portfolio_score * 0.3;
    }
    if signal.notional() > Decimal::from(LARGE_NOTIONAL) {
        score += 20.0;
    }
    score += 10.0;
    clamp_score(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::config::RiskEngineConfig;
    use crate::var::ValuePoint;
    use chrono::Duration;
    use rg_types::signal::Side;
    use rg_types::violation::ViolationType;
    use rust_decimal_macros::dec;

    fn service() -> RiskManagementService {
        RiskManagementService::new(RiskServiceConfig::default()).unwrap()
    }

    fn signal(symbol: &str, qty: Decimal, price: Decimal) -> TradingSignal {
        TradingSignal::new("grid", symbol, "binance", Side::Buy, qty, price)
    }

    struct Blocklist(&'static str);

    impl ComplianceChecker for Blocklist {
        fn check_compliance(&self, request: &RiskCheckRequest) -> RiskResult<ComplianceStatus> {
            if request.signal.symbol == self.0 {
                Ok(ComplianceStatus::NonCompliant {
                    reasons: vec![format!("{} is restricted", self.0)],
                })
            } else {
                Ok(ComplianceStatus::Compliant)
            }
        }
    }

    struct Broken;

    impl ComplianceChecker for Broken {
        fn check_compliance(&self, _: &RiskCheckRequest) -> RiskResult<ComplianceStatus> {
            Err(RiskError::Internal("rules engine unreachable".into()))
        }
    }

    #[test]
    fn registers_global_monitor() {
        let s = service();
        assert!(s.engine().get_monitor(GLOBAL_MONITOR_ID).is_some());
    }

    #[test]
    fn small_confident_signal_is_approved() {
        let s = service();
        let r = s.check_risk(&RiskCheckRequest::new(signal("BTCUSDT", dec!(0.1), dec!(60_000)), ""));
        assert!(r.approved);
        assert!(r.violations.is_empty());
        assert_eq!(r.compliance_status, ComplianceStatus::Compliant);
        // notional 6_000: only the baseline term
        assert_eq!(r.risk_score, 10.0);
    }

    #[test]
    fn engine_rejection_is_reported() {
        let s = service();
        let mut limits = s.engine().global_limits();
        limits.blocked_symbols = vec!["LUNAUSDT".into()];
        s.set_global_limits(limits).unwrap();

        let r = s.check_risk(&RiskCheckRequest::new(signal("LUNAUSDT", dec!(1), dec!(1)), ""));
        assert!(!r.approved);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].violation_type, ViolationType::SymbolBlocked);

        let m = s.get_service_metrics();
        assert_eq!(m.total_checks, 1);
        assert_eq!(m.rejected_checks, 1);
        assert_eq!(m.violations, 1);
    }

    #[test]
    fn open_breakers_are_listed() {
        let s = service();
        let sig = signal("BTCUSDT", dec!(1), dec!(100));
        for _ in 0..s.config().engine.circuit_breaker.failure_threshold {
            s.record_execution_outcome(&sig, false);
        }
        let r = s.check_risk(&RiskCheckRequest::new(sig, ""));
        assert!(!r.approved);
        let keys: Vec<&str> = r.open_circuit_breakers.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["global", "strategy:grid", "symbol:BTCUSDT", "exchange:binance"]);
        assert!(r.open_circuit_breakers.iter().all(|b| b.state == CircuitState::Open));
        assert_eq!(r.violations[0].violation_type, ViolationType::CircuitBreaker);
    }

    #[test]
    fn breakers_disabled_never_block() {
        let s = RiskManagementService::new(RiskServiceConfig {
            engine: RiskEngineConfig {
                enable_circuit_breaker: false,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let sig = signal("BTCUSDT", dec!(1), dec!(100));
        for _ in 0..10 {
            s.record_execution_outcome(&sig, false);
        }
        assert!(s.check_risk(&RiskCheckRequest::new(sig, "")).approved);
    }

    #[test]
    fn non_compliant_blocks_and_failure_does_not() {
        let s = service().with_compliance(Arc::new(Blocklist("XMRUSDT")));
        let r = s.check_risk(&RiskCheckRequest::new(signal("XMRUSDT", dec!(1), dec!(1)), ""));
        assert!(!r.approved);
        assert!(matches!(r.compliance_status, ComplianceStatus::NonCompliant { .. }));

        let s = service().with_compliance(Arc::new(Broken));
        let r = s.check_risk(&RiskCheckRequest::new(signal("BTCUSDT", dec!(1), dec!(1)), ""));
        assert!(r.approved);
        assert_eq!(r.compliance_status, ComplianceStatus::Unknown);
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn compliance_veto_leaves_breaker_trial_unclaimed() {
        let s = service().with_compliance(Arc::new(Blocklist("XMRUSDT")));
        let sig = signal("XMRUSDT", dec!(1), dec!(1));
        let breakers = s.engine().circuit_breakers();
        let cb = &s.config().engine.circuit_breaker;
        let t0 = Utc::now();
        for _ in 0..cb.failure_threshold {
            breakers.record_failure_at("symbol:XMRUSDT", t0);
        }
        let later = t0 + Duration::seconds(cb.cooldown_secs as i64 + 1);

        let r = s.check_risk_at(&RiskCheckRequest::new(sig.clone(), ""), later);
        assert!(!r.approved);
        assert!(r.open_circuit_breakers.is_empty());
        assert!(matches!(r.compliance_status, ComplianceStatus::NonCompliant { .. }));
        assert_eq!(breakers.state("symbol:XMRUSDT"), Some(CircuitState::Open));

        // The trial is still there for a signal that clears every check.
        s.engine().check_signal_at(&sig, later).unwrap();
        assert_eq!(breakers.state("symbol:XMRUSDT"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn vetoed_checks_do_not_use_order_rate() {
        let s = service().with_compliance(Arc::new(Blocklist("XMRUSDT")));
        let mut limits = s.engine().global_limits();
        limits.max_orders_per_second = Some(1);
        s.set_global_limits(limits).unwrap();

        let t = Utc::now();
        let xmr = RiskCheckRequest::new(signal("XMRUSDT", dec!(1), dec!(1)), "");
        let btc = RiskCheckRequest::new(signal("BTCUSDT", dec!(1), dec!(1)), "");
        assert!(!s.check_risk_at(&xmr, t).approved);
        assert!(s.check_risk_at(&btc, t).approved);

        let r = s.check_risk_at(&btc, t);
        assert!(!r.approved);
        assert_eq!(r.violations[0].violation_type, ViolationType::OrderRate);
    }

    #[test]
    fn score_includes_portfolio_and_notional() {
        let s = service();
        s.register_portfolio("p1", "grid", "Main").unwrap();
        // One position: concentration penalty of 20.
        s.update_portfolio(
            "p1",
            vec![PositionRisk::new("BTCUSDT", dec!(1), dec!(1_000), dec!(1_000))],
            dec!(9_000),
        )
        .unwrap();

        let sig = signal("BTCUSDT", dec!(1), dec!(20_000)).with_confidence(0.5);
        let r = s.check_risk(&RiskCheckRequest::new(sig, "p1"));
        // 15 + 6 + 20 + 10
        assert!((r.risk_score - 51.0).abs() < 1e-9);
    }

    #[test]
    fn score_saturates() {
        let sig = signal("BTCUSDT", dec!(1_000_000_000), dec!(1_000_000_000)).with_confidence(-1e300);
        assert_eq!(composite_risk_score(&sig, Some(f64::MAX)), 100.0);
        let sig = sig.with_confidence(f64::NAN);
        assert_eq!(composite_risk_score(&sig, None), 100.0);
    }

    #[test]
    fn unknown_portfolio_warns() {
        let s = service();
        let r = s.check_risk(&RiskCheckRequest::new(signal("BTCUSDT", dec!(1), dec!(1)), "ghost"));
        assert!(r.approved);
        assert_eq!(r.warnings, vec!["unknown portfolio ghost".to_string()]);
    }

    #[test]
    fn portfolio_registration_rules() {
        let s = RiskManagementService::new(RiskServiceConfig {
            max_portfolios: 1,
            ..Default::default()
        })
        .unwrap();
        s.register_portfolio("p1", "grid", "Main").unwrap();
        assert!(s.engine().get_monitor("portfolio:p1").is_some());
        assert!(matches!(
            s.register_portfolio("p2", "grid", "Other"),
            Err(RiskError::MaxPortfoliosReached { max: 1 })
        ));

        let s = service();
        s.register_portfolio("p1", "grid", "Main").unwrap();
        assert!(matches!(
            s.register_portfolio("p1", "grid", "Main"),
            Err(RiskError::DuplicatePortfolio { .. })
        ));
    }

    #[test]
    fn update_pushes_metrics_to_engine() {
        let s = service();
        assert!(matches!(
            s.update_portfolio("nope", vec![], dec!(0)),
            Err(RiskError::PortfolioNotFound { .. })
        ));

        s.register_portfolio("p1", "grid", "Main").unwrap();
        s.update_portfolio(
            "p1",
            vec![
                PositionRisk::new("BTCUSDT", dec!(1), dec!(50_000), dec!(60_000)),
                PositionRisk::new("ETHUSDT", dec!(-5), dec!(3_000), dec!(3_000)),
            ],
            dec!(5_000),
        )
        .unwrap();

        let p = s.get_portfolio_risk("p1").unwrap();
        assert_eq!(p.total_value, dec!(50_000));
        assert_eq!(p.metrics.unrealized_pnl, dec!(10_000));

        let m = s.engine().get_metrics("portfolio:p1").unwrap();
        assert_eq!(m.total_exposure, dec!(75_000));
        assert_eq!(m.leverage, dec!(1.5));
        assert!(m.updated_at.is_some());
    }

    #[test]
    fn global_metrics_feed_the_global_monitor() {
        let s = service();
        for id in ["p1", "p2"] {
            s.register_portfolio(id, "grid", id).unwrap();
            s.update_portfolio(
                id,
                vec![PositionRisk::new("BTCUSDT", dec!(1), dec!(10_000), dec!(10_000))],
                dec!(10_000),
            )
            .unwrap();
        }
        let g = s.refresh_global_metrics();
        assert_eq!(g.portfolio_count, 2);
        assert_eq!(g.total_value, dec!(40_000));
        assert_eq!(g.total_exposure, dec!(20_000));
        assert_eq!(g.position_count, 2);
        assert_eq!(g.active_monitors, 3);
        assert_eq!(s.get_global_metrics(), g);

        let m = s.engine().get_metrics(GLOBAL_MONITOR_ID).unwrap();
        assert_eq!(m.total_exposure, dec!(20_000));
        assert_eq!(m.leverage, dec!(0.5));
    }

    #[test]
    fn overflowing_update_is_refused() {
        let s = service();
        s.register_portfolio("p1", "grid", "Main").unwrap();
        s.update_portfolio("p1", vec![], dec!(1_000)).unwrap();

        let err = s
            .update_portfolio(
                "p1",
                vec![PositionRisk::new("BTCUSDT", dec!(1), dec!(1), dec!(1))],
                Decimal::MAX,
            )
            .unwrap_err();
        assert!(matches!(err, RiskError::Overflow { .. }));
        assert_eq!(s.get_portfolio_risk("p1").unwrap().total_value, dec!(1_000));
        assert_eq!(s.engine().get_metrics("portfolio:p1").unwrap().cash_balance, dec!(1_000));
    }

    #[test]
    fn global_totals_saturate() {
        let s = service();
        for id in ["p1", "p2"] {
            s.register_portfolio(id, "grid", id).unwrap();
            s.update_portfolio(
                id,
                vec![PositionRisk::new("BTCUSDT", dec!(1), dec!(1), dec!(1))],
                dec!(50_000_000_000_000_000_000_000_000_000),
            )
            .unwrap();
        }
        let g = s.refresh_global_metrics();
        assert_eq!(g.total_value, Decimal::MAX);
        assert_eq!(g.total_cash, Decimal::MAX);
        assert_eq!(g.total_exposure, dec!(2));
    }

    #[test]
    fn var_loop_updates_portfolios_with_history() {
        let s = service();
        s.register_portfolio("p1", "grid", "Main").unwrap();
        s.register_portfolio("p2", "grid", "Idle").unwrap();
        for cash in [dec!(100_000), dec!(95_000), dec!(97_000), dec!(92_000)] {
            s.update_portfolio("p1", vec![], cash).unwrap();
        }

        assert_eq!(s.recalculate_var(), 1);
        let p = s.get_portfolio_risk("p1").unwrap();
        assert!(p.var_result.is_some());
        assert!(p.metrics.var > Decimal::ZERO);
        assert_eq!(s.engine().get_metrics("portfolio:p1").unwrap().var, p.metrics.var);
        assert!(s.get_portfolio_risk("p2").unwrap().var_result.is_none());
        assert_eq!(s.get_service_metrics().var_calculations, 1);
    }

    #[test]
    fn on_demand_var_needs_history() {
        let s = service();
        s.register_portfolio("p1", "grid", "Main").unwrap();
        assert!(matches!(
            s.calculate_portfolio_var("p1", VaRMethod::Historical),
            Err(RiskError::InsufficientData { .. })
        ));
        s.update_portfolio("p1", vec![], dec!(100)).unwrap();
        s.update_portfolio("p1", vec![], dec!(90)).unwrap();
        let r = s.calculate_portfolio_var("p1", VaRMethod::Historical).unwrap();
        assert_eq!(r.sample_size, 1);
    }

    #[test]
    fn stress_test_uses_portfolio_positions() {
        let s = service();
        s.register_portfolio("p1", "grid", "Main").unwrap();
        s.update_portfolio(
            "p1",
            vec![PositionRisk::new("BTCUSDT", dec!(1), dec!(10_000), dec!(10_000))],
            dec!(0),
        )
        .unwrap();
        let results = s
            .run_stress_test(
                "p1",
                &[
                    StressTestScenario::market_wide("crash", -0.2),
                    StressTestScenario::market_wide("bogus", -1.5),
                ],
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].total_loss, dec!(2_000));

        assert!(matches!(
            s.run_stress_test("ghost", &[]),
            Err(RiskError::PortfolioNotFound { .. })
        ));
    }

    #[test]
    fn alerts_are_drained_into_recent_log() {
        let s = service();
        let mut limits = s.engine().global_limits();
        limits.allowed_symbols = vec!["BTCUSDT".into()];
        s.set_global_limits(limits).unwrap();
        for sym in ["A", "B", "C"] {
            s.check_risk(&RiskCheckRequest::new(signal(sym, dec!(1), dec!(1)), ""));
        }

        assert_eq!(s.process_pending_alerts(), 3);
        assert_eq!(s.process_pending_alerts(), 0);
        let recent = s.recent_alerts(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].entity_id, "B");
        assert_eq!(recent[1].entity_id, "C");
        assert_eq!(s.get_service_metrics().alerts_processed, 3);
    }

    #[test]
    fn uptime_starts_with_the_service() {
        let s = service();
        assert_eq!(s.get_service_metrics().started_at, None);
        *s.started_at.write() = Some(Utc::now() - Duration::seconds(30));
        assert!(s.get_service_metrics().uptime_secs >= 30);
    }

    #[test]
    fn var_history_feeds_from_updates() {
        let s = RiskManagementService::new(RiskServiceConfig {
            var_history_size: 3,
            ..Default::default()
        })
        .unwrap();
        s.register_portfolio("p1", "grid", "Main").unwrap();
        for i in 0..5 {
            s.update_portfolio("p1", vec![], Decimal::from(100 + i)).unwrap();
        }
        let history: Vec<ValuePoint> = s.get_portfolio_risk("p1").unwrap().value_history;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value, dec!(102));
    }

    fn fast_config() -> RiskServiceConfig {
        let mut config = RiskServiceConfig::default();
        config.engine.check_interval_ms = 10;
        config.alert_poll_interval_ms = 10;
        config.metrics_update_interval_secs = 1;
        config.var_update_interval_secs = 1;
        config.engine.circuit_breaker.failure_threshold = 3;
        config
    }

    fn momentum(symbol: &str, qty: Decimal, price: Decimal) -> TradingSignal {
        TradingSignal::new("momentum", symbol, "kraken", Side::Buy, qty, price)
    }

    #[tokio::test]
    async fn portfolio_lifecycle_end_to_end() {
        let service = Arc::new(RiskManagementService::new(fast_config()).unwrap());
        service.register_portfolio("main", "momentum", "Main book").unwrap();

        for (i, cash) in [dec!(50_000), dec!(48_000), dec!(49_500), dec!(47_000)].into_iter().enumerate() {
            service
                .update_portfolio(
                    "main",
                    vec![
                        PositionRisk::new("BTCUSDT", dec!(1), dec!(60_000), dec!(60_000) + Decimal::from(i)),
                        PositionRisk::new("ETHUSDT", dec!(10), dec!(3_000), dec!(3_000)),
                    ],
                    cash,
                )
                .unwrap();
        }
        let portfolio = service.get_portfolio_risk("main").unwrap();
        let market_value: Decimal = portfolio.positions.values().map(|p| p.market_value).sum();
        assert_eq!(portfolio.total_value, portfolio.cash + market_value);

        service.start();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let response = service.check_risk(&RiskCheckRequest::new(
            momentum("BTCUSDT", dec!(0.05), dec!(60_000)),
            "main",
        ));
        assert!(response.approved, "{:?}", response.violations);
        assert!(response.risk_score >= 10.0 && response.risk_score <= 100.0);

        // Global metrics and VaR loops have each ticked at least once.
        let global = service.get_global_metrics();
        assert_eq!(global.portfolio_count, 1);
        assert!(global.updated_at.is_some());
        assert!(service.get_portfolio_risk("main").unwrap().var_result.is_some());
        assert!(service
            .engine()
            .get_metrics(GLOBAL_MONITOR_ID)
            .unwrap()
            .updated_at
            .is_some());

        let stress = service
            .run_stress_test(
                "main",
                &[StressTestScenario::market_wide("selloff", -0.3).with_symbol_shock("ETHUSDT", -0.5)],
            )
            .unwrap();
        assert_eq!(stress.len(), 1);
        assert_eq!(stress[0].position_losses["ETHUSDT"], dec!(15_000));

        service.stop().await;
        let metrics = service.get_service_metrics();
        assert_eq!(metrics.total_checks, 1);
        assert_eq!(metrics.approved_checks, 1);
        assert!(metrics.started_at.is_some());
    }

    #[tokio::test]
    async fn execution_failures_trip_breakers_and_block() {
        let service = Arc::new(RiskManagementService::new(fast_config()).unwrap());
        service.start();

        let sig = momentum("SOLUSDT", dec!(10), dec!(150));
        assert!(service.check_risk(&RiskCheckRequest::new(sig.clone(), "")).approved);

        for _ in 0..3 {
            service.record_execution_outcome(&sig, false);
        }
        let breakers = service.engine().circuit_breakers();
        assert_eq!(breakers.state("symbol:SOLUSDT"), Some(CircuitState::Open));

        let response = service.check_risk(&RiskCheckRequest::new(sig, ""));
        assert!(!response.approved);
        assert_eq!(response.violations.len(), 1);
        assert_eq!(response.violations[0].violation_type, ViolationType::CircuitBreaker);
        assert!(response
            .open_circuit_breakers
            .iter()
            .any(|b| b.key == "symbol:SOLUSDT" && b.state == CircuitState::Open));

        // Other exchanges and symbols sharing the global breaker are blocked too.
        let other = TradingSignal::new("carry", "ADAUSDT", "bybit", Side::Sell, dec!(1), dec!(1));
        assert!(!service.check_risk(&RiskCheckRequest::new(other, "")).approved);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        service.stop().await;

        let alerts = service.recent_alerts(10);
        assert_eq!(alerts.len(), 2);
        assert!(alerts
            .iter()
            .all(|a| a.alert_type == ViolationType::CircuitBreaker));
        assert_eq!(service.get_service_metrics().rejected_checks, 2);
    }
}
