//! Risk engine: monitor registry, signal gating, periodic limit checks.
//!
//! [`RiskEngine::check_signal`] runs the global, strategy, symbol and
//! circuit-breaker stages in order and stops at the first failure. Each
//! failure is recorded as a [`RiskViolation`], raised as a [`RiskAlert`] and
//! returned to the caller as [`RiskError::Violation`].
//!
//! A check is two steps. [`RiskEngine::evaluate_signal_at`] only reads state;
//! [`RiskEngine::commit_signal_at`] counts the signal toward the order-rate
//! window and claims half-open trials. Callers with their own vetoes run
//! those between the two steps so a vetoed signal leaves no trace.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rust_decimal::Decimal;
use tracing::{debug, error, info};

use rg_types::errors::{RiskError, RiskResult};
use rg_types::internal_error;
use rg_types::limits::{GlobalRiskLimits, RiskLimits};
use rg_types::signal::TradingSignal;
use rg_types::violation::{RiskAction, RiskViolation, Severity, ViolationType};

use crate::alerts::{AlertQueue, RiskAlert};
use crate::circuit_breaker::{BlockingBreaker, CircuitBreakerRegistry};
use crate::config::{secs_delta, RiskEngineConfig};
use crate::monitor::{LimitBreach, MonitorRegistry, MonitorType, RiskMetrics, RiskMonitor};
use crate::tasks::TaskGroup;

/// ID of the process-wide monitor.
pub const GLOBAL_MONITOR_ID: &str = "global";

type CheckResult = Result<(), RiskViolation>;

pub struct RiskEngine {
    config: RiskEngineConfig,
    global_limits: RwLock<GlobalRiskLimits>,
    monitors: MonitorRegistry,
    breakers: CircuitBreakerRegistry,
    violations: RwLock<Vec<RiskViolation>>,
    /// Timestamps of approved signals, pruned to one day.
    order_log: Mutex<VecDeque<DateTime<Utc>>>,
    alerts: AlertQueue,
    violation_count: AtomicU64,
    pool: rayon::ThreadPool,
    tasks: TaskGroup,
}

impl RiskEngine {
    pub fn new(config: RiskEngineConfig) -> RiskResult<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrent_checks)
            .thread_name(|i| format!("risk-check-{i}"))
            .build()
            .map_err(|e| internal_error!("failed to build risk-check pool: {e}"))?;

        Ok(Self {
            global_limits: RwLock::new(config.global_limits.clone()),
            monitors: MonitorRegistry::new(),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            violations: RwLock::new(Vec::new()),
            order_log: Mutex::new(VecDeque::new()),
            alerts: AlertQueue::new(config.alert_buffer_size),
            violation_count: AtomicU64::new(0),
            pool,
            tasks: TaskGroup::new("risk-engine"),
            config,
        })
    }

    pub fn config(&self) -> &RiskEngineConfig {
        &self.config
    }

    // ---- lifecycle ----

    /// Spawn the limit-check and violation-cleanup loops.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.tasks
            .spawn_periodic("limit_checks", self.config.check_interval(), move || {
                let engine = Arc::clone(&engine);
                async move {
                    if let Err(e) = tokio::task::spawn_blocking(move || engine.run_limit_checks()).await {
                        error!(error = %e, "limit check tick failed");
                    }
                }
            });

        let engine = Arc::clone(self);
        self.tasks.spawn_periodic(
            "violation_cleanup",
            self.config.violation_cleanup_interval(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    engine.cleanup_violations();
                }
            },
        );

        info!(
            check_interval_ms = self.config.check_interval_ms,
            monitors = self.monitors.len(),
            "risk engine started"
        );
    }

    /// Stop all loops and wait for them to exit.
    pub async fn stop(&self) {
        self.tasks.shutdown().await;
        info!("risk engine stopped");
    }

    // ---- global limits ----

    pub fn set_global_limits(&self, limits: GlobalRiskLimits) {
        *self.global_limits.write() = limits;
        info!("global risk limits updated");
    }

    pub fn global_limits(&self) -> GlobalRiskLimits {
        self.global_limits.read().clone()
    }

    // ---- registry ----

    pub fn register_monitor(&self, monitor: RiskMonitor) -> RiskResult<()> {
        let id = monitor.id.clone();
        let kind = monitor.monitor_type;
        self.monitors.register(monitor)?;
        info!(monitor = %id, monitor_type = %kind, "risk monitor registered");
        Ok(())
    }

    pub fn unregister_monitor(&self, id: &str) -> RiskResult<RiskMonitor> {
        let monitor = self.monitors.unregister(id)?;
        info!(monitor = %id, "risk monitor unregistered");
        Ok(monitor)
    }

    pub fn update_metrics(&self, id: &str, metrics: RiskMetrics) -> RiskResult<()> {
        self.monitors.update_metrics(id, metrics)
    }

    pub fn update_limits(&self, id: &str, limits: RiskLimits) -> RiskResult<()> {
        self.monitors.update_limits(id, limits)
    }

    pub fn get_metrics(&self, id: &str) -> RiskResult<RiskMetrics> {
        self.monitors
            .get(id)
            .map(|m| m.metrics)
            .ok_or_else(|| RiskError::MonitorNotFound {
                monitor_id: id.to_string(),
            })
    }

    pub fn get_monitor(&self, id: &str) -> Option<RiskMonitor> {
        self.monitors.get(id)
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    // ---- signal gating ----

    pub fn check_signal(&self, signal: &TradingSignal) -> RiskResult<()> {
        self.check_signal_at(signal, Utc::now())
    }

    /// Evaluate and, if every stage passes, commit the signal.
    pub fn check_signal_at(&self, signal: &TradingSignal, now: DateTime<Utc>) -> RiskResult<()> {
        self.evaluate_signal_at(signal, now)?;
        self.commit_signal_at(signal, now)
    }

    /// Run every stage without counting the signal or touching breaker
    /// state. Failures are recorded as violations.
    pub fn evaluate_signal_at(&self, signal: &TradingSignal, now: DateTime<Utc>) -> RiskResult<()> {
        let result = self
            .check_global_limits(signal, now)
            .and_then(|_| {
                self.check_entity_limits(
                    MonitorType::Strategy,
                    &signal.strategy_id,
                    signal,
                    ViolationType::StrategyExposure,
                )
            })
            .and_then(|_| {
                self.check_entity_limits(
                    MonitorType::Symbol,
                    &signal.symbol,
                    signal,
                    ViolationType::SymbolExposure,
                )
            })
            .and_then(|_| self.check_circuit_breakers(signal, now));

        result.map_err(|violation| {
            self.record_violation(violation.clone());
            violation.into()
        })
    }

    /// Count an approved signal toward the order-rate window and claim the
    /// trial of every governing breaker that is ready for one. Fails only
    /// when another signal claimed a trial since evaluation.
    pub fn commit_signal_at(&self, signal: &TradingSignal, now: DateTime<Utc>) -> RiskResult<()> {
        if self.config.enable_circuit_breaker {
            let keys = CircuitBreakerRegistry::keys_for(signal);
            if let Err(blocking) = self.breakers.claim_at(&keys, now) {
                let violation = self.breaker_violation(&blocking);
                self.record_violation(violation.clone());
                return Err(violation.into());
            }
        }
        self.order_log.lock().push_back(now);
        debug!(signal = %signal.id, symbol = %signal.symbol, "signal passed risk checks");
        Ok(())
    }

    /// Governing breakers refusing the signal at `now`, without side effects.
    pub fn blocking_breakers_at(&self, signal: &TradingSignal, now: DateTime<Utc>) -> Vec<BlockingBreaker> {
        if !self.config.enable_circuit_breaker {
            return Vec::new();
        }
        self.breakers
            .blocking_at(&CircuitBreakerRegistry::keys_for(signal), now)
    }

    fn check_global_limits(&self, signal: &TradingSignal, now: DateTime<Utc>) -> CheckResult {
        let limits = self.global_limits.read().clone();
        let symbol = &signal.symbol;
        let notional = signal.notional();

        if !limits.is_symbol_allowed(symbol) {
            return Err(reject(
                GLOBAL_MONITOR_ID,
                symbol,
                ViolationType::SymbolNotAllowed,
                Decimal::ZERO,
                Decimal::ZERO,
                format!("symbol {symbol} is not in the allowed list"),
            ));
        }

        if limits.is_symbol_blocked(symbol) {
            return Err(reject(
                GLOBAL_MONITOR_ID,
                symbol,
                ViolationType::SymbolBlocked,
                Decimal::ZERO,
                Decimal::ZERO,
                format!("symbol {symbol} is blocked"),
            ));
        }

        if notional > limits.max_position_size {
            return Err(reject(
                GLOBAL_MONITOR_ID,
                symbol,
                ViolationType::PositionSize,
                limits.max_position_size,
                notional,
                format!(
                    "position size {notional} exceeds global limit {}",
                    limits.max_position_size
                ),
            ));
        }

        if let Some(hours) = limits.trading_hours {
            let time = now.time();
            if !hours.contains(time) {
                return Err(reject(
                    GLOBAL_MONITOR_ID,
                    symbol,
                    ViolationType::TradingHours,
                    Decimal::ZERO,
                    Decimal::ZERO,
                    format!(
                        "{time} is outside trading hours {}-{}",
                        hours.start, hours.end
                    ),
                ));
            }
        }

        self.check_order_rate(&limits, symbol, now)?;

        if let Some(global) = self.monitors.get(GLOBAL_MONITOR_ID) {
            let would_be = global.metrics.total_exposure.saturating_add(notional);
            if would_be > limits.max_total_exposure {
                return Err(reject(
                    GLOBAL_MONITOR_ID,
                    symbol,
                    ViolationType::TotalExposure,
                    limits.max_total_exposure,
                    would_be,
                    format!(
                        "total exposure {would_be} would exceed global limit {}",
                        limits.max_total_exposure
                    ),
                ));
            }

            let open = global.metrics.position_count;
            if limits.max_open_positions > 0 && open >= limits.max_open_positions {
                return Err(reject(
                    GLOBAL_MONITOR_ID,
                    symbol,
                    ViolationType::OpenPositions,
                    Decimal::from(limits.max_open_positions),
                    Decimal::from(open),
                    format!(
                        "{open} open positions at limit {}",
                        limits.max_open_positions
                    ),
                ));
            }
        }

        Ok(())
    }

    fn check_order_rate(
        &self,
        limits: &GlobalRiskLimits,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> CheckResult {
        let mut log = self.order_log.lock();
        while log.front().is_some_and(|t| now - *t > Duration::days(1)) {
            log.pop_front();
        }

        let windows = [
            (limits.max_orders_per_second, Duration::seconds(1), "second"),
            (limits.max_orders_per_minute, Duration::minutes(1), "minute"),
            (limits.max_orders_per_hour, Duration::hours(1), "hour"),
            (limits.max_orders_per_day, Duration::days(1), "day"),
        ];
        for (max, window, label) in windows {
            let Some(max) = max else { continue };
            let count = log.iter().filter(|t| now - **t < window).count();
            if count >= max as usize {
                return Err(reject(
                    GLOBAL_MONITOR_ID,
                    symbol,
                    ViolationType::OrderRate,
                    Decimal::from(max),
                    Decimal::from(count),
                    format!("{count} orders in the last {label}, limit {max}"),
                ));
            }
        }
        Ok(())
    }

    fn check_entity_limits(
        &self,
        monitor_type: MonitorType,
        entity_id: &str,
        signal: &TradingSignal,
        exposure_kind: ViolationType,
    ) -> CheckResult {
        let Some(monitor) = self.monitors.find(monitor_type, entity_id) else {
            return Ok(());
        };
        if !monitor.active {
            return Ok(());
        }
        let notional = signal.notional();

        if let Some(max) = monitor.limits.max_position_size {
            if notional > max {
                return Err(reject(
                    &monitor.id,
                    entity_id,
                    ViolationType::PositionSize,
                    max,
                    notional,
                    format!("{monitor_type} {entity_id} position size {notional} exceeds limit {max}"),
                ));
            }
        }

        if let Some(max) = monitor.limits.max_total_exposure {
            let would_be = monitor.metrics.total_exposure.saturating_add(notional);
            if would_be > max {
                return Err(reject(
                    &monitor.id,
                    entity_id,
                    exposure_kind,
                    max,
                    would_be,
                    format!("{monitor_type} {entity_id} exposure {would_be} would exceed limit {max}"),
                ));
            }
        }

        Ok(())
    }

    fn check_circuit_breakers(&self, signal: &TradingSignal, now: DateTime<Utc>) -> CheckResult {
        match self.blocking_breakers_at(signal, now).first() {
            Some(blocking) => Err(self.breaker_violation(blocking)),
            None => Ok(()),
        }
    }

    fn breaker_violation(&self, blocking: &BlockingBreaker) -> RiskViolation {
        let key = &blocking.key;
        let trips = self.breakers.get(key).map(|b| b.trip_count).unwrap_or(0);
        let mut violation = reject(
            key,
            key,
            ViolationType::CircuitBreaker,
            Decimal::ZERO,
            Decimal::from(trips),
            blocking.describe(),
        );
        violation.action = RiskAction::Halt;
        violation
    }

    /// Feed an execution outcome into every breaker governing the signal.
    pub fn record_outcome(&self, signal: &TradingSignal, success: bool) {
        if !self.config.enable_circuit_breaker {
            return;
        }
        for key in CircuitBreakerRegistry::keys_for(signal) {
            if success {
                self.breakers.record_success(&key);
            } else {
                self.breakers.record_failure(&key);
            }
        }
    }

    // ---- violations & alerts ----

    /// Append a violation, bump the owning monitor's counter and raise an alert.
    pub fn record_violation(&self, violation: RiskViolation) {
        self.monitors.record_violation(&violation.monitor_id);
        self.violation_count.fetch_add(1, Ordering::Relaxed);

        let alert = RiskAlert::new(
            violation.violation_type,
            violation.severity,
            &violation.monitor_id,
            &violation.entity_id,
            violation.message.clone(),
        );
        self.violations.write().push(violation);
        self.emit_alert(alert);
    }

    pub fn emit_alert(&self, alert: RiskAlert) -> bool {
        debug!(kind = %alert.alert_type, entity = %alert.entity_id, "alert raised");
        self.alerts.push(alert)
    }

    /// Drain up to `limit` pending alerts.
    pub fn get_alerts(&self, limit: usize) -> Vec<RiskAlert> {
        self.alerts.drain(limit)
    }

    /// The `limit` most recent violations in insertion order.
    pub fn get_violations(&self, limit: usize) -> Vec<RiskViolation> {
        let violations = self.violations.read();
        let start = violations.len().saturating_sub(limit);
        violations[start..].to_vec()
    }

    pub fn violation_count(&self) -> u64 {
        self.violation_count.load(Ordering::Relaxed)
    }

    pub fn alert_count(&self) -> u64 {
        self.alerts.alert_count()
    }

    pub fn dropped_alert_count(&self) -> u64 {
        self.alerts.dropped_count()
    }

    pub fn cleanup_violations(&self) -> usize {
        self.cleanup_violations_at(Utc::now())
    }

    /// Purge violations older than the retention window.
    pub fn cleanup_violations_at(&self, now: DateTime<Utc>) -> usize {
        let retention = secs_delta(self.config.violation_retention_secs);
        let mut violations = self.violations.write();
        let before = violations.len();
        violations.retain(|v| now - v.timestamp < retention);
        let removed = before - violations.len();
        if removed > 0 {
            info!(removed, remaining = violations.len(), "expired risk violations purged");
        }
        removed
    }

    // ---- periodic checks ----

    pub fn run_limit_checks(&self) -> usize {
        self.run_limit_checks_at(Utc::now())
    }

    /// Evaluate every active monitor and raise an alert per breach. Alerts
    /// are advisory and do not record violations.
    pub fn run_limit_checks_at(&self, now: DateTime<Utc>) -> usize {
        let monitors = self.monitors.active_snapshot();
        if monitors.is_empty() {
            return 0;
        }

        let results = self.evaluate_monitors(&monitors, RiskMonitor::evaluate);
        let ids: Vec<String> = monitors.iter().map(|m| m.id.clone()).collect();
        self.monitors.mark_checked(&ids, now);

        let mut breaches = 0;
        for (monitor, found) in results {
            for breach in found {
                breaches += 1;
                self.emit_alert(RiskAlert::new(
                    breach.kind,
                    breach.severity,
                    &monitor.id,
                    &monitor.entity_id,
                    breach.message,
                ));
            }
        }
        breaches
    }

    /// Run `evaluate` over monitors on the check pool. A panic in one
    /// monitor is logged and that monitor skipped.
    fn evaluate_monitors<'a, F>(
        &self,
        monitors: &'a [RiskMonitor],
        evaluate: F,
    ) -> Vec<(&'a RiskMonitor, Vec<LimitBreach>)>
    where
        F: Fn(&RiskMonitor) -> Vec<LimitBreach> + Sync,
    {
        self.pool.install(|| {
            monitors
                .par_iter()
                .filter_map(|monitor| {
                    match catch_unwind(AssertUnwindSafe(|| evaluate(monitor))) {
                        Ok(found) => Some((monitor, found)),
                        Err(_) => {
                            error!(monitor = %monitor.id, "panic while checking monitor, skipping");
                            None
                        }
                    }
                })
                .collect()
        })
    }
}

fn reject(
    monitor_id: &str,
    entity_id: &str,
    kind: ViolationType,
    limit: Decimal,
    actual: Decimal,
    message: String,
) -> RiskViolation {
    RiskViolation::new(
        monitor_id,
        entity_id,
        kind,
        limit,
        actual,
        Severity::Error,
        RiskAction::Reject,
        message,
    )
}
