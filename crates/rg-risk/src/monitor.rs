//! Per-entity risk monitors and the registry that owns them.
//!
//! A [`RiskMonitor`] pairs a live [`RiskMetrics`] snapshot with the
//! [`RiskLimits`] configured for one entity. The [`MonitorRegistry`] keeps at
//! most one monitor per ID and per `(type, entity)` pair.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use rg_types::errors::{RiskError, RiskResult};
use rg_types::limits::RiskLimits;
use rg_types::violation::{Severity, ViolationType};

/// Scope of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorType {
    Strategy,
    Portfolio,
    Symbol,
    Exchange,
    Global,
}

impl fmt::Display for MonitorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorType::Strategy => "strategy",
            MonitorType::Portfolio => "portfolio",
            MonitorType::Symbol => "symbol",
            MonitorType::Exchange => "exchange",
            MonitorType::Global => "global",
        };
        f.write_str(s)
    }
}

/// Live numeric risk snapshot for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub total_exposure: Decimal,
    pub net_exposure: Decimal,
    pub gross_exposure: Decimal,
    pub daily_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    /// Current drawdown from peak (0–1 fraction).
    pub current_drawdown: Decimal,
    pub max_drawdown: Decimal,
    pub var: Decimal,
    pub leverage: Decimal,
    pub cash_balance: Decimal,
    pub position_count: usize,
    /// Orders per minute.
    pub order_rate: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A limit breach found by [`RiskMonitor::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct LimitBreach {
    pub kind: ViolationType,
    pub severity: Severity,
    pub limit: Decimal,
    pub actual: Decimal,
    pub message: String,
}

/// One tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMonitor {
    pub id: String,
    pub monitor_type: MonitorType,
    pub entity_id: String,
    pub metrics: RiskMetrics,
    pub limits: RiskLimits,
    pub active: bool,
    pub violation_count: u64,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
}

impl RiskMonitor {
    pub fn new(id: &str, monitor_type: MonitorType, entity_id: &str, limits: RiskLimits) -> Self {
        Self {
            id: id.to_string(),
            monitor_type,
            entity_id: entity_id.to_string(),
            metrics: RiskMetrics::default(),
            limits,
            active: false,
            violation_count: 0,
            registered_at: None,
            last_check: None,
        }
    }

    /// Canonical ID for an entity monitor, e.g. `strategy:grid-1`.
    pub fn id_for(monitor_type: MonitorType, entity_id: &str) -> String {
        match monitor_type {
            MonitorType::Global => "global".to_string(),
            other => format!("{other}:{entity_id}"),
        }
    }

    /// Compare metrics against limits. Loss and drawdown breaches are hard,
    /// the rest are advisory warnings.
    pub fn evaluate(&self) -> Vec<LimitBreach> {
        let m = &self.metrics;
        let l = &self.limits;
        let mut breaches = Vec::new();

        if let Some(limit) = l.max_total_exposure {
            if m.total_exposure > limit {
                breaches.push(LimitBreach {
                    kind: ViolationType::TotalExposure,
                    severity: Severity::Warning,
                    limit,
                    actual: m.total_exposure,
                    message: format!(
                        "{} exposure {} exceeds limit {}",
                        self.entity_id, m.total_exposure, limit
                    ),
                });
            }
        }

        if let Some(limit) = l.max_daily_loss {
            let loss = -m.daily_pnl;
            if loss > limit {
                breaches.push(LimitBreach {
                    kind: ViolationType::DailyLoss,
                    severity: Severity::Error,
                    limit,
                    actual: loss,
                    message: format!("{} daily loss {} exceeds limit {}", self.entity_id, loss, limit),
                });
            }
        }

        if let Some(limit) = l.max_drawdown {
            if m.current_drawdown > limit {
                breaches.push(LimitBreach {
                    kind: ViolationType::Drawdown,
                    severity: Severity::Critical,
                    limit,
                    actual: m.current_drawdown,
                    message: format!(
                        "{} drawdown {:.2}% exceeds {:.2}% limit",
                        self.entity_id,
                        m.current_drawdown.saturating_mul(Decimal::from(100)),
                        limit.saturating_mul(Decimal::from(100)),
                    ),
                });
            }
        }

        if let Some(limit) = l.var_limit {
            if m.var > limit {
                breaches.push(LimitBreach {
                    kind: ViolationType::VaRLimit,
                    severity: Severity::Warning,
                    limit,
                    actual: m.var,
                    message: format!("{} VaR {} exceeds limit {}", self.entity_id, m.var, limit),
                });
            }
        }

        if let Some(limit) = l.max_leverage {
            if m.leverage > limit {
                breaches.push(LimitBreach {
                    kind: ViolationType::Leverage,
                    severity: Severity::Warning,
                    limit,
                    actual: m.leverage,
                    message: format!(
                        "{} leverage {:.2}x exceeds {:.2}x limit",
                        self.entity_id, m.leverage, limit
                    ),
                });
            }
        }

        if let Some(limit) = l.min_cash_reserve {
            if m.cash_balance < limit {
                breaches.push(LimitBreach {
                    kind: ViolationType::CashReserve,
                    severity: Severity::Warning,
                    limit,
                    actual: m.cash_balance,
                    message: format!(
                        "{} cash {} below reserve {}",
                        self.entity_id, m.cash_balance, limit
                    ),
                });
            }
        }

        breaches
    }
}

/// Registry of monitors keyed by ID, with a secondary `(type, entity)` index.
#[derive(Default)]
pub struct MonitorRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    monitors: HashMap<String, RiskMonitor>,
    by_entity: HashMap<(MonitorType, String), String>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate and insert a monitor.
    pub fn register(&self, mut monitor: RiskMonitor) -> RiskResult<()> {
        let mut inner = self.inner.write();
        let entity_key = (monitor.monitor_type, monitor.entity_id.clone());
        if inner.monitors.contains_key(&monitor.id) || inner.by_entity.contains_key(&entity_key) {
            return Err(RiskError::DuplicateMonitor {
                monitor_id: monitor.id,
            });
        }

        monitor.active = true;
        monitor.registered_at = Some(Utc::now());
        inner.by_entity.insert(entity_key, monitor.id.clone());
        inner.monitors.insert(monitor.id.clone(), monitor);
        Ok(())
    }

    /// Deactivate and remove a monitor, returning it.
    pub fn unregister(&self, id: &str) -> RiskResult<RiskMonitor> {
        let mut inner = self.inner.write();
        let mut monitor = inner
            .monitors
            .remove(id)
            .ok_or_else(|| RiskError::MonitorNotFound {
                monitor_id: id.to_string(),
            })?;
        inner
            .by_entity
            .remove(&(monitor.monitor_type, monitor.entity_id.clone()));
        monitor.active = false;
        Ok(monitor)
    }

    pub fn get(&self, id: &str) -> Option<RiskMonitor> {
        self.inner.read().monitors.get(id).cloned()
    }

    pub fn find(&self, monitor_type: MonitorType, entity_id: &str) -> Option<RiskMonitor> {
        let inner = self.inner.read();
        inner
            .by_entity
            .get(&(monitor_type, entity_id.to_string()))
            .and_then(|id| inner.monitors.get(id))
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().monitors.contains_key(id)
    }

    /// Replace a monitor's metrics snapshot in one critical section.
    pub fn update_metrics(&self, id: &str, mut metrics: RiskMetrics) -> RiskResult<()> {
        let mut inner = self.inner.write();
        let monitor = inner
            .monitors
            .get_mut(id)
            .ok_or_else(|| RiskError::MonitorNotFound {
                monitor_id: id.to_string(),
            })?;
        metrics.updated_at = Some(Utc::now());
        monitor.metrics = metrics;
        Ok(())
    }

    pub fn update_limits(&self, id: &str, limits: RiskLimits) -> RiskResult<()> {
        let mut inner = self.inner.write();
        let monitor = inner
            .monitors
            .get_mut(id)
            .ok_or_else(|| RiskError::MonitorNotFound {
                monitor_id: id.to_string(),
            })?;
        monitor.limits = limits;
        Ok(())
    }

    /// Bump a monitor's violation counter; unknown IDs are ignored.
    pub fn record_violation(&self, id: &str) {
        if let Some(monitor) = self.inner.write().monitors.get_mut(id) {
            monitor.violation_count += 1;
        }
    }

    pub fn mark_checked(&self, ids: &[String], at: DateTime<Utc>) {
        let mut inner = self.inner.write();
        for id in ids {
            if let Some(monitor) = inner.monitors.get_mut(id) {
                monitor.last_check = Some(at);
            }
        }
    }

    /// Copies of all active monitors.
    pub fn active_snapshot(&self) -> Vec<RiskMonitor> {
        self.inner
            .read()
            .monitors
            .values()
            .filter(|m| m.active)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
