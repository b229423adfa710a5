use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Severity of a risk alert or violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Informational, within normal operating range.
    Info,
    /// Soft breach of an advisory limit.
    Warning,
    /// Hard breach; the offending trade is rejected.
    Error,
    /// Loss or drawdown breach requiring operator attention.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// The closed set of limit kinds a check can fail on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationType {
    SymbolNotAllowed,
    SymbolBlocked,
    PositionSize,
    TradingHours,
    OrderRate,
    OpenPositions,
    TotalExposure,
    StrategyExposure,
    SymbolExposure,
    DailyLoss,
    Drawdown,
    VaRLimit,
    Leverage,
    CashReserve,
    CircuitBreaker,
    Compliance,
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationType::SymbolNotAllowed => "symbol_not_allowed",
            ViolationType::SymbolBlocked => "symbol_blocked",
            ViolationType::PositionSize => "position_size",
            ViolationType::TradingHours => "trading_hours",
            ViolationType::OrderRate => "order_rate",
            ViolationType::OpenPositions => "open_positions",
            ViolationType::TotalExposure => "total_exposure",
            ViolationType::StrategyExposure => "strategy_exposure",
            ViolationType::SymbolExposure => "symbol_exposure",
            ViolationType::DailyLoss => "daily_loss",
            ViolationType::Drawdown => "drawdown",
            ViolationType::VaRLimit => "var_limit",
            ViolationType::Leverage => "leverage",
            ViolationType::CashReserve => "cash_reserve",
            ViolationType::CircuitBreaker => "circuit_breaker",
            ViolationType::Compliance => "compliance",
        };
        f.write_str(s)
    }
}

/// What the risk core did in response to a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskAction {
    /// Alert only; the trade may proceed.
    Alert,
    /// The trade was rejected.
    Reject,
    /// Trading was halted for the entity (circuit breaker open).
    Halt,
}

/// Immutable record of a failed risk check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskViolation {
    pub id: Uuid,
    pub monitor_id: String,
    pub entity_id: String,
    pub violation_type: ViolationType,
    pub limit_value: Decimal,
    pub actual_value: Decimal,
    pub severity: Severity,
    pub action: RiskAction,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

impl RiskViolation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitor_id: &str,
        entity_id: &str,
        violation_type: ViolationType,
        limit_value: Decimal,
        actual_value: Decimal,
        severity: Severity,
        action: RiskAction,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor_id: monitor_id.to_string(),
            entity_id: entity_id.to_string(),
            violation_type,
            limit_value,
            actual_value,
            severity,
            action,
            message,
            timestamp: Utc::now(),
            resolved: false,
        }
    }
}

impl fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} on {}: {}",
            self.severity, self.violation_type, self.entity_id, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn violation_display_names_entity_and_kind() {
        let v = RiskViolation::new(
            "strategy:grid",
            "grid",
            ViolationType::PositionSize,
            dec!(5_000),
            dec!(7_500),
            Severity::Error,
            RiskAction::Reject,
            "position size 7500 exceeds 5000".into(),
        );
        let text = v.to_string();
        assert!(text.contains("position_size"));
        assert!(text.contains("grid"));
        assert!(!v.resolved);
    }
}
