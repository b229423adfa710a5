use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Daily trading window in UTC. A window whose `end` is earlier than its
/// `start` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TradingHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Whether `time` falls inside the window (start inclusive, end exclusive).
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Process-wide risk ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalRiskLimits {
    /// Maximum gross notional exposure across all portfolios.
    pub max_total_exposure: Decimal,
    /// Maximum loss for the day, as an absolute amount.
    pub max_daily_loss: Decimal,
    /// Maximum peak-to-trough drawdown as a fraction.
    pub max_drawdown: Decimal,
    /// Maximum notional of a single signal.
    pub max_position_size: Decimal,
    pub max_orders_per_second: Option<u32>,
    pub max_orders_per_minute: Option<u32>,
    pub max_orders_per_hour: Option<u32>,
    pub max_orders_per_day: Option<u32>,
    pub max_open_positions: usize,
    pub max_leverage: Decimal,
    pub min_cash_reserve: Decimal,
    pub var_limit: Decimal,
    /// When non-empty, only these symbols may trade.
    pub allowed_symbols: Vec<String>,
    pub blocked_symbols: Vec<String>,
    pub trading_hours: Option<TradingHours>,
}

impl Default for GlobalRiskLimits {
    fn default() -> Self {
        Self {
            max_total_exposure: Decimal::from(10_000_000),
            max_daily_loss: Decimal::from(500_000),
            max_drawdown: Decimal::new(20, 2), // 20%
            max_position_size: Decimal::from(1_000_000),
            max_orders_per_second: Some(50),
            max_orders_per_minute: Some(1_000),
            max_orders_per_hour: None,
            max_orders_per_day: None,
            max_open_positions: 500,
            max_leverage: Decimal::from(5),
            min_cash_reserve: Decimal::ZERO,
            var_limit: Decimal::from(1_000_000),
            allowed_symbols: Vec::new(),
            blocked_symbols: Vec::new(),
            trading_hours: None,
        }
    }
}

impl GlobalRiskLimits {
    pub fn is_symbol_allowed(&self, symbol: &str) -> bool {
        self.allowed_symbols.is_empty() || self.allowed_symbols.iter().any(|s| s == symbol)
    }

    pub fn is_symbol_blocked(&self, symbol: &str) -> bool {
        self.blocked_symbols.iter().any(|s| s == symbol)
    }
}

/// Limits scoped to a single entity (strategy, symbol, portfolio, exchange).
/// `None` disables the corresponding check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_total_exposure: Option<Decimal>,
    pub max_daily_loss: Option<Decimal>,
    pub max_drawdown: Option<Decimal>,
    pub max_position_size: Option<Decimal>,
    pub max_leverage: Option<Decimal>,
    pub min_cash_reserve: Option<Decimal>,
    pub var_limit: Option<Decimal>,
    pub max_open_positions: Option<usize>,
}

impl RiskLimits {
    /// Limits applied to freshly registered portfolios until the owner
    /// configures real ones.
    pub fn placeholder() -> Self {
        Self {
            max_total_exposure: Some(Decimal::from(1_000_000)),
            max_daily_loss: Some(Decimal::from(50_000)),
            max_drawdown: Some(Decimal::new(20, 2)),
            max_position_size: Some(Decimal::from(100_000)),
            max_leverage: Some(Decimal::from(3)),
            min_cash_reserve: None,
            var_limit: Some(Decimal::from(100_000)),
            max_open_positions: Some(100),
        }
    }
}

impl From<&GlobalRiskLimits> for RiskLimits {
    fn from(global: &GlobalRiskLimits) -> Self {
        Self {
            max_total_exposure: Some(global.max_total_exposure),
            max_daily_loss: Some(global.max_daily_loss),
            max_drawdown: Some(global.max_drawdown),
            max_position_size: Some(global.max_position_size),
            max_leverage: Some(global.max_leverage),
            min_cash_reserve: Some(global.min_cash_reserve),
            var_limit: Some(global.var_limit),
            max_open_positions: Some(global.max_open_positions),
        }
    }
}
