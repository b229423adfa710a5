use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("BUY"),
            Side::Sell => f.write_str("SELL"),
        }
    }
}

/// A proposed trade emitted by a strategy, gated by the risk core before
/// anything reaches an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub id: Uuid,
    pub strategy_id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Strategy confidence in `[0, 1]`.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl TradingSignal {
    pub fn new(
        strategy_id: &str,
        symbol: &str,
        exchange: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            side,
            quantity,
            price,
            confidence: 1.0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Absolute notional value (`|quantity| * price`). Saturates at
    /// `Decimal::MAX` instead of overflowing.
    pub fn notional(&self) -> Decimal {
        self.quantity
            .abs()
            .checked_mul(self.price.abs())
            .unwrap_or(Decimal::MAX)
    }

    /// Signed quantity: positive for buys, negative for sells.
    pub fn signed_quantity(&self) -> Decimal {
        match self.side {
            Side::Buy => self.quantity,
            Side::Sell => -self.quantity,
        }
    }
}
