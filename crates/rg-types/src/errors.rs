use thiserror::Error;

use crate::violation::RiskViolation;

/// Main error type for the RiskGate risk core
#[derive(Error, Debug)]
pub enum RiskError {
    #[error("Monitor already registered: {monitor_id}")]
    DuplicateMonitor { monitor_id: String },

    #[error("Monitor not found: {monitor_id}")]
    MonitorNotFound { monitor_id: String },

    #[error("Portfolio not found: {portfolio_id}")]
    PortfolioNotFound { portfolio_id: String },

    #[error("Portfolio already registered: {portfolio_id}")]
    DuplicatePortfolio { portfolio_id: String },

    #[error("Maximum number of portfolios reached: {max}")]
    MaxPortfoliosReached { max: usize },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Unsupported VaR method: {method}")]
    UnsupportedMethod { method: String },

    #[error("Invalid stress scenario {scenario}: {message}")]
    InvalidScenario { scenario: String, message: String },

    #[error("Arithmetic overflow: {context}")]
    Overflow { context: String },

    /// A blocking policy breach. This is an expected outcome of a risk check,
    /// not a defect.
    #[error("Risk violation: {0}")]
    Violation(Box<RiskViolation>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RiskError {
    /// Returns the violation record when this error is a policy breach.
    pub fn as_violation(&self) -> Option<&RiskViolation> {
        match self {
            RiskError::Violation(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_violation(&self) -> bool {
        matches!(self, RiskError::Violation(_))
    }
}

impl From<RiskViolation> for RiskError {
    fn from(violation: RiskViolation) -> Self {
        RiskError::Violation(Box::new(violation))
    }
}

/// Result type alias for risk-core operations
pub type RiskResult<T> = Result<T, RiskError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::RiskError::Config(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::errors::RiskError::Internal(format!($($arg)*))
    };
}
