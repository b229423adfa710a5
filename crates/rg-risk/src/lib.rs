//! Real-time risk gating for RiskGate.
//!
//! Provides:
//! - A registry of per-entity risk monitors with limit evaluation
//! - Pre-trade signal checks against global, strategy and symbol limits
//! - Circuit breakers fed by execution outcomes
//! - Value-at-Risk (historical, parametric, Monte Carlo, EWMA) and stress tests
//! - A service facade tracking portfolios and running background loops

pub mod alerts;
pub mod circuit_breaker;
pub mod compliance;
pub mod config;
pub mod engine;
pub mod monitor;
pub mod portfolio;
pub mod service;
pub mod tasks;
pub mod var;

pub use alerts::{AlertQueue, RiskAlert};
pub use circuit_breaker::{
    BlockingBreaker, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use compliance::{ComplianceChecker, ComplianceStatus};
pub use config::{RiskEngineConfig, RiskServiceConfig};
pub use engine::{RiskEngine, GLOBAL_MONITOR_ID};
pub use monitor::{MonitorType, RiskMetrics, RiskMonitor};
pub use portfolio::{PortfolioRisk, PositionRisk};
pub use service::{
    GlobalMetrics, RiskCheckRequest, RiskCheckResponse, RiskManagementService, ServiceMetrics,
};
pub use var::{
    StressTestResult, StressTestScenario, VaRCalculator, VaRConfig, VaRMethod, VaRResult,
    ValuePoint,
};
