//! Seam to the external compliance-rule engine.

use serde::{Deserialize, Serialize};

use rg_types::errors::RiskResult;

use crate::service::RiskCheckRequest;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComplianceStatus {
    #[default]
    Compliant,
    NonCompliant { reasons: Vec<String> },
    /// The collaborator failed; the check went ahead without it.
    Unknown,
}

impl ComplianceStatus {
    pub fn is_compliant(&self) -> bool {
        matches!(self, ComplianceStatus::Compliant)
    }
}

/// Consulted synchronously on every risk check, so implementations must not
/// block on I/O.
pub trait ComplianceChecker: Send + Sync {
    fn check_compliance(&self, request: &RiskCheckRequest) -> RiskResult<ComplianceStatus>;
}
