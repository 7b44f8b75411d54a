//! Delivery phases

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::blocker::Severity;

/// Standard delivery phases plus template-defined custom phases
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    /// Gather and sign off requirements
    Requirements,
    /// System design and review
    Architecture,
    /// Implementation
    Development,
    /// Security scanning and review
    Security,
    /// Performance budgets
    Performance,
    /// Test coverage and results
    Testing,
    /// User and operator documentation
    Documentation,
    /// Release engineering, rollback plans
    DeploymentPrep,
    /// Last sign-off before release
    FinalReview,
    /// User-defined phase
    Custom(String),
}

impl Phase {
    /// The nine standard phases in delivery order
    pub fn standard() -> Vec<Phase> {
        vec![
            Phase::Requirements,
            Phase::Architecture,
            Phase::Development,
            Phase::Security,
            Phase::Performance,
            Phase::Testing,
            Phase::Documentation,
            Phase::DeploymentPrep,
            Phase::FinalReview,
        ]
    }

    /// Get the name of this phase
    pub fn name(&self) -> &str {
        match self {
            Phase::Requirements => "requirements",
            Phase::Architecture => "architecture",
            Phase::Development => "development",
            Phase::Security => "security",
            Phase::Performance => "performance",
            Phase::Testing => "testing",
            Phase::Documentation => "documentation",
            Phase::DeploymentPrep => "deployment_prep",
            Phase::FinalReview => "final_review",
            Phase::Custom(name) => name,
        }
    }

    /// Default blocker severity for work stuck in this phase
    pub fn criticality(&self) -> Severity {
        match self {
            Phase::Security | Phase::DeploymentPrep | Phase::FinalReview => Severity::Critical,
            Phase::Requirements | Phase::Architecture | Phase::Development | Phase::Testing => {
                Severity::High
            }
            Phase::Performance | Phase::Custom(_) => Severity::Medium,
            Phase::Documentation => Severity::Low,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Phase {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        // Dashes are an accepted spelling of the built-in names only
        Ok(match name.replace('-', "_").as_str() {
            "requirements" => Phase::Requirements,
            "architecture" => Phase::Architecture,
            "development" => Phase::Development,
            "security" => Phase::Security,
            "performance" => Phase::Performance,
            "testing" => Phase::Testing,
            "documentation" => Phase::Documentation,
            "deployment_prep" => Phase::DeploymentPrep,
            "final_review" => Phase::FinalReview,
            _ => Phase::Custom(name),
        })
    }
}

impl From<String> for Phase {
    fn from(s: String) -> Self {
        match Phase::from_str(&s) {
            Ok(phase) => phase,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for Phase {
    fn from(s: &str) -> Self {
        Phase::from(s.to_string())
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.name().to_string()
    }
}
