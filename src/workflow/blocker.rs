//! Structured reasons a workflow cannot progress or deploy

use serde::{Deserialize, Serialize};
use std::fmt;

use super::phase::Phase;

/// Blocker severity, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
        }
    }
}

/// Why something is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerKind {
    /// A declared dependency phase is not complete
    DependencyUnmet,
    /// An earlier phase in declared order is not complete
    PhaseOrder,
    /// A quality gate has not passed
    GateCriterionUnmet,
    /// Multi-agent approval is missing or rejected
    RedundancyUnmet,
    /// A required criterion failed and can never pass; terminal
    IrrecoverableGateFailure,
    /// The phase has not been completed
    PhaseIncomplete,
    /// Dispatched work for the phase failed after its retries
    TaskFailed,
}

/// A severity-tagged reason a workflow cannot currently progress or deploy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub kind: BlockerKind,
    pub severity: Severity,
    pub phase: Phase,
    /// Human-readable description
    pub description: String,
    /// The action that unblocks this
    pub resolution_required: String,
    /// Gate involved, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<String>,
    /// Remediation or outstanding task, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_task_id: Option<String>,
}

impl Blocker {
    pub fn new(
        kind: BlockerKind,
        severity: Severity,
        phase: Phase,
        description: impl Into<String>,
        resolution_required: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            phase,
            description: description.into(),
            resolution_required: resolution_required.into(),
            gate_id: None,
            blocking_task_id: None,
        }
    }

    pub fn with_gate(mut self, gate_id: impl Into<String>) -> Self {
        self.gate_id = Some(gate_id.into());
        self
    }

    pub fn with_task(mut self, task_id: Option<String>) -> Self {
        self.blocking_task_id = task_id;
        self
    }

    /// Whether this blocker ends the workflow
    pub fn is_terminal(&self) -> bool {
        self.kind == BlockerKind::IrrecoverableGateFailure
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {} (resolve: {})",
            self.severity, self.phase, self.description, self.resolution_required
        )?;
        if let Some(task) = &self.blocking_task_id {
            write!(f, " [task {}]", task)?;
        }
        Ok(())
    }
}
