//! Events consumed from external collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::gate::ApprovalEvent;
use super::phase::Phase;
use super::redundancy::VoteDecision;

/// Reported by the task-execution subsystem when a dispatched task finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletionEvent {
    pub instance_id: Uuid,
    pub task_id: String,
    pub phase: Phase,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed { error: String },
}

/// A measurement or approval for one gate criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMeasurementEvent {
    pub instance_id: Uuid,
    pub gate_id: String,
    pub criterion_id: String,
    pub measurement: Measurement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    /// Automated check result
    Value {
        measured_value: f64,
        #[serde(default)]
        agent_id: Option<String>,
    },
    /// Manual sign-off or agent review
    Approval(ApprovalEvent),
}

/// A redundancy vote for a phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEvent {
    pub instance_id: Uuid,
    pub phase: Phase,
    pub agent_id: String,
    pub agent_type: String,
    pub decision: VoteDecision,
    /// When the agent cast it; the receive time otherwise
    #[serde(default)]
    pub cast_at: Option<DateTime<Utc>>,
}
