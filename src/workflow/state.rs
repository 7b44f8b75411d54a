//! Workflow instance state
//!
//! Tracks an instance's progress through its template:
//! - Lifecycle status with a monotonically increasing version
//! - Completed phases, append-only and in declared order
//! - Gate state, dispatched tasks and compliance checklist marks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use super::blocker::Blocker;
use super::dispatch::{self, DispatchedTask};
use super::gate::{GateStatus, QualityGate};
use super::phase::Phase;
use super::readiness::{ChecklistItem, ChecklistStatus, ComplianceCategory};
use super::template::WorkflowTemplate;
use crate::{Error, Result};

/// Overall workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, nothing dispatched yet
    NotStarted,
    /// Work dispatched, no outstanding blockers
    InProgress,
    /// The last advance attempt recorded blockers
    Blocked,
    /// Every phase completed
    Completed,
    /// Irrecoverable gate failure or operator override
    Failed,
}

impl WorkflowStatus {
    pub fn can_transition_to(&self, target: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, target),
            (NotStarted, InProgress)
                | (NotStarted, Failed)
                | (InProgress, Blocked)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Blocked, InProgress)
                | (Blocked, Completed)
                | (Blocked, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::NotStarted => write!(f, "not_started"),
            WorkflowStatus::InProgress => write!(f, "in_progress"),
            WorkflowStatus::Blocked => write!(f, "blocked"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A parent task being driven through a template's phases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    /// Template name
    pub template: String,
    pub project_id: String,
    pub parent_task_id: String,
    pub status: WorkflowStatus,
    /// Bumped on every status change; stale dispatches compare against it
    pub status_version: u64,
    /// Next phase expected to complete; None once every phase is done
    pub current_phase: Option<Phase>,
    /// Append-only, no duplicates, declared order
    pub phases_completed: Vec<Phase>,
    /// Gate id -> last derived status
    pub quality_gates_status: BTreeMap<String, GateStatus>,
    /// Blockers from the most recent blocked or failed advance
    #[serde(default)]
    pub blockers: Vec<Blocker>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(
        template: &WorkflowTemplate,
        project_id: &str,
        parent_task_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            template: template.name.clone(),
            project_id: project_id.to_string(),
            parent_task_id: parent_task_id.to_string(),
            status: WorkflowStatus::NotStarted,
            status_version: 0,
            current_phase: template.phases.first().map(|p| p.name.clone()),
            phases_completed: Vec::new(),
            quality_gates_status: template
                .gates
                .keys()
                .map(|id| (id.clone(), GateStatus::Pending))
                .collect(),
            blockers: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `target`; returns false when already there
    pub fn transition(&mut self, target: WorkflowStatus, now: DateTime<Utc>) -> Result<bool> {
        if self.status == target {
            return Ok(false);
        }
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: target,
            });
        }

        self.status = target;
        self.status_version += 1;
        self.updated_at = now;
        if target.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(true)
    }

    pub fn is_phase_completed(&self, phase: &Phase) -> bool {
        self.phases_completed.contains(phase)
    }

    /// Append `phase` exactly once; returns false if it was already recorded
    pub fn record_phase_completion(&mut self, phase: &Phase, now: DateTime<Utc>) -> bool {
        if self.is_phase_completed(phase) {
            return false;
        }
        self.phases_completed.push(phase.clone());
        self.updated_at = now;
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Get summary of workflow progress
    pub fn summary(&self, template: &WorkflowTemplate) -> String {
        let mut lines = vec![
            format!("Workflow: {} ({})", self.template, self.id),
            format!("Project: {}  Parent task: {}", self.project_id, self.parent_task_id),
            format!("Status: {} (v{})", self.status, self.status_version),
            format!(
                "Current: {}",
                self.current_phase
                    .as_ref()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
        ];
        if let Some(reason) = &self.failure_reason {
            lines.push(format!("Failure: {}", reason));
        }
        lines.push(String::new());
        lines.push("Phases:".to_string());

        for phase in &template.phases {
            let icon = if self.is_phase_completed(&phase.name) {
                "✅"
            } else if self.current_phase.as_ref() == Some(&phase.name) {
                "🔄"
            } else {
                "⬜"
            };
            lines.push(format!("  {} {}", icon, phase.name));
            for gate_id in &phase.quality_gates {
                let status = self
                    .quality_gates_status
                    .get(gate_id)
                    .copied()
                    .unwrap_or(GateStatus::Pending);
                lines.push(format!("      gate {}: {}", gate_id, status));
            }
        }

        if !self.blockers.is_empty() {
            lines.push(String::new());
            lines.push("Blockers:".to_string());
            for blocker in &self.blockers {
                lines.push(format!("  {}", blocker));
            }
        }

        lines.join("\n")
    }
}

/// The persisted unit: an instance and everything it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub instance: WorkflowInstance,
    /// Gate id -> gate with recorded criteria
    pub gates: BTreeMap<String, QualityGate>,
    #[serde(default)]
    pub tasks: Vec<DispatchedTask>,
    /// Phases whose task templates have been dispatched
    #[serde(default)]
    pub dispatched_phases: BTreeSet<Phase>,
    #[serde(default)]
    pub checklist: BTreeMap<ComplianceCategory, ChecklistItem>,
}

impl WorkflowRecord {
    pub fn new(
        template: &WorkflowTemplate,
        project_id: &str,
        parent_task_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut gates = BTreeMap::new();
        for phase in &template.phases {
            for gate_id in &phase.quality_gates {
                if let Some(definition) = template.gates.get(gate_id) {
                    gates.insert(
                        gate_id.clone(),
                        QualityGate::from_definition(gate_id, definition, phase.name.clone()),
                    );
                }
            }
        }

        Self {
            instance: WorkflowInstance::new(template, project_id, parent_task_id, now),
            gates,
            tasks: Vec::new(),
            dispatched_phases: BTreeSet::new(),
            checklist: ComplianceCategory::all()
                .into_iter()
                .map(|c| (c, ChecklistItem::pending(c)))
                .collect(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.instance.id
    }

    pub fn gate(&self, gate_id: &str) -> Result<&QualityGate> {
        self.gates
            .get(gate_id)
            .ok_or_else(|| Error::UnknownGate(gate_id.to_string()))
    }

    pub fn gate_mut(&mut self, gate_id: &str) -> Result<&mut QualityGate> {
        self.gates
            .get_mut(gate_id)
            .ok_or_else(|| Error::UnknownGate(gate_id.to_string()))
    }

    pub fn task(&self, task_id: &str) -> Result<&DispatchedTask> {
        self.tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))
    }

    pub fn task_mut(&mut self, task_id: &str) -> Result<&mut DispatchedTask> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))
    }

    /// Change status and keep outstanding tasks consistent with it.
    ///
    /// Scheduled tasks are re-stamped with the new version; a move to failed
    /// cancels them instead.
    pub fn set_status(&mut self, target: WorkflowStatus, now: DateTime<Utc>) -> Result<bool> {
        if !self.instance.transition(target, now)? {
            return Ok(false);
        }
        if target == WorkflowStatus::Failed {
            dispatch::cancel_outstanding(self);
        } else {
            let version = self.instance.status_version;
            for task in self.tasks.iter_mut().filter(|t| t.is_outstanding()) {
                task.status_version = version;
            }
        }
        Ok(true)
    }

    /// Copy derived gate statuses onto the instance projection
    pub fn sync_gate_status(&mut self) {
        for (gate_id, gate) in &self.gates {
            self.instance
                .quality_gates_status
                .insert(gate_id.clone(), gate.status);
        }
    }

    /// Record an agent's verdict on a compliance category
    pub fn mark_checklist_item(
        &mut self,
        category: ComplianceCategory,
        status: ChecklistStatus,
        agent_id: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<&ChecklistItem> {
        if agent_id.trim().is_empty() {
            return Err(Error::Gate(format!(
                "checklist mark for {} carries no agent identity",
                category
            )));
        }
        let item = self
            .checklist
            .entry(category)
            .or_insert_with(|| ChecklistItem::pending(category));
        item.status = status;
        item.verified_by = Some(agent_id.to_string());
        item.verified_at = Some(now);
        item.notes = notes;
        self.instance.updated_at = now;
        Ok(item)
    }
}
