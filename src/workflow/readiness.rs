//! Deployment readiness
//!
//! A pure read over a workflow record: which phases, gates and approvals are
//! still outstanding, expressed as severity-ordered blockers, plus the
//! compliance checklist agents mark off independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::blocker::{Blocker, BlockerKind};
use super::dispatch::{DispatchedTask, TaskKind, TaskStatus};
use super::gate::{evaluate, GateStatus};
use super::phase::Phase;
use super::redundancy::{aggregate, votes_for_phase, VoteRecord};
use super::state::WorkflowRecord;
use super::template::WorkflowTemplate;
use crate::{Error, Result};

/// Compliance areas verified before deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceCategory {
    Security,
    Performance,
    Testing,
    Documentation,
    Deployment,
    Compliance,
}

impl ComplianceCategory {
    pub fn all() -> Vec<ComplianceCategory> {
        vec![
            ComplianceCategory::Security,
            ComplianceCategory::Performance,
            ComplianceCategory::Testing,
            ComplianceCategory::Documentation,
            ComplianceCategory::Deployment,
            ComplianceCategory::Compliance,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ComplianceCategory::Security => "security",
            ComplianceCategory::Performance => "performance",
            ComplianceCategory::Testing => "testing",
            ComplianceCategory::Documentation => "documentation",
            ComplianceCategory::Deployment => "deployment",
            ComplianceCategory::Compliance => "compliance",
        }
    }
}

impl fmt::Display for ComplianceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ComplianceCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ComplianceCategory::all()
            .into_iter()
            .find(|c| c.name() == s.trim().to_lowercase())
            .ok_or_else(|| Error::Gate(format!("unknown compliance category: {}", s)))
    }
}

/// State of a checklist item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    /// Not yet verified
    Pending,
    Completed,
    Failed,
    NotApplicable,
}

impl fmt::Display for ChecklistStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecklistStatus::Pending => write!(f, "pending"),
            ChecklistStatus::Completed => write!(f, "completed"),
            ChecklistStatus::Failed => write!(f, "failed"),
            ChecklistStatus::NotApplicable => write!(f, "not_applicable"),
        }
    }
}

impl FromStr for ChecklistStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "completed" => Ok(ChecklistStatus::Completed),
            "failed" => Ok(ChecklistStatus::Failed),
            "not_applicable" | "n/a" => Ok(ChecklistStatus::NotApplicable),
            other => Err(Error::Gate(format!(
                "checklist status must be completed, failed or not_applicable, got {}",
                other
            ))),
        }
    }
}

/// One compliance category and who verified it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub category: ComplianceCategory,
    pub status: ChecklistStatus,
    #[serde(default)]
    pub verified_by: Option<String>,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ChecklistItem {
    pub fn pending(category: ComplianceCategory) -> Self {
        Self {
            category,
            status: ChecklistStatus::Pending,
            verified_by: None,
            verified_at: None,
            notes: None,
        }
    }
}

/// Deployment readiness verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentReadinessChecklist {
    pub all_phases_completed: bool,
    pub all_quality_gates_passed: bool,
    pub all_redundancies_satisfied: bool,
    /// AND of the three flags above
    pub deployment_ready: bool,
    /// Most severe first, then declared phase order
    pub blockers: Vec<Blocker>,
    pub checklist_items: Vec<ChecklistItem>,
}

impl DeploymentReadinessChecklist {
    /// Human-readable report
    pub fn summary(&self) -> String {
        let mark = |ok: bool| if ok { "✅" } else { "❌" };
        let mut lines = vec![
            format!(
                "Deployment ready: {}",
                if self.deployment_ready { "yes" } else { "no" }
            ),
            format!("  {} all phases completed", mark(self.all_phases_completed)),
            format!("  {} all quality gates passed", mark(self.all_quality_gates_passed)),
            format!("  {} all redundancies satisfied", mark(self.all_redundancies_satisfied)),
        ];

        if !self.blockers.is_empty() {
            lines.push(String::new());
            lines.push(format!("Blockers ({}):", self.blockers.len()));
            for blocker in &self.blockers {
                lines.push(format!("  {}", blocker));
            }
        }

        lines.push(String::new());
        lines.push("Checklist:".to_string());
        for item in &self.checklist_items {
            let by = item
                .verified_by
                .as_ref()
                .map(|agent| format!(" by {}", agent))
                .unwrap_or_default();
            lines.push(format!("  {}: {}{}", item.category, item.status, by));
        }

        lines.join("\n")
    }
}

/// The task a reviewer should look at for an incomplete phase: a failed one
/// first, otherwise whatever is still outstanding.
fn blocking_task<'a>(record: &'a WorkflowRecord, phase: &Phase) -> Option<&'a DispatchedTask> {
    let phase_tasks = || {
        record
            .tasks
            .iter()
            .filter(move |t| &t.phase == phase && t.kind == TaskKind::PhaseWork)
    };
    phase_tasks()
        .find(|t| t.status == TaskStatus::Failed)
        .or_else(|| {
            phase_tasks().find(|t| {
                matches!(t.status, TaskStatus::Scheduled | TaskStatus::Unscheduled)
            })
        })
}

/// Assess deployment readiness. Never mutates the record.
pub fn assess(
    template: &WorkflowTemplate,
    record: &WorkflowRecord,
    votes: &[VoteRecord],
) -> DeploymentReadinessChecklist {
    let mut blockers = Vec::new();

    let mut all_phases_completed = true;
    for phase in &template.phases {
        if record.instance.is_phase_completed(&phase.name) {
            continue;
        }
        all_phases_completed = false;

        let task = blocking_task(record, &phase.name);
        let (kind, description) = match task {
            Some(t) if t.status == TaskStatus::Failed => (
                BlockerKind::TaskFailed,
                format!(
                    "Phase {} is incomplete; task '{}' failed: {}",
                    phase.name,
                    t.title,
                    t.last_error.as_deref().unwrap_or("no error recorded")
                ),
            ),
            _ => (
                BlockerKind::PhaseIncomplete,
                format!("Phase {} is not complete", phase.name),
            ),
        };
        blockers.push(
            Blocker::new(
                kind,
                template.severity_for(&phase.name),
                phase.name.clone(),
                description,
                format!("Complete phase {} and advance it", phase.name),
            )
            .with_task(task.map(|t| t.id.clone())),
        );
    }

    let mut all_quality_gates_passed = true;
    for phase in &template.phases {
        for gate_id in &phase.quality_gates {
            let Some(gate) = record.gates.get(gate_id) else {
                all_quality_gates_passed = false;
                continue;
            };
            let verdict = evaluate(gate);
            if verdict.status == GateStatus::Passed {
                continue;
            }
            all_quality_gates_passed = false;
            blockers.push(
                Blocker::new(
                    BlockerKind::GateCriterionUnmet,
                    template.severity_for(&phase.name),
                    phase.name.clone(),
                    format!("Quality {}", verdict.summary()),
                    match verdict.status {
                        GateStatus::Failed => format!("Remediate and re-check gate {}", gate_id),
                        _ => format!("Record outstanding criteria on gate {}", gate_id),
                    },
                )
                .with_gate(gate_id.clone())
                .with_task(gate.remediation_task_id.clone()),
            );
        }
    }

    let mut all_redundancies_satisfied = true;
    for (phase, requirement) in &template.redundancy_requirements {
        let verdict = aggregate(requirement, &votes_for_phase(votes, phase));
        if verdict.approved {
            continue;
        }
        all_redundancies_satisfied = false;
        blockers.push(Blocker::new(
            BlockerKind::RedundancyUnmet,
            template.severity_for(phase),
            phase.clone(),
            format!(
                "Redundant approval ({}) for {} not met: {}",
                requirement.approval_rule,
                phase,
                verdict.reason.unwrap_or_default()
            ),
            format!(
                "Collect approvals from {}",
                requirement
                    .required_agent_types
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ));
    }

    blockers.sort_by_key(|b| {
        (
            b.severity,
            template.phase_index(&b.phase).unwrap_or(usize::MAX),
        )
    });

    let checklist_items = record.checklist.values().cloned().collect();

    DeploymentReadinessChecklist {
        all_phases_completed,
        all_quality_gates_passed,
        all_redundancies_satisfied,
        deployment_ready: all_phases_completed
            && all_quality_gates_passed
            && all_redundancies_satisfied,
        blockers,
        checklist_items,
    }
}
