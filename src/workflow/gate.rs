//! Quality gate evaluation
//!
//! A gate is a phase-scoped checkpoint made of criteria:
//! - Automated: a measured value compared against a threshold
//! - Manual: explicit sign-off by a named agent
//! - AgentReview: explicit approval by a reviewing agent
//!
//! The gate's status is always derived from its criteria.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use super::phase::Phase;
use super::template::GateDefinition;
use crate::{Error, Result};

/// How a criterion is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    /// Threshold comparison on a measured value
    Automated,
    /// Human sign-off recorded by an agent
    Manual,
    /// Review verdict from an agent
    AgentReview,
}

impl CheckType {
    fn needs_approval(&self) -> bool {
        !matches!(self, CheckType::Automated)
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckType::Automated => write!(f, "automated"),
            CheckType::Manual => write!(f, "manual"),
            CheckType::AgentReview => write!(f, "agent_review"),
        }
    }
}

/// Comparison between a measured value and the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// measured >= threshold (coverage, scores)
    #[default]
    Gte,
    Gt,
    /// measured <= threshold (error counts, latency)
    Lte,
    Lt,
    Eq,
}

impl Comparator {
    pub fn holds(&self, measured: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gte => measured >= threshold,
            Comparator::Gt => measured > threshold,
            Comparator::Lte => measured <= threshold,
            Comparator::Lt => measured < threshold,
            Comparator::Eq => (measured - threshold).abs() < f64::EPSILON,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Comparator::Gte => ">=",
            Comparator::Gt => ">",
            Comparator::Lte => "<=",
            Comparator::Lt => "<",
            Comparator::Eq => "==",
        }
    }
}

/// Status of a gate or of one of its criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Passed,
    Failed,
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateStatus::Pending => write!(f, "pending"),
            GateStatus::Passed => write!(f, "passed"),
            GateStatus::Failed => write!(f, "failed"),
        }
    }
}

fn default_required() -> bool {
    true
}

/// Static description of a criterion, as written in a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionDefinition {
    pub id: String,
    pub name: String,
    pub check_type: CheckType,
    /// Advisory criteria are reported but never block the gate
    #[serde(default = "default_required")]
    pub required: bool,
    /// Automated criteria only; without one any non-zero measurement passes
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub comparator: Comparator,
}

/// A criterion together with its recorded outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateCriteria {
    #[serde(flatten)]
    pub definition: CriterionDefinition,
    pub status: GateStatus,
    #[serde(default)]
    pub measured_value: Option<f64>,
    /// Agent that measured or approved
    #[serde(default)]
    pub recorded_by: Option<String>,
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: Option<String>,
    /// Automated measurements taken so far
    #[serde(default)]
    pub attempts: u32,
    /// Automated retry budget spent
    #[serde(default)]
    pub exhausted: bool,
}

impl QualityGateCriteria {
    pub fn new(definition: CriterionDefinition) -> Self {
        Self {
            definition,
            status: GateStatus::Pending,
            measured_value: None,
            recorded_by: None,
            recorded_at: None,
            note: None,
            attempts: 0,
            exhausted: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Whether a failure can clear without a fresh approval event
    pub fn is_retryable(&self) -> bool {
        self.definition.check_type == CheckType::Automated && !self.exhausted
    }

    fn detail(&self) -> String {
        let def = &self.definition;
        match (self.status, def.check_type) {
            (GateStatus::Pending, CheckType::Automated) => "awaiting measurement".to_string(),
            (GateStatus::Pending, _) => format!("awaiting {} approval", def.check_type),
            (GateStatus::Failed, CheckType::Automated) => {
                let measured = self.measured_value.unwrap_or_default();
                match def.threshold {
                    Some(threshold) => format!(
                        "measured {} does not satisfy {} {}",
                        measured,
                        def.comparator.symbol(),
                        threshold
                    ),
                    None => format!("measured {} (expected non-zero)", measured),
                }
            }
            (GateStatus::Failed, _) => format!(
                "rejected by {}",
                self.recorded_by.as_deref().unwrap_or("unknown agent")
            ),
            (GateStatus::Passed, _) => "passed".to_string(),
        }
    }
}

/// An explicit approval or rejection for a manual / agent-review criterion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub agent_id: String,
    pub approved: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// A named, phase-scoped checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub id: String,
    pub name: String,
    pub phase: Phase,
    pub criteria: Vec<QualityGateCriteria>,
    /// Derived from criteria by `refresh`
    pub status: GateStatus,
    /// Stamped once, on the first transition into passed or failed; cleared
    /// when remediation returns the gate to pending
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checked_by_agent_ids: Vec<String>,
    /// Outstanding task expected to fix a failure
    #[serde(default)]
    pub remediation_task_id: Option<String>,
}

/// One criterion that is not passing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionFinding {
    pub criterion_id: String,
    pub name: String,
    pub check_type: CheckType,
    pub status: GateStatus,
    pub retryable: bool,
    pub detail: String,
}

impl From<&QualityGateCriteria> for CriterionFinding {
    fn from(criterion: &QualityGateCriteria) -> Self {
        Self {
            criterion_id: criterion.definition.id.clone(),
            name: criterion.definition.name.clone(),
            check_type: criterion.definition.check_type,
            status: criterion.status,
            retryable: criterion.is_retryable(),
            detail: criterion.detail(),
        }
    }
}

/// Reduction of a gate's criteria
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub gate_id: String,
    pub status: GateStatus,
    /// Required criteria that are pending or failed
    pub unmet: Vec<CriterionFinding>,
    /// Non-required criteria that are pending or failed
    pub advisory: Vec<CriterionFinding>,
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        self.status == GateStatus::Passed
    }

    /// One-line summary of what is missing
    pub fn summary(&self) -> String {
        if self.unmet.is_empty() {
            return format!("gate {} {}", self.gate_id, self.status);
        }
        let details: Vec<String> = self
            .unmet
            .iter()
            .map(|f| format!("{} ({})", f.criterion_id, f.detail))
            .collect();
        format!("gate {} {}: {}", self.gate_id, self.status, details.join(", "))
    }
}

/// Evaluate a gate. Pure and idempotent: unchanged criteria give the same verdict.
pub fn evaluate(gate: &QualityGate) -> GateVerdict {
    let mut unmet = Vec::new();
    let mut advisory = Vec::new();
    let mut any_failed = false;

    for criterion in &gate.criteria {
        if criterion.status == GateStatus::Passed {
            continue;
        }
        if criterion.definition.required {
            any_failed |= criterion.status == GateStatus::Failed;
            unmet.push(CriterionFinding::from(criterion));
        } else {
            advisory.push(CriterionFinding::from(criterion));
        }
    }

    let status = if any_failed {
        GateStatus::Failed
    } else if unmet.is_empty() {
        GateStatus::Passed
    } else {
        GateStatus::Pending
    };

    GateVerdict {
        gate_id: gate.id.clone(),
        status,
        unmet,
        advisory,
    }
}

impl QualityGate {
    /// Instantiate a gate from its template definition
    pub fn from_definition(id: &str, definition: &GateDefinition, phase: Phase) -> Self {
        Self {
            id: id.to_string(),
            name: definition.name.clone(),
            phase,
            criteria: definition
                .criteria
                .iter()
                .cloned()
                .map(QualityGateCriteria::new)
                .collect(),
            status: GateStatus::Pending,
            checked_at: None,
            checked_by_agent_ids: Vec::new(),
            remediation_task_id: None,
        }
    }

    pub fn criterion(&self, criterion_id: &str) -> Option<&QualityGateCriteria> {
        self.criteria.iter().find(|c| c.id() == criterion_id)
    }

    fn criterion_mut(&mut self, criterion_id: &str) -> Result<&mut QualityGateCriteria> {
        let gate = self.id.clone();
        self.criteria
            .iter_mut()
            .find(|c| c.id() == criterion_id)
            .ok_or_else(|| Error::UnknownCriterion {
                gate,
                criterion: criterion_id.to_string(),
            })
    }

    /// Record a measurement for an automated criterion
    pub fn record_measurement(
        &mut self,
        criterion_id: &str,
        measured_value: f64,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<GateVerdict> {
        let gate_id = self.id.clone();
        let criterion = self.criterion_mut(criterion_id)?;
        let def = &criterion.definition;

        if def.check_type.needs_approval() {
            return Err(Error::Gate(format!(
                "criterion {} on gate {} is {}; it needs an approval event, not a measurement",
                criterion_id, gate_id, def.check_type
            )));
        }
        if !measured_value.is_finite() {
            return Err(Error::Gate(format!(
                "measurement for {} on gate {} is not a finite number",
                criterion_id, gate_id
            )));
        }

        let holds = match def.threshold {
            Some(threshold) => def.comparator.holds(measured_value, threshold),
            None => measured_value != 0.0,
        };

        criterion.status = if holds {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        };
        criterion.measured_value = Some(measured_value);
        criterion.recorded_by = agent_id.map(str::to_string);
        criterion.recorded_at = Some(now);
        criterion.attempts += 1;

        debug!(
            gate = %gate_id,
            criterion = %criterion_id,
            measured_value,
            status = %criterion.status,
            "Recorded measurement"
        );

        self.refresh(now);
        Ok(evaluate(self))
    }

    /// Record an approval or rejection for a manual / agent-review criterion
    pub fn record_approval(
        &mut self,
        criterion_id: &str,
        event: &ApprovalEvent,
        now: DateTime<Utc>,
    ) -> Result<GateVerdict> {
        let gate_id = self.id.clone();
        if event.agent_id.trim().is_empty() {
            return Err(Error::Gate(format!(
                "approval for {} on gate {} carries no agent identity",
                criterion_id, gate_id
            )));
        }

        let criterion = self.criterion_mut(criterion_id)?;
        if !criterion.definition.check_type.needs_approval() {
            return Err(Error::Gate(format!(
                "criterion {} on gate {} is automated; it needs a measurement",
                criterion_id, gate_id
            )));
        }

        criterion.status = if event.approved {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        };
        criterion.recorded_by = Some(event.agent_id.clone());
        criterion.recorded_at = Some(now);
        criterion.note = event.note.clone();

        debug!(
            gate = %gate_id,
            criterion = %criterion_id,
            agent = %event.agent_id,
            approved = event.approved,
            "Recorded approval"
        );

        self.refresh(now);
        Ok(evaluate(self))
    }

    /// Mark an automated criterion's retry budget as spent
    pub fn mark_exhausted(&mut self, criterion_id: &str) -> Result<()> {
        self.criterion_mut(criterion_id)?.exhausted = true;
        Ok(())
    }

    /// Return failed criteria to pending, e.g. once remediation work lands
    pub fn reset_failed(&mut self, now: DateTime<Utc>) {
        for criterion in self
            .criteria
            .iter_mut()
            .filter(|c| c.status == GateStatus::Failed)
        {
            criterion.status = GateStatus::Pending;
            criterion.measured_value = None;
            criterion.recorded_by = None;
            criterion.recorded_at = None;
            criterion.note = None;
            criterion.attempts = 0;
            criterion.exhausted = false;
        }
        self.checked_at = None;
        self.checked_by_agent_ids.clear();
        self.refresh(now);
    }

    /// Re-derive the status; returns true when it changed.
    ///
    /// `checked_at` and `checked_by_agent_ids` are written once, on the first
    /// transition into passed or failed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let status = evaluate(self).status;
        if status == self.status {
            return false;
        }

        self.status = status;
        if status != GateStatus::Pending && self.checked_at.is_none() {
            self.checked_at = Some(now);
            self.checked_by_agent_ids = self
                .criteria
                .iter()
                .filter_map(|c| c.recorded_by.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
        }
        true
    }

    /// A required criterion failed, nothing will retry it, and no remediation
    /// task is outstanding.
    pub fn is_permanently_failed(&self, fail_on_rejected_review: bool) -> bool {
        if self.status != GateStatus::Failed || self.remediation_task_id.is_some() {
            return false;
        }
        self.criteria.iter().any(|c| {
            c.definition.required
                && c.status == GateStatus::Failed
                && match c.definition.check_type {
                    CheckType::Automated => c.exhausted,
                    CheckType::Manual | CheckType::AgentReview => fail_on_rejected_review,
                }
        })
    }
}
