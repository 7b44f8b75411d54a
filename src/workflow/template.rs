//! Workflow template parsing and validation
//!
//! A template is the immutable blueprint an instance runs against: ordered
//! phases, the gates each phase must pass, and per-phase redundancy
//! requirements. It is validated once, when loaded.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use super::blocker::Severity;
use super::gate::CriterionDefinition;
use super::phase::Phase;
use super::redundancy::RedundancyRequirement;
use crate::schedule::{self, RetryConfig, ScheduleSpec};
use crate::{Error, Result};

/// The built-in standard delivery template
pub const STANDARD_TEMPLATE: &str = include_str!("../../templates/standard-delivery.toml");

/// Main workflow template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Phases in declared (completion) order
    pub phases: Vec<PhaseDefinition>,
    /// Gate id -> definition
    #[serde(default)]
    pub gates: BTreeMap<String, GateDefinition>,
    /// Phases without an entry need no multi-agent approval
    #[serde(default)]
    pub redundancy_requirements: BTreeMap<Phase, RedundancyRequirement>,
}

/// One phase of a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: Phase,
    /// Phases that must be complete before this one's work is dispatched
    #[serde(default)]
    pub dependencies: Vec<Phase>,
    /// Gate ids this phase must pass
    #[serde(default)]
    pub quality_gates: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
    /// Overrides the phase's default blocker severity
    #[serde(default)]
    pub severity: Option<Severity>,
}

/// Criteria that make up a gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub criteria: Vec<CriterionDefinition>,
}

/// Work dispatched when a phase becomes eligible
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Capability tag of the agent expected to pick the task up
    pub agent_type: String,
    /// Absent: dispatch immediately
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    /// IANA zone for the schedule; the configured default otherwise
    #[serde(default)]
    pub timezone: Option<String>,
    /// Absent: failures are not retried
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("valid identifier regex"))
}

fn check_identifier(kind: &str, value: &str) -> Result<()> {
    if identifier_pattern().is_match(value) {
        Ok(())
    } else {
        Err(Error::Template(format!(
            "{} '{}' must match ^[a-z0-9][a-z0-9_-]*$",
            kind, value
        )))
    }
}

impl WorkflowTemplate {
    /// Load and validate a template from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Template(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a template from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let template: WorkflowTemplate = toml::from_str(content)
            .map_err(|e| Error::Template(format!("Failed to parse workflow template: {}", e)))?;
        template.validate()?;
        Ok(template)
    }

    /// Check every structural invariant of the template
    pub fn validate(&self) -> Result<()> {
        check_identifier("template name", &self.name)?;
        if self.phases.is_empty() {
            return Err(Error::Template(format!("template {} has no phases", self.name)));
        }

        let mut seen: HashSet<&Phase> = HashSet::new();
        let mut gate_owners: HashMap<&str, &Phase> = HashMap::new();

        for phase in &self.phases {
            check_identifier("phase", phase.name.name())?;

            for dep in &phase.dependencies {
                if dep == &phase.name {
                    return Err(Error::Template(format!("phase {} depends on itself", phase.name)));
                }
                if self.phase(dep).is_none() {
                    return Err(Error::Template(format!(
                        "phase {} depends on unknown phase {}",
                        phase.name, dep
                    )));
                }
                // Completion is ordered, so a dependency declared later could never be met
                if !seen.contains(dep) {
                    return Err(Error::Template(format!(
                        "phase {} depends on {}, which is declared after it",
                        phase.name, dep
                    )));
                }
            }

            if !seen.insert(&phase.name) {
                return Err(Error::Template(format!("duplicate phase {}", phase.name)));
            }

            for gate_id in &phase.quality_gates {
                if !self.gates.contains_key(gate_id) {
                    return Err(Error::Template(format!(
                        "phase {} references undefined gate {}",
                        phase.name, gate_id
                    )));
                }
                if let Some(owner) = gate_owners.insert(gate_id, &phase.name) {
                    return Err(Error::Template(format!(
                        "gate {} is referenced by both {} and {}",
                        gate_id, owner, phase.name
                    )));
                }
            }

            for task in &phase.tasks {
                self.validate_task(&phase.name, task)?;
            }
        }

        if let Some(cycle) = self.find_cycle() {
            let path: Vec<String> = cycle.iter().map(|p| p.to_string()).collect();
            return Err(Error::Template(format!(
                "dependency cycle: {}",
                path.join(" -> ")
            )));
        }

        for (gate_id, gate) in &self.gates {
            check_identifier("gate", gate_id)?;
            if !gate_owners.contains_key(gate_id.as_str()) {
                return Err(Error::Template(format!(
                    "gate {} is not referenced by any phase",
                    gate_id
                )));
            }
            if gate.criteria.is_empty() {
                return Err(Error::Template(format!("gate {} has no criteria", gate_id)));
            }
            let mut criteria = HashSet::new();
            for criterion in &gate.criteria {
                check_identifier("criterion", &criterion.id)?;
                if !criteria.insert(criterion.id.as_str()) {
                    return Err(Error::Template(format!(
                        "gate {} defines criterion {} twice",
                        gate_id, criterion.id
                    )));
                }
                if let Some(threshold) = criterion.threshold {
                    if !threshold.is_finite() {
                        return Err(Error::Template(format!(
                            "criterion {} on gate {} has a non-finite threshold",
                            criterion.id, gate_id
                        )));
                    }
                }
            }
        }

        for (phase, requirement) in &self.redundancy_requirements {
            if self.phase(phase).is_none() {
                return Err(Error::Template(format!(
                    "redundancy requirement for unknown phase {}",
                    phase
                )));
            }
            requirement.validate(phase)?;
        }

        Ok(())
    }

    fn validate_task(&self, phase: &Phase, task: &TaskTemplate) -> Result<()> {
        if task.agent_type.trim().is_empty() {
            return Err(Error::Template(format!(
                "task '{}' in phase {} has no agent_type",
                task.title, phase
            )));
        }
        let timezone = task.timezone.as_deref().unwrap_or("UTC");
        if let Some(spec) = &task.schedule {
            schedule::validate(spec, timezone)?;
        } else if task.timezone.is_some() {
            schedule::parse_timezone(timezone)?;
        }
        if let Some(retry) = &task.retry {
            retry.validate()?;
        }
        Ok(())
    }

    /// Depth-first search over dependency edges; returns the cycle if one exists
    fn find_cycle(&self) -> Option<Vec<Phase>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            template: &WorkflowTemplate,
            phase: &Phase,
            marks: &mut HashMap<Phase, Mark>,
            path: &mut Vec<Phase>,
        ) -> Option<Vec<Phase>> {
            match marks.get(phase) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| p == phase).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(phase.clone());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(phase.clone(), Mark::Visiting);
            path.push(phase.clone());
            if let Some(def) = template.phase(phase) {
                for dep in &def.dependencies {
                    if let Some(cycle) = visit(template, dep, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(phase.clone(), Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        for phase in &self.phases {
            let mut path = Vec::new();
            if let Some(cycle) = visit(self, &phase.name, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    pub fn phase(&self, phase: &Phase) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| &p.name == phase)
    }

    /// Position in declared order
    pub fn phase_index(&self, phase: &Phase) -> Option<usize> {
        self.phases.iter().position(|p| &p.name == phase)
    }

    /// Resolve a phase name against this template
    pub fn require_phase(&self, phase: &Phase) -> Result<&PhaseDefinition> {
        self.phase(phase)
            .ok_or_else(|| Error::UnknownPhase(phase.to_string()))
    }

    /// First phase in declared order that is not in `completed`
    pub fn next_uncompleted(&self, completed: &[Phase]) -> Option<&Phase> {
        self.phases
            .iter()
            .map(|p| &p.name)
            .find(|p| !completed.contains(p))
    }

    /// The phase that references `gate_id`
    pub fn gate_owner(&self, gate_id: &str) -> Option<&Phase> {
        self.phases
            .iter()
            .find(|p| p.quality_gates.iter().any(|g| g == gate_id))
            .map(|p| &p.name)
    }

    pub fn redundancy_for(&self, phase: &Phase) -> Option<&RedundancyRequirement> {
        self.redundancy_requirements.get(phase)
    }

    /// Blocker severity for a phase: explicit override, else the phase default
    pub fn severity_for(&self, phase: &Phase) -> Severity {
        self.phase(phase)
            .and_then(|p| p.severity)
            .unwrap_or_else(|| phase.criticality())
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Template: {}", self.name)];
        if let Some(description) = &self.description {
            lines.push(description.clone());
        }
        lines.push(String::new());
        lines.push("Phases:".to_string());

        for (i, phase) in self.phases.iter().enumerate() {
            let mut line = format!("  {}. {} [{}]", i + 1, phase.name, self.severity_for(&phase.name));
            if !phase.dependencies.is_empty() {
                let deps: Vec<&str> = phase.dependencies.iter().map(|d| d.name()).collect();
                line.push_str(&format!(" after {}", deps.join(", ")));
            }
            lines.push(line);

            for gate_id in &phase.quality_gates {
                if let Some(gate) = self.gates.get(gate_id) {
                    lines.push(format!(
                        "     gate {} ({} criteria)",
                        gate_id,
                        gate.criteria.len()
                    ));
                }
            }
            if let Some(req) = self.redundancy_for(&phase.name) {
                let types: Vec<&str> = req.required_agent_types.iter().map(String::as_str).collect();
                lines.push(format!(
                    "     approval: {} of {} ({} needed)",
                    req.approval_rule,
                    types.join(", "),
                    req.min_approvals
                ));
            }
            for task in &phase.tasks {
                let when = task
                    .schedule
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "immediately".to_string());
                lines.push(format!("     task '{}' -> {} ({})", task.title, task.agent_type, when));
            }
        }

        lines.join("\n")
    }
}

/// The built-in standard delivery template
pub fn default_template() -> Result<WorkflowTemplate> {
    WorkflowTemplate::parse(STANDARD_TEMPLATE)
}
