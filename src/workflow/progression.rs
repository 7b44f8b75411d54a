//! Phase progression
//!
//! `advance` is the only code that moves an instance's status, current phase
//! and completed phases. A phase completes when:
//! 1. its dependencies and every earlier-declared phase are complete
//! 2. every gate it owns evaluates to passed
//! 3. its redundancy requirement, if any, aggregates to approved
//!
//! Anything else is recorded as structured blockers on the instance. A
//! required criterion that can never pass drives the instance to failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use super::blocker::{Blocker, BlockerKind, Severity};
use super::dispatch;
use super::gate::{evaluate, GateStatus};
use super::phase::Phase;
use super::redundancy::{aggregate, votes_for_phase, VoteRecord};
use super::state::{WorkflowRecord, WorkflowStatus};
use super::template::WorkflowTemplate;
use crate::Result;

/// When a failed required criterion counts as irrecoverable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// A rejected manual or agent review fails the workflow instead of
    /// waiting for a fresh approval
    #[serde(default)]
    pub fail_on_rejected_review: bool,
}

/// Result of an `advance` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// The phase was recorded as completed
    Advanced {
        phase: Phase,
        next_phase: Option<Phase>,
        workflow_completed: bool,
        /// Tasks dispatched for newly eligible phases
        dispatched: Vec<String>,
    },
    /// Already recorded; nothing changed
    AlreadyCompleted { phase: Phase },
    /// Exit criteria unmet; retry on the next event
    Blocked { phase: Phase, blockers: Vec<Blocker> },
    /// An irrecoverable failure ended the workflow
    Failed { phase: Phase, blockers: Vec<Blocker> },
    /// The instance was already completed or failed
    Closed { status: WorkflowStatus },
}

impl AdvanceOutcome {
    pub fn blockers(&self) -> &[Blocker] {
        match self {
            AdvanceOutcome::Blocked { blockers, .. } | AdvanceOutcome::Failed { blockers, .. } => {
                blockers
            }
            _ => &[],
        }
    }

    pub fn is_advanced(&self) -> bool {
        matches!(self, AdvanceOutcome::Advanced { .. })
    }
}

impl fmt::Display for AdvanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvanceOutcome::Advanced {
                phase,
                next_phase,
                workflow_completed,
                ..
            } => {
                if *workflow_completed {
                    write!(f, "{} completed; workflow completed", phase)
                } else {
                    match next_phase {
                        Some(next) => write!(f, "{} completed; next phase {}", phase, next),
                        None => write!(f, "{} completed", phase),
                    }
                }
            }
            AdvanceOutcome::AlreadyCompleted { phase } => write!(f, "{} already completed", phase),
            AdvanceOutcome::Blocked { phase, blockers } => {
                write!(f, "{} blocked ({} blockers)", phase, blockers.len())
            }
            AdvanceOutcome::Failed { phase, .. } => write!(f, "{} failed; workflow failed", phase),
            AdvanceOutcome::Closed { status } => write!(f, "workflow is {}", status),
        }
    }
}

/// First dispatch: move a not-started instance to in progress and dispatch
/// every phase whose dependencies are met. Returns the new task ids.
pub fn start(
    template: &WorkflowTemplate,
    record: &mut WorkflowRecord,
    default_tz: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    if record.instance.status == WorkflowStatus::NotStarted {
        record.set_status(WorkflowStatus::InProgress, now)?;
        info!(
            instance_id = %record.instance.id,
            template = %template.name,
            "Workflow started"
        );
    }
    dispatch::dispatch_ready_phases(template, record, default_tz, now)
}

/// Attempt to complete `phase`.
pub fn advance(
    template: &WorkflowTemplate,
    record: &mut WorkflowRecord,
    phase: &Phase,
    votes: &[VoteRecord],
    policy: FailurePolicy,
    default_tz: &str,
    now: DateTime<Utc>,
) -> Result<AdvanceOutcome> {
    let definition = template.require_phase(phase)?;
    let instance_id = record.instance.id;

    if record.instance.is_terminal() {
        debug!(instance_id = %instance_id, phase = %phase, status = %record.instance.status, "Advance on closed workflow");
        return Ok(AdvanceOutcome::Closed {
            status: record.instance.status,
        });
    }
    if record.instance.is_phase_completed(phase) {
        return Ok(AdvanceOutcome::AlreadyCompleted {
            phase: phase.clone(),
        });
    }
    if record.instance.status == WorkflowStatus::NotStarted {
        start(template, record, default_tz, now)?;
    }

    let severity = template.severity_for(phase);
    let mut blockers = Vec::new();

    let unmet: Vec<&Phase> = definition
        .dependencies
        .iter()
        .filter(|dep| !record.instance.is_phase_completed(dep))
        .collect();
    if !unmet.is_empty() {
        let names = join(&unmet);
        blockers.push(Blocker::new(
            BlockerKind::DependencyUnmet,
            severity,
            phase.clone(),
            format!("Phase dependency unmet: {} needs {}", phase, names),
            format!("Complete {} first", names),
        ));
    }

    let index = template.phase_index(phase).unwrap_or(0);
    let earlier: Vec<&Phase> = template.phases[..index]
        .iter()
        .map(|p| &p.name)
        .filter(|p| !record.instance.is_phase_completed(p) && !unmet.contains(p))
        .collect();
    if !earlier.is_empty() {
        let names = join(&earlier);
        blockers.push(Blocker::new(
            BlockerKind::PhaseOrder,
            severity,
            phase.clone(),
            format!("Phases complete in declared order; {} still open", names),
            format!("Advance {} first", names),
        ));
    }

    for gate_id in &definition.quality_gates {
        let gate = record.gate_mut(gate_id)?;
        gate.refresh(now);
        let verdict = evaluate(gate);
        if verdict.passed() {
            continue;
        }

        if gate.is_permanently_failed(policy.fail_on_rejected_review) {
            blockers.push(
                Blocker::new(
                    BlockerKind::IrrecoverableGateFailure,
                    Severity::Critical,
                    phase.clone(),
                    format!("Irrecoverable {}", verdict.summary()),
                    "Create a new workflow instance once the failure is addressed",
                )
                .with_gate(gate_id.clone()),
            );
            continue;
        }

        let resolution = match &gate.remediation_task_id {
            Some(task) => format!("Finish remediation task {} and re-check gate {}", task, gate_id),
            None if verdict.unmet.iter().any(|f| f.status == GateStatus::Failed) => {
                format!("Fix the failing criteria and re-check gate {}", gate_id)
            }
            None => format!("Record the outstanding criteria on gate {}", gate_id),
        };
        blockers.push(
            Blocker::new(
                BlockerKind::GateCriterionUnmet,
                severity,
                phase.clone(),
                format!("Quality {}", verdict.summary()),
                resolution,
            )
            .with_gate(gate_id.clone())
            .with_task(gate.remediation_task_id.clone()),
        );
    }
    record.sync_gate_status();

    if let Some(requirement) = template.redundancy_for(phase) {
        let verdict = aggregate(requirement, &votes_for_phase(votes, phase));
        if !verdict.approved {
            blockers.push(Blocker::new(
                BlockerKind::RedundancyUnmet,
                severity,
                phase.clone(),
                format!(
                    "Redundant approval ({}) not met: {}",
                    requirement.approval_rule,
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
    }

    if blockers.iter().any(Blocker::is_terminal) {
        // Terminal blockers lead; the first one names the failure
        blockers.sort_by_key(|b| !b.is_terminal());
        record.instance.failure_reason = Some(blockers[0].description.clone());
        record.instance.blockers = blockers.clone();
        record.set_status(WorkflowStatus::Failed, now)?;
        warn!(
            instance_id = %instance_id,
            phase = %phase,
            reason = %blockers[0].description,
            "Workflow failed"
        );
        return Ok(AdvanceOutcome::Failed {
            phase: phase.clone(),
            blockers,
        });
    }

    if !blockers.is_empty() {
        record.instance.blockers = blockers.clone();
        record.instance.updated_at = now;
        record.set_status(WorkflowStatus::Blocked, now)?;
        for blocker in &blockers {
            debug!(instance_id = %instance_id, phase = %phase, kind = ?blocker.kind, "{}", blocker.description);
        }
        info!(
            instance_id = %instance_id,
            phase = %phase,
            blockers = blockers.len(),
            "Phase blocked"
        );
        return Ok(AdvanceOutcome::Blocked {
            phase: phase.clone(),
            blockers,
        });
    }

    record.instance.record_phase_completion(phase, now);
    record.instance.blockers.clear();
    let next_phase = template
        .next_uncompleted(&record.instance.phases_completed)
        .cloned();
    record.instance.current_phase = next_phase.clone();

    let workflow_completed = next_phase.is_none();
    let target = if workflow_completed {
        WorkflowStatus::Completed
    } else {
        WorkflowStatus::InProgress
    };
    record.set_status(target, now)?;

    let dispatched = dispatch::dispatch_ready_phases(template, record, default_tz, now)?;
    info!(
        instance_id = %instance_id,
        phase = %phase,
        next_phase = ?next_phase.as_ref().map(|p| p.name()),
        dispatched = dispatched.len(),
        "Phase completed"
    );
    if workflow_completed {
        info!(instance_id = %instance_id, "Workflow completed");
    }

    Ok(AdvanceOutcome::Advanced {
        phase: phase.clone(),
        next_phase,
        workflow_completed,
        dispatched,
    })
}

/// Operator override: fail the workflow. Returns false if already failed.
pub fn fail(record: &mut WorkflowRecord, reason: &str, now: DateTime<Utc>) -> Result<bool> {
    if record.instance.status == WorkflowStatus::Failed {
        return Ok(false);
    }
    record.set_status(WorkflowStatus::Failed, now)?;
    record.instance.failure_reason = Some(reason.to_string());
    warn!(instance_id = %record.instance.id, reason, "Workflow failed by operator");
    Ok(true)
}

fn join(phases: &[&Phase]) -> String {
    phases
        .iter()
        .map(|p| p.name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::dispatch::TaskStatus;
    use crate::workflow::gate::{ApprovalEvent, CheckType};
    use crate::workflow::redundancy::VoteDecision;
    use crate::workflow::template::default_template;

    fn now() -> DateTime<Utc> {
        "2024-01-01T10:00:00Z".parse().unwrap()
    }

    fn setup() -> (WorkflowTemplate, WorkflowRecord) {
        let template = default_template().unwrap();
        let record = WorkflowRecord::new(&template, "proj", "parent", now());
        (template, record)
    }

    /// Satisfy every required criterion of every gate the phase owns
    fn pass_gates(template: &WorkflowTemplate, record: &mut WorkflowRecord, phase: &Phase) {
        for gate_id in &template.phase(phase).unwrap().quality_gates {
            let gate = record.gates.get_mut(gate_id).unwrap();
            let criteria: Vec<_> = gate
                .criteria
                .iter()
                .filter(|c| c.definition.required)
                .map(|c| (c.id().to_string(), c.definition.clone()))
                .collect();
            for (id, def) in criteria {
                match def.check_type {
                    CheckType::Automated => {
                        let value = match def.threshold {
                            Some(threshold) => threshold,
                            None => 1.0,
                        };
                        gate.record_measurement(&id, value, Some("ci"), now()).unwrap();
                    }
                    _ => {
                        gate.record_approval(
                            &id,
                            &ApprovalEvent {
                                agent_id: "reviewer".to_string(),
                                approved: true,
                                note: None,
                            },
                            now(),
                        )
                        .unwrap();
                    }
                }
            }
        }
    }

    fn approvals(template: &WorkflowTemplate, phase: &Phase) -> Vec<VoteRecord> {
        template
            .redundancy_for(phase)
            .map(|req| {
                req.required_agent_types
                    .iter()
                    .enumerate()
                    .map(|(i, agent_type)| VoteRecord {
                        sequence: i as u64 + 1,
                        phase: phase.clone(),
                        agent_id: format!("{}-1", agent_type),
                        agent_type: agent_type.clone(),
                        decision: VoteDecision::Approve,
                        cast_at: now(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn advance_now(
        template: &WorkflowTemplate,
        record: &mut WorkflowRecord,
        phase: &Phase,
        votes: &[VoteRecord],
    ) -> AdvanceOutcome {
        advance(template, record, phase, votes, FailurePolicy::default(), "UTC", now()).unwrap()
    }

    #[test]
    fn test_advance_auto_starts_and_blocks_on_pending_gate() {
        let (template, mut record) = setup();
        let outcome = advance_now(&template, &mut record, &Phase::Requirements, &[]);

        assert_eq!(record.instance.status, WorkflowStatus::Blocked);
        assert!(!record.tasks.is_empty(), "first advance dispatches work");
        let blockers = outcome.blockers();
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].kind, BlockerKind::GateCriterionUnmet);
        assert_eq!(blockers[0].gate_id.as_deref(), Some("requirements-signoff"));
        assert_eq!(record.instance.blockers, blockers);
    }

    #[test]
    fn test_dependency_unmet() {
        let (template, mut record) = setup();
        pass_gates(&template, &mut record, &Phase::Development);
        let outcome = advance_now(&template, &mut record, &Phase::Development, &[]);

        let kinds: Vec<BlockerKind> = outcome.blockers().iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![BlockerKind::DependencyUnmet, BlockerKind::PhaseOrder]);
        assert!(outcome.blockers()[0].description.contains("architecture"));
        assert!(record.instance.phases_completed.is_empty());
    }

    #[test]
    fn test_advance_success_and_idempotence() {
        let (template, mut record) = setup();
        pass_gates(&template, &mut record, &Phase::Requirements);

        let outcome = advance_now(&template, &mut record, &Phase::Requirements, &[]);
        match &outcome {
            AdvanceOutcome::Advanced {
                phase,
                next_phase,
                workflow_completed,
                dispatched,
            } => {
                assert_eq!(phase, &Phase::Requirements);
                assert_eq!(next_phase, &Some(Phase::Architecture));
                assert!(!workflow_completed);
                assert_eq!(dispatched.len(), 1);
            }
            other => panic!("expected advance, got {:?}", other),
        }
        assert_eq!(record.instance.current_phase, Some(Phase::Architecture));
        assert_eq!(record.instance.status, WorkflowStatus::InProgress);
        assert!(record.dispatched_phases.contains(&Phase::Architecture));

        let before = record.clone();
        let again = advance_now(&template, &mut record, &Phase::Requirements, &[]);
        assert_eq!(
            again,
            AdvanceOutcome::AlreadyCompleted {
                phase: Phase::Requirements
            }
        );
        assert_eq!(record, before);
    }

    #[test]
    fn test_repeated_blocked_advance_does_not_duplicate_blockers() {
        let (template, mut record) = setup();
        advance_now(&template, &mut record, &Phase::Requirements, &[]);
        let version = record.instance.status_version;
        advance_now(&template, &mut record, &Phase::Requirements, &[]);

        assert_eq!(record.instance.blockers.len(), 1);
        assert_eq!(record.instance.status_version, version);
    }

    #[test]
    fn test_redundancy_required() {
        let (template, mut record) = setup();
        pass_gates(&template, &mut record, &Phase::Requirements);
        advance_now(&template, &mut record, &Phase::Requirements, &[]);
        pass_gates(&template, &mut record, &Phase::Architecture);

        let outcome = advance_now(&template, &mut record, &Phase::Architecture, &[]);
        assert_eq!(outcome.blockers().len(), 1);
        assert_eq!(outcome.blockers()[0].kind, BlockerKind::RedundancyUnmet);

        let votes = approvals(&template, &Phase::Architecture);
        assert!(advance_now(&template, &mut record, &Phase::Architecture, &votes).is_advanced());
        assert_eq!(record.instance.status, WorkflowStatus::InProgress);
        assert!(record.instance.blockers.is_empty());
    }

    #[test]
    fn test_completion_order_is_enforced() {
        let (template, mut record) = setup();
        for phase in [Phase::Requirements, Phase::Architecture, Phase::Development] {
            pass_gates(&template, &mut record, &phase);
            let votes = approvals(&template, &phase);
            assert!(advance_now(&template, &mut record, &phase, &votes).is_advanced());
        }

        // Testing's gates pass first, but security and performance are still open
        pass_gates(&template, &mut record, &Phase::Testing);
        let outcome = advance_now(&template, &mut record, &Phase::Testing, &[]);
        assert_eq!(outcome.blockers()[0].kind, BlockerKind::PhaseOrder);
        assert!(!record.instance.is_phase_completed(&Phase::Testing));
    }

    #[test]
    fn test_full_run_completes() {
        let (template, mut record) = setup();
        for phase in Phase::standard() {
            pass_gates(&template, &mut record, &phase);
            let votes = approvals(&template, &phase);
            let outcome = advance_now(&template, &mut record, &phase, &votes);
            assert!(outcome.is_advanced(), "{} should advance: {:?}", phase, outcome);
        }

        assert_eq!(record.instance.status, WorkflowStatus::Completed);
        assert_eq!(record.instance.phases_completed, Phase::standard());
        assert_eq!(record.instance.current_phase, None);
        assert!(record
            .instance
            .quality_gates_status
            .values()
            .all(|s| *s == GateStatus::Passed));

        let outcome = advance_now(&template, &mut record, &Phase::FinalReview, &[]);
        assert_eq!(
            outcome,
            AdvanceOutcome::Closed {
                status: WorkflowStatus::Completed
            }
        );
    }

    #[test]
    fn test_exhausted_criterion_fails_workflow() {
        let (template, mut record) = setup();
        for phase in [Phase::Requirements, Phase::Architecture] {
            pass_gates(&template, &mut record, &phase);
            advance_now(&template, &mut record, &phase, &approvals(&template, &phase));
        }

        let gate = record.gates.get_mut("code-quality").unwrap();
        gate.record_measurement("lint_errors", 12.0, Some("ci"), now())
            .unwrap();
        gate.mark_exhausted("lint_errors").unwrap();

        let outcome = advance_now(&template, &mut record, &Phase::Development, &[]);
        assert!(matches!(outcome, AdvanceOutcome::Failed { .. }));
        assert_eq!(outcome.blockers()[0].kind, BlockerKind::IrrecoverableGateFailure);
        assert_eq!(record.instance.status, WorkflowStatus::Failed);
        assert!(record.instance.failure_reason.is_some());
        assert!(record
            .tasks
            .iter()
            .all(|t| t.status != TaskStatus::Scheduled));
    }

    #[test]
    fn test_terminal_blocker_leads_other_blockers() {
        let (template, mut record) = setup();
        let gate = record.gates.get_mut("code-quality").unwrap();
        gate.record_measurement("lint_errors", 12.0, Some("ci"), now())
            .unwrap();
        gate.mark_exhausted("lint_errors").unwrap();

        // Development's dependencies are still open too
        let outcome = advance_now(&template, &mut record, &Phase::Development, &[]);
        let blockers = outcome.blockers();
        assert!(blockers.len() > 1);
        assert!(blockers[0].is_terminal());
        assert!(blockers[1..].iter().all(|b| !b.is_terminal()));
        assert!(blockers.iter().any(|b| b.kind == BlockerKind::DependencyUnmet));
        assert_eq!(
            record.instance.failure_reason.as_deref(),
            Some(blockers[0].description.as_str())
        );
    }

    #[test]
    fn test_remediation_keeps_failure_recoverable() {
        let (template, mut record) = setup();
        let gate = record.gates.get_mut("requirements-signoff").unwrap();
        gate.record_approval(
            "stakeholder_signoff",
            &ApprovalEvent {
                agent_id: "po-1".to_string(),
                approved: false,
                note: None,
            },
            now(),
        )
        .unwrap();
        gate.remediation_task_id = Some("rewrite-reqs".to_string());

        let policy = FailurePolicy {
            fail_on_rejected_review: true,
        };
        let outcome = advance(
            &template,
            &mut record,
            &Phase::Requirements,
            &[],
            policy,
            "UTC",
            now(),
        )
        .unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Blocked { .. }));
        assert_eq!(
            outcome.blockers()[0].blocking_task_id.as_deref(),
            Some("rewrite-reqs")
        );

        record
            .gates
            .get_mut("requirements-signoff")
            .unwrap()
            .remediation_task_id = None;
        let outcome = advance(
            &template,
            &mut record,
            &Phase::Requirements,
            &[],
            policy,
            "UTC",
            now(),
        )
        .unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Failed { .. }));
    }

    #[test]
    fn test_operator_fail() {
        let (_, mut record) = setup();
        assert!(fail(&mut record, "cancelled by release manager", now()).unwrap());
        assert!(!fail(&mut record, "again", now()).unwrap());
        assert_eq!(record.instance.status, WorkflowStatus::Failed);
        assert_eq!(
            record.instance.failure_reason.as_deref(),
            Some("cancelled by release manager")
        );
    }

    #[test]
    fn test_unknown_phase() {
        let (template, mut record) = setup();
        let result = advance(
            &template,
            &mut record,
            &Phase::Custom("nope".to_string()),
            &[],
            FailurePolicy::default(),
            "UTC",
            now(),
        );
        assert!(matches!(result, Err(crate::Error::UnknownPhase(_))));
    }
}
