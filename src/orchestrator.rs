//! Event-driven orchestration service
//!
//! The orchestrator is not a polling loop. Collaborators call in with task
//! completions, gate measurements and votes; each call loads the instance
//! record, applies the event under that instance's lock, and saves it back.
//! The lock is held in-process and, for shared stores, through the store's
//! own cross-process lock. Votes are the exception: they go straight to the
//! store's append-only log and never take the instance lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::schedule::RetryDecision;
use crate::workflow::dispatch::{self, DispatchedTask, TaskKind, TaskStatus};
use crate::workflow::events::{
    Measurement, QualityMeasurementEvent, TaskCompletionEvent, TaskOutcome, VoteEvent,
};
use crate::workflow::gate::{evaluate, GateStatus, GateVerdict};
use crate::workflow::progression::{self, AdvanceOutcome};
use crate::workflow::readiness::{
    self, ChecklistItem, ChecklistStatus, ComplianceCategory, DeploymentReadinessChecklist,
};
use crate::workflow::redundancy::{aggregate, votes_for_phase, ApprovalVerdict, VoteRecord};
use crate::workflow::state::{WorkflowInstance, WorkflowRecord};
use crate::workflow::store::{StoreLock, WorkflowStore};
use crate::workflow::template::WorkflowTemplate;
use crate::workflow::Phase;
use crate::{Error, Result};

/// Result of a gate measurement or approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementOutcome {
    pub verdict: GateVerdict,
    /// Re-check scheduled by the retry policy after a failed measurement
    pub recheck: Option<DispatchedTask>,
    /// The criterion's retry budget is spent
    pub exhausted: bool,
    pub advance: Option<AdvanceOutcome>,
}

/// Result of a vote submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteOutcome {
    /// The vote as appended to the log
    pub vote: VoteRecord,
    /// Aggregation after the vote; None when the phase needs no approval
    pub verdict: Option<ApprovalVerdict>,
    pub advance: Option<AdvanceOutcome>,
}

/// A task ready for the external dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DueTask {
    pub instance_id: Uuid,
    #[serde(flatten)]
    pub task: DispatchedTask,
}

type LockMap = StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>;

/// Drives workflow instances in response to external events
pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
    config: Config,
    templates: RwLock<HashMap<String, Arc<WorkflowTemplate>>>,
    /// Entries live only while some call holds or waits on the instance
    locks: LockMap,
}

/// Exclusive hold on one instance for a load-modify-save cycle
struct InstanceGuard<'a> {
    locks: &'a LockMap,
    id: Uuid,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    store: Option<StoreLock>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        drop(self.store.take());
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Nobody else holds or waits: only the map and this guard refer to it
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.id);
        }
    }
}

impl Orchestrator {
    pub fn new(store: Arc<dyn WorkflowStore>, config: Config) -> Self {
        Self {
            store,
            config,
            templates: RwLock::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prepare the store
    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.store.shutdown().await
    }

    /// Register a template by name, replacing any previous one
    pub async fn register_template(&self, template: WorkflowTemplate) -> Result<()> {
        template.validate()?;
        info!(template = %template.name, phases = template.phases.len(), "Registered template");
        self.templates
            .write()
            .await
            .insert(template.name.clone(), Arc::new(template));
        Ok(())
    }

    pub async fn template(&self, name: &str) -> Result<Arc<WorkflowTemplate>> {
        self.templates
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))
    }

    async fn exclusive(&self, id: Uuid) -> Result<InstanceGuard<'_>> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let mut held = InstanceGuard {
            locks: &self.locks,
            id,
            lock,
            guard: None,
            store: None,
        };
        held.guard = Some(held.lock.clone().lock_owned().await);
        held.store = Some(self.store.lock(id).await?);
        Ok(held)
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowRecord> {
        self.store
            .load(id)
            .await?
            .ok_or(Error::InstanceNotFound(id))
    }

    fn default_tz(&self) -> &str {
        &self.config.orchestrator.default_timezone
    }

    /// Create a not-started instance of a registered template
    pub async fn create_instance(
        &self,
        template_name: &str,
        project_id: &str,
        parent_task_id: &str,
    ) -> Result<WorkflowInstance> {
        let template = self.template(template_name).await?;
        let record = WorkflowRecord::new(&template, project_id, parent_task_id, Utc::now());
        self.store.save(&record).await?;
        info!(
            instance_id = %record.instance.id,
            template = %template.name,
            project = %project_id,
            "Created workflow instance"
        );
        Ok(record.instance)
    }

    /// First dispatch. Returns the tasks dispatched by this call.
    pub async fn start(&self, id: Uuid) -> Result<Vec<DispatchedTask>> {
        let _held = self.exclusive(id).await?;

        let mut record = self.load(id).await?;
        let template = self.template(&record.instance.template).await?;
        let ids = progression::start(&template, &mut record, self.default_tz(), Utc::now())?;
        self.store.save(&record).await?;

        Ok(record
            .tasks
            .into_iter()
            .filter(|t| ids.contains(&t.id))
            .collect())
    }

    /// Read-only projection of an instance
    pub async fn instance_status(&self, id: Uuid) -> Result<WorkflowInstance> {
        Ok(self.load(id).await?.instance)
    }

    /// The full persisted record
    pub async fn record(&self, id: Uuid) -> Result<WorkflowRecord> {
        self.load(id).await
    }

    pub async fn list_instances(&self) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|r| r.instance)
            .collect())
    }

    /// Attempt to complete `phase`
    pub async fn advance_phase(&self, id: Uuid, phase: &Phase) -> Result<AdvanceOutcome> {
        let _held = self.exclusive(id).await?;

        let mut record = self.load(id).await?;
        let template = self.template(&record.instance.template).await?;
        let outcome = self
            .advance_locked(&template, &mut record, phase, Utc::now())
            .await?;
        self.store.save(&record).await?;
        Ok(outcome)
    }

    /// Caller holds the instance lock. Votes are read as one snapshot.
    async fn advance_locked(
        &self,
        template: &WorkflowTemplate,
        record: &mut WorkflowRecord,
        phase: &Phase,
        now: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        let votes = self.store.votes(record.id()).await?;
        progression::advance(
            template,
            record,
            phase,
            &votes,
            self.config.failure_policy(),
            self.default_tz(),
            now,
        )
    }

    /// Advance again if configured and `phase` is the next one due
    async fn auto_advance(
        &self,
        template: &WorkflowTemplate,
        record: &mut WorkflowRecord,
        phase: &Phase,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<AdvanceOutcome>> {
        if !self.config.orchestrator.auto_advance || record.instance.is_terminal() {
            return Ok(None);
        }
        if !force && record.instance.current_phase.as_ref() != Some(phase) {
            return Ok(None);
        }
        debug!(instance_id = %record.id(), phase = %phase, "Auto-advancing");
        let outcome = self.advance_locked(template, record, phase, now).await?;

        // Later phases whose gates already passed complete in the same call
        let mut next = next_phase_of(&outcome);
        while let Some(candidate) = next.take() {
            if !gates_passed(template, record, &candidate) {
                break;
            }
            debug!(instance_id = %record.id(), phase = %candidate, "Cascading advance");
            next = next_phase_of(&self.advance_locked(template, record, &candidate, now).await?);
        }
        Ok(Some(outcome))
    }

    /// Compute deployment readiness
    pub async fn deployment_readiness(&self, id: Uuid) -> Result<DeploymentReadinessChecklist> {
        let record = self.load(id).await?;
        let template = self.template(&record.instance.template).await?;
        let votes = self.store.votes(id).await?;
        Ok(readiness::assess(&template, &record, &votes))
    }

    /// Apply a task completion reported by the task-execution subsystem
    pub async fn handle_task_completion(
        &self,
        event: TaskCompletionEvent,
    ) -> Result<Option<AdvanceOutcome>> {
        let _held = self.exclusive(event.instance_id).await?;

        let now = Utc::now();
        let mut record = self.load(event.instance_id).await?;
        let template = self.template(&record.instance.template).await?;

        let task = record.task_mut(&event.task_id)?;
        if task.phase != event.phase {
            return Err(Error::UnknownTask(format!(
                "{} (belongs to {}, not {})",
                event.task_id, task.phase, event.phase
            )));
        }
        if !task.is_outstanding() {
            debug!(
                instance_id = %event.instance_id,
                task_id = %event.task_id,
                status = %task.status,
                "Ignoring completion for task that is not outstanding"
            );
            return Ok(None);
        }

        let kind = task.kind.clone();
        let task_id = task.id.clone();
        let succeeded = match &event.outcome {
            TaskOutcome::Succeeded => {
                task.status = TaskStatus::Completed;
                info!(instance_id = %event.instance_id, task_id = %task_id, phase = %event.phase, "Task completed");
                true
            }
            TaskOutcome::Failed { error } => {
                let decision = dispatch::schedule_retry(task, error.clone(), now);
                if let (RetryDecision::GiveUp { .. }, TaskKind::Remediation { gate_id }) =
                    (decision, &kind)
                {
                    let gate = record.gate_mut(gate_id)?;
                    if gate.remediation_task_id.as_deref() == Some(task_id.as_str()) {
                        gate.remediation_task_id = None;
                    }
                }
                false
            }
        };

        if succeeded {
            if let TaskKind::Remediation { gate_id } = &kind {
                let gate = record.gate_mut(gate_id)?;
                gate.reset_failed(now);
                if gate.remediation_task_id.as_deref() == Some(task_id.as_str()) {
                    gate.remediation_task_id = None;
                }
                record.sync_gate_status();
                info!(instance_id = %event.instance_id, gate = %gate_id, "Remediation landed; gate reset");
            }
        }

        let advance = if succeeded && kind == TaskKind::PhaseWork {
            self.auto_advance(&template, &mut record, &event.phase, false, now)
                .await?
        } else {
            None
        };

        self.store.save(&record).await?;
        Ok(advance)
    }

    /// Apply a measurement or approval to a gate criterion
    pub async fn record_measurement(
        &self,
        event: QualityMeasurementEvent,
    ) -> Result<MeasurementOutcome> {
        let _held = self.exclusive(event.instance_id).await?;

        let now = Utc::now();
        let mut record = self.load(event.instance_id).await?;
        let template = self.template(&record.instance.template).await?;
        ensure_open(&record)?;

        let gate = record.gate_mut(&event.gate_id)?;
        let phase = gate.phase.clone();
        let mut retry_after = None;
        let mut exhausted = false;

        let verdict = match &event.measurement {
            Measurement::Value {
                measured_value,
                agent_id,
            } => {
                gate.record_measurement(
                    &event.criterion_id,
                    *measured_value,
                    agent_id.as_deref(),
                    now,
                )?;
                let (status, attempts) = gate
                    .criterion(&event.criterion_id)
                    .map(|c| (c.status, c.attempts))
                    .unwrap_or((GateStatus::Pending, 0));

                if status == GateStatus::Failed {
                    match self.config.retry.decide(attempts) {
                        RetryDecision::Retry {
                            next_attempt,
                            delay,
                        } => retry_after = Some((attempts, next_attempt, delay)),
                        RetryDecision::GiveUp { attempts } => {
                            gate.mark_exhausted(&event.criterion_id)?;
                            exhausted = true;
                            warn!(
                                instance_id = %event.instance_id,
                                gate = %event.gate_id,
                                criterion = %event.criterion_id,
                                attempts,
                                "Gate criterion retries exhausted"
                            );
                        }
                    }
                }
                evaluate(gate)
            }
            Measurement::Approval(approval) => {
                gate.record_approval(&event.criterion_id, approval, now)?
            }
        };

        let permanently_failed =
            gate.is_permanently_failed(self.config.orchestrator.fail_on_rejected_review);
        let gate_passed = verdict.passed();

        // Earlier re-checks of this criterion are superseded by this result
        for task in record.tasks.iter_mut().filter(|t| {
            t.is_outstanding()
                && t.kind
                    == TaskKind::GateRecheck {
                        gate_id: event.gate_id.clone(),
                        criterion_id: event.criterion_id.clone(),
                    }
        }) {
            task.status = TaskStatus::Completed;
        }
        record.sync_gate_status();

        let advance = if gate_passed || permanently_failed {
            self.auto_advance(&template, &mut record, &phase, permanently_failed, now)
                .await?
        } else {
            None
        };

        // Stamped with the status the instance ends up in, not the one it started from
        let recheck = match retry_after {
            Some((attempts, next_attempt, delay)) if !record.instance.is_terminal() => {
                let mut task = DispatchedTask::new(
                    phase.clone(),
                    format!("Re-check {} on {}", event.criterion_id, event.gate_id),
                    "automated_check",
                    TaskKind::GateRecheck {
                        gate_id: event.gate_id.clone(),
                        criterion_id: event.criterion_id.clone(),
                    },
                    record.instance.status_version,
                );
                task.attempts = attempts;
                task.scheduled_for = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d));
                info!(
                    instance_id = %event.instance_id,
                    gate = %event.gate_id,
                    criterion = %event.criterion_id,
                    next_attempt,
                    delay = %humantime::format_duration(delay),
                    "Scheduled gate re-check"
                );
                record.tasks.push(task.clone());
                Some(task)
            }
            _ => None,
        };

        self.store.save(&record).await?;
        Ok(MeasurementOutcome {
            verdict,
            recheck,
            exhausted,
            advance,
        })
    }

    /// Append a vote to the instance's log
    pub async fn submit_vote(&self, event: VoteEvent) -> Result<VoteOutcome> {
        if event.agent_id.trim().is_empty() || event.agent_type.trim().is_empty() {
            return Err(Error::Gate("vote carries no agent identity".to_string()));
        }

        let record = self.load(event.instance_id).await?;
        let template = self.template(&record.instance.template).await?;
        template.require_phase(&event.phase)?;
        ensure_open(&record)?;

        let vote = VoteRecord {
            sequence: 0,
            phase: event.phase.clone(),
            agent_id: event.agent_id.clone(),
            agent_type: event.agent_type.clone(),
            decision: event.decision,
            cast_at: event.cast_at.unwrap_or_else(Utc::now),
        };
        let vote = self.store.append_vote(event.instance_id, vote).await?;
        info!(
            instance_id = %event.instance_id,
            phase = %vote.phase,
            agent = %vote.agent_id,
            agent_type = %vote.agent_type,
            decision = %vote.decision,
            sequence = vote.sequence,
            "Recorded vote"
        );

        let verdict = match template.redundancy_for(&event.phase) {
            Some(requirement) => {
                let votes = self.store.votes(event.instance_id).await?;
                Some(aggregate(requirement, &votes_for_phase(&votes, &event.phase)))
            }
            None => None,
        };

        let approved = verdict.as_ref().map(|v| v.approved).unwrap_or(false);
        let advance = if approved && self.config.orchestrator.auto_advance {
            // The append above ran unlocked; only the advance needs the lock
            let _held = self.exclusive(event.instance_id).await?;
            let mut record = self.load(event.instance_id).await?;
            let advance = self
                .auto_advance(&template, &mut record, &event.phase, false, Utc::now())
                .await?;
            if advance.is_some() {
                self.store.save(&record).await?;
            }
            advance
        } else {
            None
        };

        Ok(VoteOutcome {
            vote,
            verdict,
            advance,
        })
    }

    /// Dispatch a remediation task for a failed gate
    pub async fn assign_remediation(
        &self,
        id: Uuid,
        gate_id: &str,
        title: &str,
        agent_type: &str,
    ) -> Result<DispatchedTask> {
        let _held = self.exclusive(id).await?;

        let now = Utc::now();
        let mut record = self.load(id).await?;
        ensure_open(&record)?;
        let template = self.template(&record.instance.template).await?;
        let version = record.instance.status_version;

        let gate = record.gate(gate_id)?;
        if gate.status != GateStatus::Failed {
            return Err(Error::Gate(format!(
                "gate {} is {}; only failed gates take remediation",
                gate_id, gate.status
            )));
        }
        let previous = gate.remediation_task_id.clone();
        // Remediation is work for the phase that owns the gate
        let phase = template.gate_owner(gate_id).cloned().ok_or_else(|| {
            Error::Gate(format!(
                "gate {} belongs to no phase of template {}",
                gate_id, template.name
            ))
        })?;

        if let Some(previous) = previous {
            if let Ok(task) = record.task_mut(&previous) {
                if task.is_outstanding() {
                    task.status = TaskStatus::Cancelled;
                }
            }
        }

        let mut task = DispatchedTask::new(
            phase,
            title,
            agent_type,
            TaskKind::Remediation {
                gate_id: gate_id.to_string(),
            },
            version,
        );
        task.scheduled_for = Some(now);
        task.retry = Some(self.config.retry.clone());

        record.gate_mut(gate_id)?.remediation_task_id = Some(task.id.clone());
        record.tasks.push(task.clone());
        record.instance.updated_at = now;
        self.store.save(&record).await?;

        info!(instance_id = %id, gate = %gate_id, task_id = %task.id, "Assigned remediation");
        Ok(task)
    }

    /// Mark a compliance checklist item
    pub async fn mark_checklist_item(
        &self,
        id: Uuid,
        category: ComplianceCategory,
        status: ChecklistStatus,
        agent_id: &str,
        notes: Option<String>,
    ) -> Result<ChecklistItem> {
        let _held = self.exclusive(id).await?;

        let mut record = self.load(id).await?;
        let item = record
            .mark_checklist_item(category, status, agent_id, notes, Utc::now())?
            .clone();
        self.store.save(&record).await?;
        debug!(instance_id = %id, category = %category, status = %status, "Marked checklist item");
        Ok(item)
    }

    /// Operator override: fail the instance and cancel outstanding work
    pub async fn fail(&self, id: Uuid, reason: &str) -> Result<WorkflowInstance> {
        let _held = self.exclusive(id).await?;

        let mut record = self.load(id).await?;
        progression::fail(&mut record, reason, Utc::now())?;
        self.store.save(&record).await?;
        Ok(record.instance)
    }

    /// Tasks due at `now` across every live instance
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<DueTask>> {
        let mut due = Vec::new();
        for record in self.store.list().await? {
            for task in dispatch::due_tasks(&record, now) {
                due.push(DueTask {
                    instance_id: record.id(),
                    task: task.clone(),
                });
            }
        }
        due.sort_by_key(|d| d.task.scheduled_for);
        Ok(due)
    }
}

fn next_phase_of(outcome: &AdvanceOutcome) -> Option<Phase> {
    match outcome {
        AdvanceOutcome::Advanced {
            next_phase: Some(next),
            ..
        } => Some(next.clone()),
        _ => None,
    }
}

fn gates_passed(template: &WorkflowTemplate, record: &WorkflowRecord, phase: &Phase) -> bool {
    template
        .phase(phase)
        .map(|definition| {
            definition.quality_gates.iter().all(|gate_id| {
                record
                    .gates
                    .get(gate_id)
                    .map(|gate| evaluate(gate).passed())
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn ensure_open(record: &WorkflowRecord) -> Result<()> {
    if record.instance.is_terminal() {
        return Err(Error::Gate(format!(
            "workflow {} is {}",
            record.id(),
            record.instance.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::schedule::RetryConfig;
    use crate::workflow::gate::ApprovalEvent;
    use crate::workflow::redundancy::VoteDecision;
    use crate::workflow::state::WorkflowStatus;
    use crate::workflow::store::MemoryStore;
    use crate::workflow::template::default_template;

    async fn orchestrator(config: Config) -> Orchestrator {
        let orchestrator = Orchestrator::new(Arc::new(MemoryStore::new()), config);
        orchestrator.initialize().await.unwrap();
        orchestrator
            .register_template(default_template().unwrap())
            .await
            .unwrap();
        orchestrator
    }

    fn manual_config() -> Config {
        let mut config = Config::default();
        config.orchestrator.auto_advance = false;
        config
    }

    async fn create(orchestrator: &Orchestrator) -> Uuid {
        orchestrator
            .create_instance("standard-delivery", "proj-1", "task-1")
            .await
            .unwrap()
            .id
    }

    fn measure(id: Uuid, gate: &str, criterion: &str, value: f64) -> QualityMeasurementEvent {
        QualityMeasurementEvent {
            instance_id: id,
            gate_id: gate.to_string(),
            criterion_id: criterion.to_string(),
            measurement: Measurement::Value {
                measured_value: value,
                agent_id: Some("ci".to_string()),
            },
        }
    }

    fn approve(id: Uuid, gate: &str, criterion: &str, approved: bool) -> QualityMeasurementEvent {
        QualityMeasurementEvent {
            instance_id: id,
            gate_id: gate.to_string(),
            criterion_id: criterion.to_string(),
            measurement: Measurement::Approval(ApprovalEvent {
                agent_id: "reviewer-1".to_string(),
                approved,
                note: None,
            }),
        }
    }

    fn vote(id: Uuid, phase: Phase, agent: &str, agent_type: &str, decision: VoteDecision) -> VoteEvent {
        VoteEvent {
            instance_id: id,
            phase,
            agent_id: agent.to_string(),
            agent_type: agent_type.to_string(),
            decision,
            cast_at: None,
        }
    }

    async fn pass_requirements(orchestrator: &Orchestrator, id: Uuid) {
        orchestrator
            .record_measurement(approve(id, "requirements-signoff", "stakeholder_signoff", true))
            .await
            .unwrap();
        orchestrator
            .record_measurement(approve(id, "requirements-signoff", "requirements_review", true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_start() {
        let orchestrator = orchestrator(manual_config()).await;
        let id = create(&orchestrator).await;

        let status = orchestrator.instance_status(id).await.unwrap();
        assert_eq!(status.status, WorkflowStatus::NotStarted);

        let tasks = orchestrator.start(id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].phase, Phase::Requirements);
        assert_eq!(
            orchestrator.instance_status(id).await.unwrap().status,
            WorkflowStatus::InProgress
        );

        // Starting again dispatches nothing new
        assert!(orchestrator.start(id).await.unwrap().is_empty());
        assert_eq!(orchestrator.due_tasks(Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_instance_and_template() {
        let orchestrator = orchestrator(manual_config()).await;
        let missing = Uuid::new_v4();
        assert!(matches!(
            orchestrator.instance_status(missing).await,
            Err(Error::InstanceNotFound(id)) if id == missing
        ));
        assert!(matches!(
            orchestrator.create_instance("nope", "p", "t").await,
            Err(Error::TemplateNotFound(_))
        ));
        assert!(matches!(
            orchestrator
                .submit_vote(vote(missing, Phase::Security, "a", "security_engineer", VoteDecision::Approve))
                .await,
            Err(Error::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_advance_on_gate_pass() {
        let orchestrator = orchestrator(Config::default()).await;
        let id = create(&orchestrator).await;
        orchestrator.start(id).await.unwrap();

        orchestrator
            .record_measurement(approve(id, "requirements-signoff", "stakeholder_signoff", true))
            .await
            .unwrap();
        let outcome = orchestrator
            .record_measurement(approve(id, "requirements-signoff", "requirements_review", true))
            .await
            .unwrap();

        assert!(outcome.verdict.passed());
        assert!(outcome.advance.unwrap().is_advanced());
        let instance = orchestrator.instance_status(id).await.unwrap();
        assert_eq!(instance.phases_completed, vec![Phase::Requirements]);
        assert_eq!(instance.current_phase, Some(Phase::Architecture));
    }

    #[tokio::test]
    async fn test_vote_completes_phase() {
        let orchestrator = orchestrator(Config::default()).await;
        let id = create(&orchestrator).await;
        pass_requirements(&orchestrator, id).await;
        orchestrator
            .record_measurement(approve(id, "architecture-review", "design_review", true))
            .await
            .unwrap();

        let first = orchestrator
            .submit_vote(vote(id, Phase::Architecture, "arch-1", "system_architect", VoteDecision::Approve))
            .await
            .unwrap();
        assert_eq!(first.vote.sequence, 1);
        assert!(!first.verdict.unwrap().approved);
        assert!(first.advance.is_none());

        let second = orchestrator
            .submit_vote(vote(id, Phase::Architecture, "lead-1", "tech_lead", VoteDecision::Approve))
            .await
            .unwrap();
        assert!(second.verdict.unwrap().approved);
        assert!(second.advance.unwrap().is_advanced());
    }

    #[tokio::test]
    async fn test_failed_measurement_schedules_recheck_then_fails_workflow() {
        let mut config = Config::default();
        config.retry = RetryConfig {
            max_attempts: 2,
            initial_delay_seconds: 60,
            max_delay_seconds: 600,
            backoff_multiplier: 2.0,
        };
        let orchestrator = orchestrator(config).await;
        let id = create(&orchestrator).await;
        orchestrator.start(id).await.unwrap();

        let first = orchestrator
            .record_measurement(measure(id, "code-quality", "lint_errors", 4.0))
            .await
            .unwrap();
        assert_eq!(first.verdict.status, GateStatus::Failed);
        let recheck = first.recheck.unwrap();
        assert!(matches!(recheck.kind, TaskKind::GateRecheck { .. }));
        assert!(!first.exhausted);
        let record = orchestrator.record(id).await.unwrap();
        assert_eq!(recheck.status_version, record.instance.status_version);
        let due = orchestrator
            .due_tasks(Utc::now() + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert!(due.iter().any(|d| d.task.id == recheck.id));

        // Development is not current, but an exhausted criterion still fails the workflow
        let second = orchestrator
            .record_measurement(measure(id, "code-quality", "lint_errors", 3.0))
            .await
            .unwrap();
        assert!(second.exhausted);
        assert!(second.recheck.is_none());
        assert!(matches!(second.advance, Some(AdvanceOutcome::Failed { .. })));

        let record = orchestrator.record(id).await.unwrap();
        assert_eq!(record.instance.status, WorkflowStatus::Failed);
        assert!(record.tasks.iter().all(|t| !t.is_outstanding()));
        assert!(orchestrator.due_tasks(Utc::now()).await.unwrap().is_empty());

        // Closed instances reject further measurements
        assert!(orchestrator
            .record_measurement(measure(id, "code-quality", "lint_errors", 0.0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_remediation_resets_gate() {
        let orchestrator = orchestrator(Config::default()).await;
        let id = create(&orchestrator).await;
        orchestrator.start(id).await.unwrap();

        orchestrator
            .record_measurement(approve(id, "requirements-signoff", "stakeholder_signoff", false))
            .await
            .unwrap();
        assert!(orchestrator
            .assign_remediation(id, "architecture-review", "n/a", "system_architect")
            .await
            .is_err());

        let task = orchestrator
            .assign_remediation(id, "requirements-signoff", "Rework scope", "business_analyst")
            .await
            .unwrap();
        assert_eq!(task.phase, Phase::Requirements);
        assert!(orchestrator
            .assign_remediation(id, "no-such-gate", "n/a", "business_analyst")
            .await
            .is_err());
        let readiness = orchestrator.deployment_readiness(id).await.unwrap();
        assert!(readiness
            .blockers
            .iter()
            .any(|b| b.blocking_task_id.as_deref() == Some(task.id.as_str())));

        orchestrator
            .handle_task_completion(TaskCompletionEvent {
                instance_id: id,
                task_id: task.id.clone(),
                phase: Phase::Requirements,
                outcome: TaskOutcome::Succeeded,
            })
            .await
            .unwrap();

        let record = orchestrator.record(id).await.unwrap();
        let gate = record.gate("requirements-signoff").unwrap();
        assert_eq!(gate.status, GateStatus::Pending);
        assert!(gate.remediation_task_id.is_none());

        pass_requirements(&orchestrator, id).await;
        let instance = orchestrator.instance_status(id).await.unwrap();
        assert_eq!(instance.phases_completed, vec![Phase::Requirements]);
    }

    #[tokio::test]
    async fn test_no_recheck_when_measurement_fails_workflow() {
        let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
        let lenient = Orchestrator::new(store.clone(), Config::default());
        lenient
            .register_template(default_template().unwrap())
            .await
            .unwrap();
        let id = create(&lenient).await;
        lenient.start(id).await.unwrap();
        lenient
            .record_measurement(approve(id, "code-quality", "code_review", false))
            .await
            .unwrap();
        assert!(!lenient.instance_status(id).await.unwrap().is_terminal());

        // A stricter process treats the recorded rejection as final
        let mut config = Config::default();
        config.orchestrator.fail_on_rejected_review = true;
        let strict = Orchestrator::new(store, config);
        strict
            .register_template(default_template().unwrap())
            .await
            .unwrap();
        let outcome = strict
            .record_measurement(measure(id, "code-quality", "lint_errors", 4.0))
            .await
            .unwrap();

        assert!(matches!(outcome.advance, Some(AdvanceOutcome::Failed { .. })));
        assert!(outcome.recheck.is_none());
        let record = strict.record(id).await.unwrap();
        assert!(record
            .tasks
            .iter()
            .all(|t| !matches!(t.kind, TaskKind::GateRecheck { .. })));
    }

    #[tokio::test]
    async fn test_instance_locks_are_released() {
        let orchestrator = Arc::new(orchestrator(manual_config()).await);
        let id = create(&orchestrator).await;
        orchestrator.start(id).await.unwrap();
        pass_requirements(&orchestrator, id).await;

        let calls = (0..8).map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.advance_phase(id, &Phase::Requirements).await })
        });
        for result in futures::future::join_all(calls).await {
            result.unwrap().unwrap();
        }
        assert!(orchestrator.fail(Uuid::new_v4(), "missing").await.is_err());

        assert_eq!(orchestrator.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_task_failure_retries_then_gives_up() {
        let orchestrator = orchestrator(manual_config()).await;
        let id = create(&orchestrator).await;
        let task = orchestrator.start(id).await.unwrap().remove(0);

        let failed = TaskCompletionEvent {
            instance_id: id,
            task_id: task.id.clone(),
            phase: Phase::Requirements,
            outcome: TaskOutcome::Failed {
                error: "stakeholders unavailable".to_string(),
            },
        };
        orchestrator.handle_task_completion(failed.clone()).await.unwrap();

        // Requirements work carries no retry policy
        let record = orchestrator.record(id).await.unwrap();
        assert_eq!(record.task(&task.id).unwrap().status, TaskStatus::Failed);

        // A duplicate report for a finished task is ignored
        assert!(orchestrator.handle_task_completion(failed).await.unwrap().is_none());

        let readiness = orchestrator.deployment_readiness(id).await.unwrap();
        assert!(readiness
            .blockers
            .iter()
            .any(|b| b.blocking_task_id.as_deref() == Some(task.id.as_str())));
    }

    #[tokio::test]
    async fn test_completion_for_wrong_phase_is_rejected() {
        let orchestrator = orchestrator(manual_config()).await;
        let id = create(&orchestrator).await;
        let task = orchestrator.start(id).await.unwrap().remove(0);

        let result = orchestrator
            .handle_task_completion(TaskCompletionEvent {
                instance_id: id,
                task_id: task.id,
                phase: Phase::Testing,
                outcome: TaskOutcome::Succeeded,
            })
            .await;
        assert!(matches!(result, Err(Error::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_concurrent_advance_completes_once() {
        let orchestrator = Arc::new(orchestrator(manual_config()).await);
        let id = create(&orchestrator).await;
        pass_requirements(&orchestrator, id).await;

        let calls = (0..16).map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.advance_phase(id, &Phase::Requirements).await })
        });
        let outcomes: Vec<AdvanceOutcome> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let advanced = outcomes.iter().filter(|o| o.is_advanced()).count();
        assert_eq!(advanced, 1);
        assert!(outcomes.iter().all(|o| o.is_advanced()
            || *o
                == AdvanceOutcome::AlreadyCompleted {
                    phase: Phase::Requirements
                }));

        let instance = orchestrator.instance_status(id).await.unwrap();
        assert_eq!(instance.phases_completed, vec![Phase::Requirements]);
    }

    #[tokio::test]
    async fn test_concurrent_votes_last_write_wins() {
        let orchestrator = Arc::new(orchestrator(manual_config()).await);
        let id = create(&orchestrator).await;

        let votes = (0..10).map(|i| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .submit_vote(vote(
                        id,
                        Phase::Security,
                        &format!("sec-{}", i % 2),
                        "security_engineer",
                        VoteDecision::Approve,
                    ))
                    .await
            })
        });
        for result in futures::future::join_all(votes).await {
            result.unwrap().unwrap();
        }

        let outcome = orchestrator
            .submit_vote(vote(id, Phase::Security, "sec-0", "security_engineer", VoteDecision::Reject))
            .await
            .unwrap();
        assert_eq!(outcome.vote.sequence, 11);
        let verdict = outcome.verdict.unwrap();
        assert_eq!(verdict.approvals, 1);
        assert_eq!(verdict.rejections, 1);
        assert!(!verdict.approved);
    }

    #[tokio::test]
    async fn test_checklist_and_operator_fail() {
        let orchestrator = orchestrator(manual_config()).await;
        let id = create(&orchestrator).await;

        let item = orchestrator
            .mark_checklist_item(
                id,
                ComplianceCategory::Documentation,
                ChecklistStatus::NotApplicable,
                "writer-1",
                None,
            )
            .await
            .unwrap();
        assert_eq!(item.status, ChecklistStatus::NotApplicable);

        let instance = orchestrator.fail(id, "project cancelled").await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(
            orchestrator.advance_phase(id, &Phase::Requirements).await.unwrap(),
            AdvanceOutcome::Closed {
                status: WorkflowStatus::Failed
            }
        );
        assert_eq!(orchestrator.list_instances().await.unwrap().len(), 1);
    }
}
