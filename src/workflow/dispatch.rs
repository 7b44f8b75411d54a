//! Dispatch of phase work as scheduled jobs
//!
//! Phase task templates become `DispatchedTask` records once the phase's
//! dependencies are complete. Timing comes from the trigger calculator and
//! failed work is re-timed by the retry policy. An external dispatcher polls
//! `due_tasks`; nothing here sleeps or runs work itself.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::phase::Phase;
use super::state::WorkflowRecord;
use super::template::{TaskTemplate, WorkflowTemplate};
use crate::schedule::{self, RetryConfig, RetryDecision};
use crate::Result;

/// What a dispatched task is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Work from the phase's task templates
    PhaseWork,
    /// Re-measure a failed automated criterion
    GateRecheck { gate_id: String, criterion_id: String },
    /// Fix whatever failed a gate
    Remediation { gate_id: String },
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `scheduled_for`
    Scheduled,
    Completed,
    /// Retry budget spent
    Failed,
    /// The instance failed while this was outstanding
    Cancelled,
    /// The schedule has no further runs
    Unscheduled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Scheduled => write!(f, "scheduled"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Unscheduled => write!(f, "unscheduled"),
        }
    }
}

/// A unit of work handed to the external task-execution subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedTask {
    pub id: String,
    pub phase: Phase,
    pub title: String,
    pub agent_type: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Failed attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// Instance status version this dispatch is valid for
    pub status_version: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl DispatchedTask {
    pub fn new(
        phase: Phase,
        title: impl Into<String>,
        agent_type: impl Into<String>,
        kind: TaskKind,
        status_version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            phase,
            title: title.into(),
            agent_type: agent_type.into(),
            kind,
            status: TaskStatus::Scheduled,
            scheduled_for: None,
            attempts: 0,
            status_version,
            retry: None,
            last_error: None,
        }
    }

    fn from_template(
        phase: &Phase,
        template: &TaskTemplate,
        default_tz: &str,
        status_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut task = Self::new(
            phase.clone(),
            template.title.clone(),
            template.agent_type.clone(),
            TaskKind::PhaseWork,
            status_version,
        );
        task.retry = template.retry.clone();

        let timezone = template.timezone.as_deref().unwrap_or(default_tz);
        task.scheduled_for = match &template.schedule {
            Some(spec) => schedule::next_run(spec, timezone, now)?,
            None => Some(now),
        };
        if task.scheduled_for.is_none() {
            task.status = TaskStatus::Unscheduled;
        }
        Ok(task)
    }

    /// Waiting to run
    pub fn is_outstanding(&self) -> bool {
        self.status == TaskStatus::Scheduled
    }
}

/// Dispatch the tasks of every phase whose dependencies are complete and
/// whose work has not been dispatched yet. Returns the new task ids.
pub fn dispatch_ready_phases(
    template: &WorkflowTemplate,
    record: &mut WorkflowRecord,
    default_tz: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    if record.instance.is_terminal() {
        return Ok(Vec::new());
    }

    let version = record.instance.status_version;
    let mut dispatched = Vec::new();

    for phase in &template.phases {
        if record.dispatched_phases.contains(&phase.name)
            || record.instance.is_phase_completed(&phase.name)
        {
            continue;
        }
        let ready = phase
            .dependencies
            .iter()
            .all(|dep| record.instance.is_phase_completed(dep));
        if !ready {
            continue;
        }

        for task_template in &phase.tasks {
            let task =
                DispatchedTask::from_template(&phase.name, task_template, default_tz, version, now)?;
            info!(
                instance_id = %record.instance.id,
                phase = %phase.name,
                task_id = %task.id,
                status = %task.status,
                scheduled_for = ?task.scheduled_for,
                "Dispatched phase task"
            );
            dispatched.push(task.id.clone());
            record.tasks.push(task);
        }
        record.dispatched_phases.insert(phase.name.clone());
    }

    Ok(dispatched)
}

/// Record a failed attempt and consult the task's retry policy.
///
/// Retry puts the task back on the schedule at `now + delay`; giving up marks
/// it failed. Tasks without a retry policy give up after one attempt.
pub fn schedule_retry(
    task: &mut DispatchedTask,
    error: impl Into<String>,
    now: DateTime<Utc>,
) -> RetryDecision {
    task.attempts += 1;
    task.last_error = Some(error.into());

    let decision = match &task.retry {
        Some(retry) => retry.decide(task.attempts),
        None => RetryDecision::GiveUp {
            attempts: task.attempts,
        },
    };

    match decision {
        RetryDecision::Retry { next_attempt, delay } => {
            let retry_at = Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            task.status = TaskStatus::Scheduled;
            task.scheduled_for = Some(retry_at);
            info!(
                task_id = %task.id,
                phase = %task.phase,
                next_attempt,
                retry_at = %retry_at,
                "Retrying task"
            );
        }
        RetryDecision::GiveUp { attempts } => {
            task.status = TaskStatus::Failed;
            warn!(task_id = %task.id, phase = %task.phase, attempts, "Task retries exhausted");
        }
    }
    decision
}

/// Cancel every outstanding task; returns how many were cancelled
pub fn cancel_outstanding(record: &mut WorkflowRecord) -> usize {
    let mut cancelled = 0;
    for task in record.tasks.iter_mut().filter(|t| t.is_outstanding()) {
        task.status = TaskStatus::Cancelled;
        cancelled += 1;
    }
    if cancelled > 0 {
        debug!(instance_id = %record.instance.id, cancelled, "Cancelled outstanding tasks");
    }
    cancelled
}

/// Scheduled tasks due at `now` whose dispatch is still valid
pub fn due_tasks(record: &WorkflowRecord, now: DateTime<Utc>) -> Vec<&DispatchedTask> {
    if record.instance.is_terminal() {
        return Vec::new();
    }
    let version = record.instance.status_version;
    record
        .tasks
        .iter()
        .filter(|t| t.is_outstanding() && t.status_version == version)
        .filter(|t| t.scheduled_for.map(|at| at <= now).unwrap_or(false))
        .collect()
}
