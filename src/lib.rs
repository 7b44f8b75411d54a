//! Conductor: Quality-Gated Phase Orchestration
//!
//! Drives a software-delivery workflow (a parent task) through ordered phases
//! and only lets a phase close once its exit criteria hold:
//! - **Dependencies**: every phase a phase depends on is complete
//! - **Quality gates**: automated thresholds, manual sign-offs, agent reviews
//! - **Redundancy**: multiple distinct agent roles approve designated phases
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      External events (tasks, gates,     │
//! │      votes) → Orchestrator              │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │   Phase progression (per-instance lock) │
//! │   deps → gates → redundancy → advance   │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │   Dispatch (trigger calculator, retry)  │
//! │   Readiness (checklist + blockers)      │
//! └─────────────────────────────────────────┘
//! ```

pub mod config;
pub mod orchestrator;
pub mod schedule;
pub mod workflow;

// Re-exports for convenience
pub use config::Config;
pub use orchestrator::Orchestrator;
pub use schedule::{next_run, RetryConfig, ScheduleError, ScheduleSpec};
pub use workflow::{
    AdvanceOutcome, Blocker, DeploymentReadinessChecklist, Phase, WorkflowInstance,
    WorkflowStatus, WorkflowTemplate,
};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid workflow template: {0}")]
    Template(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("Quality gate error: {0}")]
    Gate(String),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Unknown quality gate: {0}")]
    UnknownGate(String),

    #[error("Unknown criterion {criterion} on gate {gate}")]
    UnknownCriterion { gate: String, criterion: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(uuid::Uuid),

    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
