//! Quality-gated workflow orchestration
//!
//! Drives a parent task through the phases of a template:
//!
//! - **Template**: ordered phases, their dependencies, gates and task templates
//! - **Gates**: criteria checked by measurement, sign-off or agent review
//! - **Redundancy**: multi-agent approval over an append-only vote log
//! - **Progression**: the state machine that completes phases
//! - **Dispatch**: phase work as scheduled, retryable jobs
//! - **Readiness**: the deployment checklist and its blockers
//! - **Store**: injectable persistence for records and votes
//!
//! ## Example Template
//!
//! ```toml
//! name = "release"
//!
//! [[phases]]
//! name = "security"
//! quality_gates = ["security-scan"]
//!
//! [[phases.tasks]]
//! title = "Nightly dependency scan"
//! agent_type = "security_engineer"
//! schedule = { type = "cron", expression = "0 2 * * *" }
//!
//! [gates.security-scan]
//! name = "Security scan"
//!
//! [[gates.security-scan.criteria]]
//! id = "critical_vulnerabilities"
//! name = "No critical vulnerabilities"
//! check_type = "automated"
//! threshold = 0.0
//! comparator = "lte"
//!
//! [redundancy_requirements.security]
//! required_agent_types = ["security_engineer", "system_architect"]
//! min_approvals = 2
//! approval_rule = "all"
//! ```

pub mod blocker;
pub mod dispatch;
pub mod events;
pub mod gate;
pub mod phase;
pub mod progression;
pub mod readiness;
pub mod redundancy;
pub mod state;
pub mod store;
pub mod template;

pub use blocker::{Blocker, BlockerKind, Severity};
pub use dispatch::{DispatchedTask, TaskKind, TaskStatus};
pub use events::{Measurement, QualityMeasurementEvent, TaskCompletionEvent, TaskOutcome, VoteEvent};
pub use gate::{
    evaluate, ApprovalEvent, CheckType, Comparator, CriterionDefinition, GateStatus, GateVerdict,
    QualityGate, QualityGateCriteria,
};
pub use phase::Phase;
pub use progression::{advance, AdvanceOutcome, FailurePolicy};
pub use readiness::{
    assess, ChecklistItem, ChecklistStatus, ComplianceCategory, DeploymentReadinessChecklist,
};
pub use redundancy::{
    aggregate, ApprovalRule, ApprovalVerdict, RedundancyRequirement, VoteDecision, VoteRecord,
};
pub use state::{WorkflowInstance, WorkflowRecord, WorkflowStatus};
pub use store::{FileStore, MemoryStore, StoreLock, WorkflowStore};
pub use template::{default_template, GateDefinition, PhaseDefinition, TaskTemplate, WorkflowTemplate};
