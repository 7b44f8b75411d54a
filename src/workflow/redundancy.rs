//! Multi-agent redundant approval
//!
//! Votes are an append-only log. The current vote of each agent is a
//! projection over that log: the latest record by `(cast_at, sequence)` wins,
//! and a `retract` record clears the agent's vote. Aggregation reduces the
//! projection to an approval verdict under the phase's rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use super::phase::Phase;
use crate::{Error, Result};

/// How eligible votes reduce to a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRule {
    /// Every required agent type approves, nobody rejects
    All,
    /// Approvals strictly outnumber rejections
    Majority,
    /// At least one approval
    Any,
}

impl fmt::Display for ApprovalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalRule::All => write!(f, "all"),
            ApprovalRule::Majority => write!(f, "majority"),
            ApprovalRule::Any => write!(f, "any"),
        }
    }
}

/// Multi-agent approval needed before a phase can close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyRequirement {
    /// Capability tags whose votes count
    pub required_agent_types: BTreeSet<String>,
    pub min_approvals: u32,
    pub approval_rule: ApprovalRule,
}

impl RedundancyRequirement {
    pub fn validate(&self, phase: &Phase) -> Result<()> {
        if self.required_agent_types.is_empty() {
            return Err(Error::Template(format!(
                "redundancy requirement for {} lists no agent types",
                phase
            )));
        }
        if self.min_approvals == 0 {
            return Err(Error::Template(format!(
                "redundancy requirement for {} needs min_approvals >= 1",
                phase
            )));
        }
        if self.approval_rule == ApprovalRule::All
            && self.min_approvals as usize > self.required_agent_types.len()
        {
            return Err(Error::Template(format!(
                "redundancy requirement for {} asks for {} approvals from {} agent types under rule 'all'",
                phase,
                self.min_approvals,
                self.required_agent_types.len()
            )));
        }
        Ok(())
    }

    pub fn accepts(&self, agent_type: &str) -> bool {
        self.required_agent_types.contains(agent_type)
    }
}

/// A single agent's decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
    /// Withdraw the agent's current vote
    Retract,
}

impl fmt::Display for VoteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteDecision::Approve => write!(f, "approve"),
            VoteDecision::Reject => write!(f, "reject"),
            VoteDecision::Retract => write!(f, "retract"),
        }
    }
}

/// One entry in the vote log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// Assigned by the store on append; breaks ties between equal `cast_at`
    pub sequence: u64,
    pub phase: Phase,
    pub agent_id: String,
    pub agent_type: String,
    pub decision: VoteDecision,
    pub cast_at: DateTime<Utc>,
}

/// A current vote that does not count toward the verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredVote {
    pub agent_id: String,
    pub agent_type: String,
    pub decision: VoteDecision,
    pub reason: String,
}

/// Result of aggregating a phase's votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalVerdict {
    pub approved: bool,
    pub rule: ApprovalRule,
    pub min_approvals: u32,
    /// Eligible approve votes
    pub approvals: u32,
    /// Eligible reject votes
    pub rejections: u32,
    pub approving_types: BTreeSet<String>,
    /// Required types without an approval
    pub missing_types: BTreeSet<String>,
    /// Agents with an eligible reject outstanding
    pub rejected_by: Vec<String>,
    /// Votes from agent types outside the requirement
    pub ignored: Vec<IgnoredVote>,
    /// Why the verdict is not approved
    pub reason: Option<String>,
}

/// Records belonging to one phase, in log order
pub fn votes_for_phase(log: &[VoteRecord], phase: &Phase) -> Vec<VoteRecord> {
    log.iter().filter(|v| &v.phase == phase).cloned().collect()
}

/// Current vote per agent: latest `(cast_at, sequence)` wins; a retraction
/// leaves the agent without a vote.
pub fn current_votes(votes: &[VoteRecord]) -> BTreeMap<String, &VoteRecord> {
    let mut latest: BTreeMap<String, &VoteRecord> = BTreeMap::new();
    for vote in votes {
        match latest.get(&vote.agent_id) {
            Some(existing) if (existing.cast_at, existing.sequence) > (vote.cast_at, vote.sequence) => {}
            _ => {
                latest.insert(vote.agent_id.clone(), vote);
            }
        }
    }
    latest.retain(|_, vote| vote.decision != VoteDecision::Retract);
    latest
}

/// Reduce a phase's votes to an approval verdict.
pub fn aggregate(requirement: &RedundancyRequirement, votes: &[VoteRecord]) -> ApprovalVerdict {
    let mut approvals = 0u32;
    let mut rejections = 0u32;
    let mut approving_types = BTreeSet::new();
    let mut rejected_by = Vec::new();
    let mut ignored = Vec::new();

    for (agent_id, vote) in current_votes(votes) {
        if !requirement.accepts(&vote.agent_type) {
            debug!(
                agent = %agent_id,
                agent_type = %vote.agent_type,
                "Ignoring vote from agent type outside the requirement"
            );
            ignored.push(IgnoredVote {
                agent_id,
                agent_type: vote.agent_type.clone(),
                decision: vote.decision,
                reason: format!("agent type '{}' is not required", vote.agent_type),
            });
            continue;
        }

        match vote.decision {
            VoteDecision::Approve => {
                approvals += 1;
                approving_types.insert(vote.agent_type.clone());
            }
            VoteDecision::Reject => {
                rejections += 1;
                rejected_by.push(agent_id);
            }
            VoteDecision::Retract => {}
        }
    }

    let missing_types: BTreeSet<String> = requirement
        .required_agent_types
        .difference(&approving_types)
        .cloned()
        .collect();
    let min = requirement.min_approvals;

    let reason = match requirement.approval_rule {
        ApprovalRule::All => {
            if rejections > 0 {
                Some(format!("rejected by {}", rejected_by.join(", ")))
            } else if !missing_types.is_empty() {
                Some(format!(
                    "awaiting approval from {}",
                    missing_types.iter().cloned().collect::<Vec<_>>().join(", ")
                ))
            } else if (approving_types.len() as u32) < min {
                Some(format!(
                    "{} approving agent types, {} required",
                    approving_types.len(),
                    min
                ))
            } else {
                None
            }
        }
        ApprovalRule::Majority => {
            if approvals + rejections < min {
                Some(format!(
                    "{} eligible votes, {} required",
                    approvals + rejections,
                    min
                ))
            } else if approvals <= rejections {
                Some(format!(
                    "{} approvals do not outnumber {} rejections",
                    approvals, rejections
                ))
            } else {
                None
            }
        }
        ApprovalRule::Any => {
            if approvals == 0 || approvals < min {
                Some(format!("{} approvals, {} required", approvals, min.max(1)))
            } else {
                None
            }
        }
    };

    ApprovalVerdict {
        approved: reason.is_none(),
        rule: requirement.approval_rule,
        min_approvals: min,
        approvals,
        rejections,
        approving_types,
        missing_types,
        rejected_by,
        ignored,
        reason,
    }
}
