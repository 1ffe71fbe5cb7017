//! Proposals and their append-only status history.

use serde::{Deserialize, Serialize};

use crate::error::{CommitError, Rejection};
use crate::record::{CandidateRecord, Origin, RecordId, Tier};
use crate::store::snapshot::SnapshotRef;

/// What a proposal asks the pipeline to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Install a caller-submitted record.
    Create,
    /// Install a record synthesized by auto-promotion.
    Promote,
}

/// Proposal lifecycle.
///
/// `Proposed → Verified → Approved → Installed`, with `Rejected` and `Failed`
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Proposed,
    Verified,
    Approved,
    Installed,
    Rejected,
    Failed,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProposalStatus::Installed | ProposalStatus::Rejected | ProposalStatus::Failed
        )
    }

    fn can_advance_to(self, next: ProposalStatus) -> bool {
        use ProposalStatus::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Rejected | Failed) => true,
            (Proposed, Verified) | (Verified, Approved) | (Approved, Installed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Outcome of one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub step: String,
    pub passed: bool,
    pub detail: String,
}

/// Where and how a proposal was installed (or attempted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallMeta {
    pub snapshot: SnapshotRef,
    pub record_id: Option<RecordId>,
    pub tier: Option<Tier>,
    pub score: Option<f32>,
}

/// A candidate moving through the commit pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: u64,
    pub action: ActionKind,
    pub payload: CandidateRecord,
    pub origin: Origin,
    pub status: ProposalStatus,
    /// Every status the proposal has held, oldest first.
    pub history: Vec<ProposalStatus>,
    pub checks: Vec<CheckResult>,
    pub install: Option<InstallMeta>,
    pub annotations: Vec<String>,
    pub rejection: Option<Rejection>,
    pub error: Option<String>,
    pub created_at: u64,
}

impl Proposal {
    pub fn new(id: u64, action: ActionKind, payload: CandidateRecord, origin: Origin, now: u64) -> Self {
        Self {
            id,
            action,
            payload,
            origin,
            status: ProposalStatus::Proposed,
            history: vec![ProposalStatus::Proposed],
            checks: Vec::new(),
            install: None,
            annotations: Vec::new(),
            rejection: None,
            error: None,
            created_at: now,
        }
    }

    /// Move to `next`, refusing illegal or post-terminal transitions.
    pub fn advance(&mut self, next: ProposalStatus) -> Result<(), CommitError> {
        if !self.status.can_advance_to(next) {
            return Err(CommitError::IllegalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.history.push(next);
        Ok(())
    }

    pub fn check(&mut self, step: &str, passed: bool, detail: impl Into<String>) {
        self.checks.push(CheckResult {
            step: step.to_string(),
            passed,
            detail: detail.into(),
        });
    }
}

/// What `submit` reports back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalResult {
    Installed {
        proposal_id: u64,
        record_id: RecordId,
        tier: Tier,
    },
    Rejected {
        proposal_id: u64,
        reason: Rejection,
    },
    /// Install failed and the store was rolled back to `snapshot`.
    Failed {
        proposal_id: u64,
        error: CommitError,
        snapshot: SnapshotRef,
    },
}

impl ProposalResult {
    pub fn proposal_id(&self) -> u64 {
        match self {
            ProposalResult::Installed { proposal_id, .. }
            | ProposalResult::Rejected { proposal_id, .. }
            | ProposalResult::Failed { proposal_id, .. } => *proposal_id,
        }
    }

    /// Installed record id, if the proposal installed.
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            ProposalResult::Installed { record_id, .. } => Some(*record_id),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ProposalResult::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, ProposalResult::Installed { .. })
    }
}
