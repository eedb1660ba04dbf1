//! Durable data model: `Issue`, `Comment`, `Phase`, `IssueState`.
//!
//! `IssueState` is the only record that survives a restart, and it survives
//! entirely inside a comment body (see `codec`), never on local disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External identity of an issue: `(repo, number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IssueKey {
    pub repo: String,
    pub number: u64,
}

impl IssueKey {
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }
}

impl std::fmt::Display for IssueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// An issue as seen from the provider.
#[derive(Debug, Clone)]
pub struct Issue {
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn key(&self) -> IssueKey {
        IssueKey::new(self.repo.clone(), self.number)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// A comment on an issue or PR.
///
/// `id` is opaque and must never be used as an ordering key. Only
/// `created_at` may be used to decide "newer than".
#[derive(Debug, Clone)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// One of the eight named stages of an issue's lifecycle.
///
/// Mirrored on the issue as a `phase:<value>` label once the issue has left
/// `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    New,
    Questions,
    Planning,
    Approval,
    Implementing,
    Review,
    Completed,
    Failed,
}

impl Phase {
    /// The full ordered list, used to derive the `phase:*` label.
    pub const ALL: [Phase; 8] = [
        Phase::New,
        Phase::Questions,
        Phase::Planning,
        Phase::Approval,
        Phase::Implementing,
        Phase::Review,
        Phase::Completed,
        Phase::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::New => "new",
            Phase::Questions => "questions",
            Phase::Planning => "planning",
            Phase::Approval => "approval",
            Phase::Implementing => "implementing",
            Phase::Review => "review",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.as_str() == s)
    }

    /// The `phase:<value>` label text for this phase.
    pub fn label(self) -> String {
        format!("phase:{}", self.as_str())
    }

    /// Whether this phase represents a terminal (final) state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an issue transitioned to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MergeConflict,
    DependencyFailed,
    DependencyCycle,
    Other,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::MergeConflict => "merge_conflict",
            FailureReason::DependencyFailed => "dependency_failed",
            FailureReason::DependencyCycle => "dependency_cycle",
            FailureReason::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable, per-issue record.
///
/// Round-trips through `codec::parse`/`codec::append_to_body`. Every field
/// here is either owned by the single worker processing this issue, or
/// read-only from the scheduler's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueState {
    pub current_phase: Phase,
    pub last_updated: DateTime<Utc>,

    pub qa_round: u32,
    pub plan_version: u32,
    pub review_iteration: u32,

    pub pr_number: u64,
    pub branch_name: String,

    pub last_comment_time: DateTime<Utc>,
    pub last_pr_comment_time: DateTime<Utc>,

    pub status_comment_id: Option<String>,
    pub status_history: Vec<String>,

    pub depends_on: Vec<u64>,
    pub blocked_by: Vec<u64>,

    pub failure_reason: Option<FailureReason>,
    pub error: String,

    pub ci_wait_start_time: Option<DateTime<Utc>>,
    pub ci_fix_attempts: u32,
    pub last_ci_status: Option<String>,
}

impl IssueState {
    /// Synthesize a fresh state for an issue observed for the first time,
    /// deriving the phase from the issue's `phase:*` label if present.
    pub fn synthesize(issue: &Issue) -> Self {
        let current_phase = issue
            .labels
            .iter()
            .find_map(|l| l.strip_prefix("phase:"))
            .and_then(Phase::parse)
            .unwrap_or(Phase::New);
        let now = issue.updated_at;
        Self {
            current_phase,
            last_updated: now,
            qa_round: 0,
            plan_version: 0,
            review_iteration: 0,
            pr_number: 0,
            branch_name: String::new(),
            last_comment_time: issue.created_at,
            last_pr_comment_time: issue.created_at,
            status_comment_id: None,
            status_history: Vec::new(),
            depends_on: Vec::new(),
            blocked_by: Vec::new(),
            failure_reason: None,
            error: String::new(),
            ci_wait_start_time: None,
            ci_fix_attempts: 0,
            last_ci_status: None,
        }
    }

    /// Schedulable iff `blocked_by` is empty.
    pub fn is_schedulable(&self) -> bool {
        self.blocked_by.is_empty()
    }

    /// Recompute `blocked_by` from `depends_on` minus the given completed set.
    pub fn recompute_blocked_by(&mut self, completed: &std::collections::HashSet<u64>) {
        self.blocked_by = self
            .depends_on
            .iter()
            .copied()
            .filter(|n| !completed.contains(n))
            .collect();
    }
}
