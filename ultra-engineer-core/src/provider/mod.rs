//! The uniform capability surface every other component uses, regardless
//! of which git-hosting backend is behind it.
//!
//! `gh_cli` is the one concrete adapter shipped here: shell out to a CLI the
//! user already has authenticated, rather than link an HTTP client and carry
//! its own auth story. A Gitea-like backend would be a second adapter behind
//! the same `Provider` trait; none is implemented since no such CLI is assumed
//! present in this environment.

pub mod gh_cli;

use crate::retry::Cancel;
use std::fmt;

/// Aggregate CI status for a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiOverall {
    Success,
    Pending,
    Failure,
    Unknown,
}

/// A single CI check.
#[derive(Debug, Clone)]
pub struct CiCheck {
    pub id: String,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub details_url: Option<String>,
    pub output: Option<String>,
}

/// The full CI status for a PR.
#[derive(Debug, Clone)]
pub struct CiStatus {
    pub overall: CiOverall,
    pub checks: Vec<CiCheck>,
}

/// Mergeability of a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mergeable {
    Mergeable,
    Conflicting,
    Unknown,
}

/// A pull request as seen from the provider.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub branch: String,
    pub mergeable: Mergeable,
    pub is_draft: bool,
}

/// Classification used by the retry engine for provider failures.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
    pub transient_hint: bool,
    /// Set when `merge_pr` failed specifically because branch protection
    /// blocks the merge: a distinguished "merge not allowed" error.
    pub merge_not_allowed: bool,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            transient_hint: false,
            merge_not_allowed: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient_hint = true;
        self
    }

    pub fn merge_not_allowed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            transient_hint: false,
            merge_not_allowed: true,
        }
    }

    pub fn classify(&self) -> crate::retry::ErrorKind {
        if self.merge_not_allowed {
            return crate::retry::ErrorKind::Permanent;
        }
        crate::retry::classify_http(self.status, self.transient_hint)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
impl std::error::Error for ProviderError {}

impl From<crate::retry::Cancelled> for ProviderError {
    fn from(_: crate::retry::Cancelled) -> Self {
        ProviderError::new("operation cancelled")
    }
}

pub type PResult<T> = Result<T, ProviderError>;

/// The uniform capability surface. All methods take a `Cancel` handle
/// and may fail with a `ProviderError` classifiable by the retry engine.
pub trait Provider: Send + Sync {
    fn get_issue(&self, cancel: &Cancel, repo: &str, number: u64) -> PResult<crate::model::Issue>;
    fn list_issues_with_label(
        &self,
        cancel: &Cancel,
        repo: &str,
        label: &str,
    ) -> PResult<Vec<u64>>;
    fn get_comments(
        &self,
        cancel: &Cancel,
        repo: &str,
        number: u64,
    ) -> PResult<Vec<crate::model::Comment>>;
    fn create_comment(
        &self,
        cancel: &Cancel,
        repo: &str,
        number: u64,
        body: &str,
    ) -> PResult<String>;
    fn update_comment(
        &self,
        cancel: &Cancel,
        repo: &str,
        comment_id: &str,
        body: &str,
    ) -> PResult<()>;
    fn update_issue_body(
        &self,
        cancel: &Cancel,
        repo: &str,
        number: u64,
        body: &str,
    ) -> PResult<()>;
    fn react_to_comment(
        &self,
        cancel: &Cancel,
        repo: &str,
        comment_id: &str,
        reaction: &str,
    ) -> PResult<()>;

    /// Idempotent: adding a label that is already present must not error.
    fn add_label(&self, cancel: &Cancel, repo: &str, number: u64, label: &str) -> PResult<()>;
    /// Idempotent: removing a label that is already absent must not error.
    fn remove_label(&self, cancel: &Cancel, repo: &str, number: u64, label: &str) -> PResult<()>;

    fn create_pr(
        &self,
        cancel: &Cancel,
        repo: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> PResult<PullRequest>;
    fn get_pr(&self, cancel: &Cancel, repo: &str, number: u64) -> PResult<PullRequest>;
    fn get_pr_comments(
        &self,
        cancel: &Cancel,
        repo: &str,
        number: u64,
    ) -> PResult<Vec<crate::model::Comment>>;
    fn get_pr_review_comments(
        &self,
        cancel: &Cancel,
        repo: &str,
        number: u64,
    ) -> PResult<Vec<crate::model::Comment>>;
    fn is_mergeable(&self, cancel: &Cancel, repo: &str, number: u64) -> PResult<bool>;
    fn merge_pr(&self, cancel: &Cancel, repo: &str, number: u64) -> PResult<()>;

    fn clone_repo(&self, cancel: &Cancel, repo: &str, dest: &std::path::Path) -> PResult<()>;
    fn get_default_branch(&self, cancel: &Cancel, repo: &str) -> PResult<String>;

    fn is_collaborator(&self, cancel: &Cancel, repo: &str, user: &str) -> PResult<bool>;

    /// CI is an optional capability: a provider with no CI integration
    /// should return `CiOverall::Unknown` rather than erroring — unknown
    /// status is treated as success by callers.
    fn get_ci_status(&self, cancel: &Cancel, repo: &str, pr: u64) -> PResult<CiStatus>;
    fn get_ci_logs(&self, cancel: &Cancel, repo: &str, check_id: &str) -> PResult<String>;
}
