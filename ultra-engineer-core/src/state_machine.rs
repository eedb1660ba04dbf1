//! Deterministic, idempotent per-issue transitions driven entirely off the
//! `IssueState` restored from comments.
//!
//! One `IssueWorker` is constructed per `(repo, number)` and owns the sole
//! write path for that issue. Each call
//! to [`IssueWorker::step`] performs at most one phase's worth of work and
//! returns; the caller (the worker pool) loops until the phase is terminal
//! or the step reports it needs external input.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use crate::agent::Agent;
use crate::ci::{self, WaitOutcome};
use crate::codec;
use crate::model::{Comment, FailureReason, Issue, IssueState, Phase};
use crate::phases::{AnalyzeOutcome, ImplementOutcome, PhaseConfig, PhaseRuntime};
use crate::progress::ProgressReporter;
use crate::provider::{PResult, Provider};
use crate::retry::Cancel;
use crate::security;

/// Static configuration for one worker's run, sourced from the resolved
/// config file.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub base_branch: String,
    pub auto_merge: bool,
    pub trigger_label: String,
    pub wait_for_ci: bool,
    pub ci_poll_interval: Duration,
    pub ci_timeout: Duration,
    pub max_ci_fix_attempts: u32,
}

/// What a single `step` call accomplished, for the worker pool/scheduler to
/// log and act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The issue needs a human's next move (e.g. answers, approval); no
    /// further progress is possible until a new comment arrives.
    AwaitingInput,
    /// Made progress but the issue is not done; call `step` again.
    InProgress,
    /// The issue reached `completed` or `failed` this step.
    Terminal,
}

/// Drives one issue through its phase transition table.
pub struct IssueWorker<'a> {
    pub provider: &'a dyn Provider,
    pub phases: PhaseRuntime<'a>,
    pub progress: &'a ProgressReporter<'a>,
    pub cancel: &'a Cancel,
    pub config: WorkerConfig,
    pub sandbox: PathBuf,
}

impl<'a> IssueWorker<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        agent: &'a dyn Agent,
        phase_config: PhaseConfig,
        progress: &'a ProgressReporter<'a>,
        cancel: &'a Cancel,
        config: WorkerConfig,
        sandbox: PathBuf,
    ) -> Self {
        Self {
            provider,
            phases: PhaseRuntime::new(agent, phase_config),
            progress,
            cancel,
            config,
            sandbox,
        }
    }

    fn set_phase(&self, state: &mut IssueState, issue: &Issue, phase: Phase) -> PResult<()> {
        for p in Phase::ALL {
            if p != phase {
                let _ = self.provider.remove_label(self.cancel, &issue.repo, issue.number, &p.label());
            }
        }
        self.provider
            .add_label(self.cancel, &issue.repo, issue.number, &phase.label())?;
        state.current_phase = phase;
        state.last_updated = Utc::now();
        Ok(())
    }

    /// Pushes `state` into the progress reporter and syncs the
    /// reporter-owned `status_comment_id`/`status_history` back afterward,
    /// so a later comment-stream persist (shutdown snapshot, job outcome,
    /// resume) carries the real comment id instead of `None` — otherwise a
    /// restart would create a second progress comment rather than editing
    /// the original one.
    fn persist(&self, state: &mut IssueState, status: &str) -> PResult<()> {
        self.progress.set_state(state.clone());
        self.progress.update(self.cancel, status)?;
        self.sync_from_progress(state);
        Ok(())
    }

    fn sync_from_progress(&self, state: &mut IssueState) {
        let reported = self.progress.current_state();
        state.status_comment_id = reported.status_comment_id;
        state.status_history = reported.status_history;
    }

    /// Returns the latest comment that represents new, authorized user
    /// input: `created_at > last_comment_time`, not a bot comment, and
    /// authored by a collaborator.
    fn latest_user_input(&self, repo: &str, comments: &[Comment], since: chrono::DateTime<Utc>) -> Option<Comment> {
        comments
            .iter()
            .filter(|c| c.created_at > since)
            .filter(|c| !codec::is_bot_comment(&c.body))
            .filter(|c| security::is_authorized(self.provider, self.cancel, repo, &c.author))
            .max_by_key(|c| c.created_at)
            .cloned()
    }

    /// Runs exactly one unit of work for `issue`/`state` and returns what
    /// happened. Safe to call repeatedly, including after a restart — each
    /// phase handler re-derives what it needs from the issue/comments/state
    /// rather than assuming in-memory continuity.
    pub fn step(&self, issue: &Issue, state: &mut IssueState) -> PResult<StepOutcome> {
        match state.current_phase {
            Phase::New => self.step_new(issue, state),
            Phase::Questions => self.step_questions(issue, state),
            Phase::Planning => self.step_planning(issue, state),
            Phase::Approval => self.step_approval(issue, state),
            Phase::Implementing => self.step_implementing(issue, state),
            Phase::Review => self.step_review(issue, state),
            Phase::Completed | Phase::Failed => Ok(StepOutcome::Terminal),
        }
    }

    fn fail(&self, issue: &Issue, state: &mut IssueState, reason: FailureReason, error: impl Into<String>) -> PResult<StepOutcome> {
        state.failure_reason = Some(reason);
        state.error = error.into();
        self.set_phase(state, issue, Phase::Failed)?;
        let _ = self.provider.remove_label(self.cancel, &issue.repo, issue.number, &self.config.trigger_label);
        if reason == FailureReason::MergeConflict {
            let _ = self.provider.add_label(self.cancel, &issue.repo, issue.number, "needs-manual-resolution");
        }
        self.progress.set_state(state.clone());
        self.progress.finalize(self.cancel, &format!("failed: {}", state.error))?;
        self.sync_from_progress(state);
        Ok(StepOutcome::Terminal)
    }

    fn complete(&self, issue: &Issue, state: &mut IssueState) -> PResult<StepOutcome> {
        self.set_phase(state, issue, Phase::Completed)?;
        let _ = std::fs::remove_dir_all(&self.sandbox);
        self.progress.set_state(state.clone());
        self.progress.finalize(self.cancel, "completed")?;
        self.sync_from_progress(state);
        Ok(StepOutcome::Terminal)
    }

    // -- new ----------------------------------------------------------------

    fn step_new(&self, issue: &Issue, state: &mut IssueState) -> PResult<StepOutcome> {
        self.persist(state, "analyzing")?;
        let outcome = self
            .phases
            .analyze(self.cancel, &self.sandbox, &issue.title, &issue.body)
            .map_err(|e| crate::provider::ProviderError::new(e.message))?;
        match outcome {
            AnalyzeOutcome::NoQuestions => {
                self.set_phase(state, issue, Phase::Planning)?;
                self.persist(state, "no questions, planning")?;
            }
            AnalyzeOutcome::Questions(questions) => {
                state.qa_round += 1;
                let body = format!("{}\n\n### Questions\n\n{questions}", codec::BOT_MARKER);
                self.provider
                    .create_comment(self.cancel, &issue.repo, issue.number, &body)?;
                self.set_phase(state, issue, Phase::Questions)?;
                self.persist(state, "awaiting answers")?;
            }
        }
        Ok(StepOutcome::InProgress)
    }

    // -- questions ------------------------------------------------------------

    fn step_questions(&self, issue: &Issue, state: &mut IssueState) -> PResult<StepOutcome> {
        let comments = self.provider.get_comments(self.cancel, &issue.repo, issue.number)?;
        let Some(input) = self.latest_user_input(&issue.repo, &comments, state.last_comment_time) else {
            return Ok(StepOutcome::AwaitingInput);
        };
        state.last_comment_time = input.created_at;
        if is_abort(&input.body) {
            return self.fail(issue, state, FailureReason::Other, "aborted by user during Q&A");
        }
        self.set_phase(state, issue, Phase::Planning)?;
        self.persist(state, "answers received, planning")?;
        Ok(StepOutcome::InProgress)
    }

    // -- planning -------------------------------------------------------------

    fn step_planning(&self, issue: &Issue, state: &mut IssueState) -> PResult<StepOutcome> {
        let cycles = self.phases.config.review_cycles;
        for iteration in 1..=cycles {
            self.persist(state, &format!("reviewing plan ({iteration}/{cycles})"))?;
            self.phases
                .review_plan(self.cancel, &self.sandbox, &self.phases.read_plan(&self.sandbox), iteration)
                .map_err(|e| crate::provider::ProviderError::new(e.message))?;
        }
        let plan = self.phases.read_plan(&self.sandbox);
        let body = format!(
            "{}\n\n### Plan (v{})\n\n{plan}\n\nComment `/approve` to proceed, or leave feedback.",
            codec::BOT_MARKER, state.plan_version
        );
        self.provider
            .create_comment(self.cancel, &issue.repo, issue.number, &body)?;
        self.set_phase(state, issue, Phase::Approval)?;
        self.persist(state, "plan posted, awaiting approval")?;
        Ok(StepOutcome::InProgress)
    }

    // -- approval ---------------------------------------------------------------

    fn step_approval(&self, issue: &Issue, state: &mut IssueState) -> PResult<StepOutcome> {
        let comments = self.provider.get_comments(self.cancel, &issue.repo, issue.number)?;
        let Some(input) = self.latest_user_input(&issue.repo, &comments, state.last_comment_time) else {
            return Ok(StepOutcome::AwaitingInput);
        };
        state.last_comment_time = input.created_at;

        if is_abort(&input.body) {
            return self
                .fail(issue, state, FailureReason::Other, "aborted by user during approval")
                .map_err(Into::into);
        }
        if is_approve(&input.body) {
            self.set_phase(state, issue, Phase::Implementing)?;
            self.persist(state, "approved, implementing")?;
            return Ok(StepOutcome::InProgress);
        }

        // Feedback: re-integrate the plan.
        let feedback = codec::strip(&input.body);
        let outcome = self
            .phases
            .integrate_feedback(self.cancel, &self.sandbox, &feedback)
            .map_err(|e| crate::provider::ProviderError::new(e.message))?;
        if outcome.needs_re_review {
            state.plan_version += 1;
            self.set_phase(state, issue, Phase::Planning)?;
            self.persist(state, "significant feedback, re-reviewing plan")?;
        } else {
            let body = format!(
                "{}\n\n### Plan (v{})\n\n{}\n\nComment `/approve` to proceed, or leave feedback.",
                codec::BOT_MARKER, state.plan_version, outcome.updated_plan
            );
            self.provider
                .create_comment(self.cancel, &issue.repo, issue.number, &body)?;
            self.persist(state, "minor feedback integrated, awaiting approval")?;
        }
        Ok(StepOutcome::InProgress)
    }

    // -- implementing -------------------------------------------------------------

    fn step_implementing(&self, issue: &Issue, state: &mut IssueState) -> PResult<StepOutcome> {
        self.persist(state, "implementing")?;
        let outcome = self
            .phases
            .implement_with_git(self.cancel, &self.sandbox, &issue.title, issue.number, &self.config.base_branch)
            .map_err(|e| crate::provider::ProviderError::new(e.message))?;
        match outcome {
            ImplementOutcome::MergeConflict { files } => self.fail(
                issue,
                state,
                FailureReason::MergeConflict,
                format!("merge conflict in: {}", files.join(", ")),
            ),
            ImplementOutcome::Complete { branch } => {
                state.branch_name = branch;
                let cycles = self.phases.config.review_cycles;
                for iteration in 1..=cycles {
                    state.review_iteration = iteration;
                    self.persist(state, &format!("reviewing code ({iteration}/{cycles})"))?;
                    self.phases
                        .review_code(self.cancel, &self.sandbox, iteration)
                        .map_err(|e| crate::provider::ProviderError::new(e.message))?;
                }
                self.set_phase(state, issue, Phase::Review)?;
                self.persist(state, "review cycles complete, opening PR")?;
                Ok(StepOutcome::InProgress)
            }
        }
    }

    // -- review -------------------------------------------------------------------

    fn step_review(&self, issue: &Issue, state: &mut IssueState) -> PResult<StepOutcome> {
        if state.pr_number == 0 {
            let title = issue.title.clone();
            let body = format!("Closes #{}\n\n{}", issue.number, codec::BOT_MARKER);
            let pr = self.provider.create_pr(
                self.cancel,
                &issue.repo,
                &state.branch_name,
                &self.config.base_branch,
                &title,
                &body,
            )?;
            state.pr_number = pr.number;
            state.last_pr_comment_time = Utc::now();
            self.persist(state, &format!("opened PR #{}", pr.number))?;
            return Ok(StepOutcome::InProgress);
        }

        let mut feedback_comments = self.provider.get_pr_comments(self.cancel, &issue.repo, state.pr_number)?;
        feedback_comments.extend(self.provider.get_pr_review_comments(self.cancel, &issue.repo, state.pr_number)?);
        if let Some(input) = self.latest_user_input(&issue.repo, &feedback_comments, state.last_pr_comment_time) {
            state.last_pr_comment_time = input.created_at;
            self.persist(state, "addressing reviewer feedback")?;
            self.phases
                .address_feedback(self.cancel, &self.sandbox, &codec::strip(&input.body), &state.branch_name)
                .map_err(|e| crate::provider::ProviderError::new(e.message))?;
            self.persist(state, "waiting")?;
            return Ok(StepOutcome::InProgress);
        }

        if self.config.wait_for_ci {
            match ci::wait_for_ci(
                self.provider,
                self.cancel,
                &issue.repo,
                state.pr_number,
                self.config.ci_poll_interval,
                self.config.ci_timeout,
            )? {
                WaitOutcome::Success => {}
                WaitOutcome::TimedOut => {
                    self.persist(state, "waiting")?;
                    return Ok(StepOutcome::AwaitingInput);
                }
                WaitOutcome::Failure => {
                    if state.ci_fix_attempts >= self.config.max_ci_fix_attempts {
                        return self.fail(
                            issue,
                            state,
                            FailureReason::Other,
                            format!("CI still failing after {} fix attempts", state.ci_fix_attempts),
                        );
                    }
                    let status = self.provider.get_ci_status(self.cancel, &issue.repo, state.pr_number)?;
                    let failed = ci::failed_checks(&status);
                    let logs = ci::failure_logs(self.provider, self.cancel, &issue.repo, &failed);
                    let check_name = failed.first().map(|c| c.name.as_str()).unwrap_or("CI");
                    state.ci_fix_attempts += 1;
                    state.ci_wait_start_time = Some(Utc::now());
                    let fixing_status = format!("fixing CI failure ({})", state.ci_fix_attempts);
                    self.persist(state, &fixing_status)?;
                    self.phases
                        .fix_ci_failure(self.cancel, &self.sandbox, check_name, &logs, &state.branch_name)
                        .map_err(|e| crate::provider::ProviderError::new(e.message))?;
                    self.persist(state, "waiting")?;
                    return Ok(StepOutcome::InProgress);
                }
            }
        }

        let mergeable = self.provider.is_mergeable(self.cancel, &issue.repo, state.pr_number)?;
        if mergeable && self.config.auto_merge {
            self.provider.merge_pr(self.cancel, &issue.repo, state.pr_number)?;
            return self.complete(issue, state);
        }

        self.persist(state, "waiting")?;
        Ok(StepOutcome::AwaitingInput)
    }
}

/// `/approve` on a line by itself.
fn is_approve(body: &str) -> bool {
    codec::strip(body)
        .lines()
        .any(|line| line.trim() == "/approve")
}

/// `/abort` or `abort`, anywhere, trimmed, case-insensitive.
fn is_abort(body: &str) -> bool {
    let stripped = codec::strip(body).to_lowercase();
    stripped.split_whitespace().any(|w| w == "/abort" || w == "abort")
}

/// The result of `recompute_on_completion`: peers that became schedulable,
/// and peers that were force-failed because the issue they depended on
/// failed (spec §4.9: `if finished phase == failed -> mark peer failed with
/// failureReason = dependency_failed, post comment, relabel`). The caller
/// (the scheduler) is responsible for acting on both: submitting the ready
/// ones and posting a comment + relabeling the provider-side issue for the
/// failed ones.
pub struct CompletionEffects {
    pub newly_ready: Vec<u64>,
    pub newly_failed: Vec<u64>,
}

/// Given a finished issue, decides the fate of every peer that was blocked
/// on it. `peers` is typically built from the scheduler's per-repo state map.
pub fn recompute_on_completion(
    finished: u64,
    finished_phase: Phase,
    peers: &mut [(&u64, &mut IssueState)],
) -> CompletionEffects {
    let mut newly_ready = Vec::new();
    let mut newly_failed = Vec::new();
    for (number, state) in peers.iter_mut() {
        if !state.blocked_by.contains(&finished) {
            continue;
        }
        if finished_phase == Phase::Failed {
            state.current_phase = Phase::Failed;
            state.failure_reason = Some(FailureReason::DependencyFailed);
            state.error = format!("dependency #{finished} failed");
            newly_failed.push(**number);
        } else {
            state.blocked_by.retain(|n| *n != finished);
            if state.blocked_by.is_empty() {
                newly_ready.push(**number);
            }
        }
    }
    CompletionEffects { newly_ready, newly_failed }
}

/// Applies a dependency-cycle detection result to state: marks every
/// member of every cycle failed (see the grounding ledger's "cycle
/// recovery" decision).
pub fn fail_cycle_members(cycles: &[crate::deps::Cycle], states: &mut std::collections::HashMap<u64, IssueState>) {
    let members: HashSet<u64> = cycles.iter().flat_map(|c| c.0.iter().copied()).collect();
    for number in members {
        if let Some(state) = states.get_mut(&number) {
            state.current_phase = Phase::Failed;
            state.failure_reason = Some(FailureReason::DependencyCycle);
            state.error = "part of a dependency cycle".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approve_matches_only_standalone_line() {
        assert!(is_approve("/approve"));
        assert!(is_approve("looks good\n/approve\nthanks"));
        assert!(!is_approve("please /approve this later"));
    }

    #[test]
    fn abort_matches_with_or_without_slash() {
        assert!(is_abort("/abort"));
        assert!(is_abort("Abort"));
        assert!(is_abort("please abort this task"));
        assert!(!is_abort("don't abort, keep going"));
    }

    #[test]
    fn recompute_on_completion_unblocks_peer_when_dependency_succeeds() {
        let issue = sample_issue();
        let mut peer_state = IssueState::synthesize(&issue);
        peer_state.blocked_by = vec![2];
        let number = 1u64;
        let effects = recompute_on_completion(2, Phase::Completed, &mut [(&number, &mut peer_state)]);
        assert_eq!(effects.newly_ready, vec![1]);
        assert!(effects.newly_failed.is_empty());
        assert!(peer_state.blocked_by.is_empty());
    }

    #[test]
    fn recompute_on_completion_fails_peer_when_dependency_fails() {
        let issue = sample_issue();
        let mut peer_state = IssueState::synthesize(&issue);
        peer_state.blocked_by = vec![2];
        let number = 1u64;
        let effects = recompute_on_completion(2, Phase::Failed, &mut [(&number, &mut peer_state)]);
        assert!(effects.newly_ready.is_empty());
        assert_eq!(effects.newly_failed, vec![1]);
        assert_eq!(peer_state.current_phase, Phase::Failed);
        assert_eq!(peer_state.failure_reason, Some(FailureReason::DependencyFailed));
    }

    #[test]
    fn fail_cycle_members_marks_every_node_failed() {
        let issue = sample_issue();
        let mut states = std::collections::HashMap::new();
        states.insert(1u64, IssueState::synthesize(&issue));
        states.insert(2u64, IssueState::synthesize(&issue));
        let cycles = vec![crate::deps::Cycle(vec![1, 2])];
        fail_cycle_members(&cycles, &mut states);
        assert_eq!(states[&1].current_phase, Phase::Failed);
        assert_eq!(states[&2].current_phase, Phase::Failed);
        assert_eq!(states[&1].failure_reason, Some(FailureReason::DependencyCycle));
    }

    fn sample_issue() -> Issue {
        Issue {
            repo: "acme/widgets".to_string(),
            number: 1,
            title: "t".to_string(),
            body: "b".to_string(),
            labels: vec![],
            author: "a".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
