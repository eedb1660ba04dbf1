//! One handler per named stage of an issue's lifecycle. Each handler
//! builds a prompt, invokes the agent, and
//! interprets its output — tolerating missing markers and partial output,
//! since the agent's completions are never guaranteed ideal.

mod prompts;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::{Agent, AgentError, AgentRequest};
use crate::retry::Cancel;

pub use prompts::build_prompt;

/// The default allow-list for agent invocations that touch the sandbox's
/// git checkout.
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep"];

/// Directory, relative to the sandbox root, where the agent writes its
/// questions and plan files during `analyze`.
const DOTFILE_DIR: &str = ".ultra-engineer";
const QUESTIONS_FILE: &str = "questions.md";
const PLAN_FILE: &str = "plan.md";

const NO_QUESTIONS_MARKER: &str = "NO_QUESTIONS_NEEDED";
const SIGNIFICANT_CHANGES_MARKER: &str = "SIGNIFICANT_CHANGES";
const MINOR_CHANGES_MARKER: &str = "MINOR_CHANGES";
const IMPLEMENTATION_COMPLETE_MARKER: &str = "IMPLEMENTATION_COMPLETE";
const MERGE_CONFLICT_MARKER: &str = "MERGE_CONFLICT_UNRESOLVED:";

/// Result of the `analyze` phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzeOutcome {
    NoQuestions,
    Questions(String),
}

/// Result of `integrateFeedback`.
#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub updated_plan: String,
    pub needs_re_review: bool,
}

/// Result of `implementWithGit`.
#[derive(Debug, Clone)]
pub enum ImplementOutcome {
    Complete { branch: String },
    MergeConflict { files: Vec<String> },
}

/// Configuration shared by every phase handler.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub agent_timeout: Duration,
    pub review_cycles: u32,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(30 * 60),
            review_cycles: 5,
        }
    }
}

/// Drives the agent through each named phase of the workflow. Holds no
/// per-issue state of its own — every method takes the sandbox path and
/// whatever context it needs, and is safe to re-enter after a restart.
pub struct PhaseRuntime<'a> {
    pub agent: &'a dyn Agent,
    pub config: PhaseConfig,
}

impl<'a> PhaseRuntime<'a> {
    pub fn new(agent: &'a dyn Agent, config: PhaseConfig) -> Self {
        Self { agent, config }
    }

    fn invoke(
        &self,
        cancel: &Cancel,
        sandbox: &Path,
        prompt: String,
    ) -> Result<String, AgentError> {
        let req = AgentRequest {
            prompt,
            cwd: sandbox.to_path_buf(),
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|s| s.to_string()).collect(),
            deadline: self.config.agent_timeout,
        };
        self.agent.invoke(cancel, &req).map(|r| r.text)
    }

    /// `analyze`: runs the agent over the issue, then reads back whatever
    /// it wrote to the dotfile directory.
    pub fn analyze(
        &self,
        cancel: &Cancel,
        sandbox: &Path,
        title: &str,
        body: &str,
    ) -> Result<AnalyzeOutcome, AgentError> {
        let prompt = prompts::analyze_prompt(title, body, DOTFILE_DIR, QUESTIONS_FILE, PLAN_FILE);
        self.invoke(cancel, sandbox, prompt)?;

        let questions_path = sandbox.join(DOTFILE_DIR).join(QUESTIONS_FILE);
        let questions = read_trimmed(&questions_path);

        if questions.is_empty() || questions.contains(NO_QUESTIONS_MARKER) {
            Ok(AnalyzeOutcome::NoQuestions)
        } else {
            Ok(AnalyzeOutcome::Questions(questions))
        }
    }

    /// Returns the plan the agent wrote during `analyze`, or the empty
    /// string if it never wrote one (tolerated — see module docs).
    pub fn read_plan(&self, sandbox: &Path) -> String {
        read_trimmed(&sandbox.join(DOTFILE_DIR).join(PLAN_FILE))
    }

    /// `reviewPlan`: asks the agent to review the current plan, carrying
    /// the iteration count so it knows how many review passes remain.
    pub fn review_plan(
        &self,
        cancel: &Cancel,
        sandbox: &Path,
        plan: &str,
        iteration: u32,
    ) -> Result<String, AgentError> {
        let prompt = prompts::review_plan_prompt(plan, iteration, self.config.review_cycles);
        self.invoke(cancel, sandbox, prompt)
    }

    /// `integrateFeedback`: classifies the agent's response to approval
    /// feedback as a significant or minor revision.
    pub fn integrate_feedback(
        &self,
        cancel: &Cancel,
        sandbox: &Path,
        feedback: &str,
    ) -> Result<FeedbackOutcome, AgentError> {
        let prompt = prompts::integrate_feedback_prompt(feedback);
        let output = self.invoke(cancel, sandbox, prompt)?;
        let needs_re_review = output.contains(SIGNIFICANT_CHANGES_MARKER)
            || !output.contains(MINOR_CHANGES_MARKER);
        Ok(FeedbackOutcome {
            updated_plan: self.read_plan(sandbox),
            needs_re_review,
        })
    }

    /// `implementWithGit`: runs the agent with implementation directives,
    /// then scans its output for the branch-name or conflict markers.
    pub fn implement_with_git(
        &self,
        cancel: &Cancel,
        sandbox: &Path,
        title: &str,
        number: u64,
        base_branch: &str,
    ) -> Result<ImplementOutcome, AgentError> {
        let prompt = prompts::implement_prompt(title, number, base_branch);
        let output = self.invoke(cancel, sandbox, prompt)?;

        if let Some(files) = extract_conflict_files(&output) {
            return Ok(ImplementOutcome::MergeConflict { files });
        }
        if let Some(branch) = extract_branch_name(&output) {
            return Ok(ImplementOutcome::Complete { branch });
        }
        if looks_like_git_error(&output) {
            return Err(AgentError::new(format!(
                "implementation run produced a git error with no completion marker: {}",
                output.lines().last().unwrap_or("")
            )));
        }
        Err(AgentError::new(
            "implementation run produced no completion marker",
        ))
    }

    /// `reviewCode`: runs a code-review pass; any agent error propagates
    /// unmodified, since code review has no partial-success interpretation.
    pub fn review_code(
        &self,
        cancel: &Cancel,
        sandbox: &Path,
        iteration: u32,
    ) -> Result<String, AgentError> {
        let prompt = prompts::review_code_prompt(iteration, self.config.review_cycles);
        self.invoke(cancel, sandbox, prompt)
    }

    /// `fixCIFailure`: asks the agent to fix a specific failing check.
    /// Errors here are not fatal to the outer state machine — the caller
    /// bounds attempts by `maxCIFixAttempts`.
    pub fn fix_ci_failure(
        &self,
        cancel: &Cancel,
        sandbox: &Path,
        check_name: &str,
        logs: &str,
        branch: &str,
    ) -> Result<String, AgentError> {
        let prompt = prompts::fix_ci_prompt(check_name, logs, branch);
        self.invoke(cancel, sandbox, prompt)
    }

    /// `addressFeedback`: runs the agent against reviewer feedback and
    /// instructs it to commit and push.
    pub fn address_feedback(
        &self,
        cancel: &Cancel,
        sandbox: &Path,
        feedback: &str,
        branch: &str,
    ) -> Result<String, AgentError> {
        let prompt = prompts::address_feedback_prompt(feedback, branch);
        self.invoke(cancel, sandbox, prompt)
    }
}

fn read_trimmed(path: &PathBuf) -> String {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn extract_branch_name(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix(IMPLEMENTATION_COMPLETE_MARKER) {
            let branch = rest.trim();
            if !branch.is_empty() {
                return Some(branch.to_string());
            }
        }
    }
    None
}

fn extract_conflict_files(output: &str) -> Option<Vec<String>> {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix(MERGE_CONFLICT_MARKER) {
            let files: Vec<String> = rest
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            if !files.is_empty() {
                return Some(files);
            }
        }
    }
    None
}

fn looks_like_git_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    ["fatal: ", "error: failed to push", "non-fast-forward", "could not rebase"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    struct ScriptedAgent {
        responses: RefCell<Vec<Result<String, AgentError>>>,
        writes: Option<(PathBuf, String, PathBuf, String)>,
    }

    impl Agent for ScriptedAgent {
        fn invoke(
            &self,
            _cancel: &Cancel,
            req: &AgentRequest,
        ) -> Result<crate::agent::AgentResult, AgentError> {
            if let Some((qpath, qbody, ppath, pbody)) = &self.writes {
                let full_q = req.cwd.join(qpath);
                let full_p = req.cwd.join(ppath);
                std::fs::create_dir_all(full_q.parent().unwrap()).unwrap();
                std::fs::write(&full_q, qbody).unwrap();
                std::fs::create_dir_all(full_p.parent().unwrap()).unwrap();
                std::fs::write(&full_p, pbody).unwrap();
            }
            let mut responses = self.responses.borrow_mut();
            let text = responses.remove(0)?;
            Ok(crate::agent::AgentResult {
                text,
                session_id: "s1".to_string(),
            })
        }
    }

    #[test]
    fn analyze_returns_no_questions_when_marker_present() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent {
            responses: RefCell::new(vec![Ok("ok".to_string())]),
            writes: Some((
                PathBuf::from(DOTFILE_DIR).join(QUESTIONS_FILE),
                NO_QUESTIONS_MARKER.to_string(),
                PathBuf::from(DOTFILE_DIR).join(PLAN_FILE),
                "do the thing".to_string(),
            )),
        };
        let runtime = PhaseRuntime::new(&agent, PhaseConfig::default());
        let outcome = runtime
            .analyze(&Cancel::new(), dir.path(), "Fix bug", "body")
            .unwrap();
        assert_eq!(outcome, AnalyzeOutcome::NoQuestions);
        assert_eq!(runtime.read_plan(dir.path()), "do the thing");
    }

    #[test]
    fn analyze_returns_questions_when_present() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent {
            responses: RefCell::new(vec![Ok("ok".to_string())]),
            writes: Some((
                PathBuf::from(DOTFILE_DIR).join(QUESTIONS_FILE),
                "What auth scheme should I use?".to_string(),
                PathBuf::from(DOTFILE_DIR).join(PLAN_FILE),
                String::new(),
            )),
        };
        let runtime = PhaseRuntime::new(&agent, PhaseConfig::default());
        let outcome = runtime
            .analyze(&Cancel::new(), dir.path(), "Add login", "body")
            .unwrap();
        assert_eq!(
            outcome,
            AnalyzeOutcome::Questions("What auth scheme should I use?".to_string())
        );
    }

    #[test]
    fn analyze_treats_missing_questions_file_as_no_questions() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent {
            responses: RefCell::new(vec![Ok("ok".to_string())]),
            writes: None,
        };
        let runtime = PhaseRuntime::new(&agent, PhaseConfig::default());
        let outcome = runtime
            .analyze(&Cancel::new(), dir.path(), "Fix bug", "body")
            .unwrap();
        assert_eq!(outcome, AnalyzeOutcome::NoQuestions);
    }

    #[test]
    fn integrate_feedback_detects_significant_changes() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent {
            responses: RefCell::new(vec![Ok(format!("ack\n{SIGNIFICANT_CHANGES_MARKER}"))]),
            writes: None,
        };
        let runtime = PhaseRuntime::new(&agent, PhaseConfig::default());
        let outcome = runtime
            .integrate_feedback(&Cancel::new(), dir.path(), "please add tests")
            .unwrap();
        assert!(outcome.needs_re_review);
    }

    #[test]
    fn integrate_feedback_detects_minor_changes() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent {
            responses: RefCell::new(vec![Ok(format!("ack\n{MINOR_CHANGES_MARKER}"))]),
            writes: None,
        };
        let runtime = PhaseRuntime::new(&agent, PhaseConfig::default());
        let outcome = runtime
            .integrate_feedback(&Cancel::new(), dir.path(), "typo fix please")
            .unwrap();
        assert!(!outcome.needs_re_review);
    }

    #[test]
    fn implement_extracts_branch_name_on_completion() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent {
            responses: RefCell::new(vec![Ok(format!(
                "working...\n{IMPLEMENTATION_COMPLETE_MARKER} feat/7-add-login\n"
            ))]),
            writes: None,
        };
        let runtime = PhaseRuntime::new(&agent, PhaseConfig::default());
        let outcome = runtime
            .implement_with_git(&Cancel::new(), dir.path(), "Add login", 7, "main")
            .unwrap();
        match outcome {
            ImplementOutcome::Complete { branch } => assert_eq!(branch, "feat/7-add-login"),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn implement_extracts_conflict_files() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent {
            responses: RefCell::new(vec![Ok(format!(
                "rebasing...\n{MERGE_CONFLICT_MARKER} a.go, b.go\n"
            ))]),
            writes: None,
        };
        let runtime = PhaseRuntime::new(&agent, PhaseConfig::default());
        let outcome = runtime
            .implement_with_git(&Cancel::new(), dir.path(), "Add login", 7, "main")
            .unwrap();
        match outcome {
            ImplementOutcome::MergeConflict { files } => {
                assert_eq!(files, vec!["a.go".to_string(), "b.go".to_string()])
            }
            other => panic!("expected MergeConflict, got {other:?}"),
        }
    }

    #[test]
    fn implement_without_marker_is_a_retryable_agent_error() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent {
            responses: RefCell::new(vec![Ok(
                "fatal: the remote end hung up unexpectedly (connection reset)".to_string(),
            )]),
            writes: None,
        };
        let runtime = PhaseRuntime::new(&agent, PhaseConfig::default());
        let err = runtime
            .implement_with_git(&Cancel::new(), dir.path(), "Add login", 7, "main")
            .unwrap_err();
        assert_eq!(err.classify(), crate::retry::ErrorKind::Retryable);
    }
}
