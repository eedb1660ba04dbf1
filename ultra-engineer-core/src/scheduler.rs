//! The multi-repo poll loop. Discovers triggered issues, resolves
//! dependencies, submits ready work to the worker pool, and unblocks
//! dependents as jobs finish.
//!
//! A poll-sleep-poll loop shape: tick, drain results, dispatch, sleep,
//! generalized to multi-repo dependency-aware scheduling.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::deps::{self, CompletionOracle};
use crate::log;
use crate::model::{IssueState, Phase};
use crate::provider::Provider;
use crate::retry::Cancel;
use crate::state_machine;
use crate::worker_pool::{Job, WorkerPool};

/// Builds the job that processes one ready issue. Kept behind a trait so
/// the scheduler stays provider/agent-agnostic, separating planning from
/// dispatch mechanics.
pub trait JobFactory: Send + Sync {
    fn build(&self, repo: &str, number: u64, state: IssueState) -> Job;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub repos: Vec<String>,
    pub trigger_label: String,
    pub poll_interval: Duration,
    pub shutdown_deadline: Duration,
}

/// Oracle over the scheduler's own `all_states` map plus a provider
/// fallback, used by `deps::can_proceed`.
struct ProviderBackedOracle<'a> {
    provider: &'a dyn Provider,
    cancel: &'a Cancel,
    repo: &'a str,
    local: &'a HashMap<u64, IssueState>,
}

impl CompletionOracle for ProviderBackedOracle<'_> {
    fn is_completed(&self, number: u64) -> bool {
        if let Some(state) = self.local.get(&number) {
            return state.current_phase == Phase::Completed;
        }
        match self.provider.get_issue(self.cancel, self.repo, number) {
            Ok(issue) => issue.has_label(&Phase::Completed.label()),
            Err(_) => false,
        }
    }
}

/// Drives the scheduling loop for a fixed set of repos.
pub struct Scheduler<'a> {
    provider: &'a dyn Provider,
    pool: Arc<WorkerPool>,
    factory: Arc<dyn JobFactory>,
    cancel: Cancel,
    config: SchedulerConfig,
    all_states: Mutex<HashMap<String, HashMap<u64, IssueState>>>,
    submitted: Mutex<HashSet<(String, u64)>>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        pool: Arc<WorkerPool>,
        factory: Arc<dyn JobFactory>,
        cancel: Cancel,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            provider,
            pool,
            factory,
            cancel,
            config,
            all_states: Mutex::new(HashMap::new()),
            submitted: Mutex::new(HashSet::new()),
        }
    }

    /// Runs until `cancel` fires, then performs the worker pool's graceful
    /// shutdown protocol.
    pub fn run(&self) {
        self.tick();
        while !self.cancel.is_cancelled() {
            if !self.cancel.sleep(self.config.poll_interval) {
                break;
            }
            self.tick();
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        let all_states = &self.all_states;
        let result = self.pool.shutdown(
            |repo, number, state| {
                let mut states = all_states.lock().expect("all_states mutex poisoned");
                states.entry(repo.to_string()).or_default().insert(number, state.clone());
            },
            self.config.shutdown_deadline,
        );
        match result {
            Ok(()) => log::info("scheduler", "graceful shutdown complete"),
            Err(()) => log::warn("scheduler", "shutdown deadline elapsed, cancelling root context"),
        }
    }

    /// One polling cycle.
    pub fn tick(&self) {
        self.drain_and_unblock();

        for repo in self.config.repos.clone() {
            self.poll_repo(&repo);
        }

        self.dispatch_ready();
        log::info("scheduler", &format!("active workers: {}", self.pool.active_total()));
    }

    fn drain_and_unblock(&self) {
        for outcome in self.pool.drain_results() {
            self.pool.on_job_complete(&outcome.repo);
            self.submitted
                .lock()
                .expect("submitted mutex poisoned")
                .remove(&(outcome.repo.clone(), outcome.number));
            log::info(
                &outcome.repo,
                &format!(
                    "issue #{} finished in phase {} {}",
                    outcome.number,
                    outcome.final_phase,
                    outcome.error.as_deref().unwrap_or("")
                ),
            );

            let mut all_states = self.all_states.lock().expect("all_states mutex poisoned");
            if let Some(repo_states) = all_states.get_mut(&outcome.repo) {
                if let Some(finished_state) = repo_states.get_mut(&outcome.number) {
                    finished_state.current_phase = outcome.final_phase;
                }
                let mut peers: Vec<(&u64, &mut IssueState)> = repo_states.iter_mut().collect();
                let effects = state_machine::recompute_on_completion(
                    outcome.number,
                    outcome.final_phase,
                    &mut peers,
                );
                for number in effects.newly_ready {
                    let _ = self.provider.create_comment(
                        &self.cancel,
                        &outcome.repo,
                        number,
                        &format!(
                            "{}\n\nDependency #{} completed.",
                            crate::codec::BOT_MARKER,
                            outcome.number
                        ),
                    );
                }
                for number in effects.newly_failed {
                    self.fail_dependent(&outcome.repo, number, outcome.number);
                }
            }
        }
    }

    /// Marks a peer `failed` on the provider because the issue it depended
    /// on failed first (spec §4.9): posts a bot comment, flips the
    /// `phase:*` label to `phase:failed`, and removes the trigger label —
    /// the same relabel `IssueWorker::fail` performs for a worker-local
    /// failure, applied here since this peer never ran a worker of its own.
    fn fail_dependent(&self, repo: &str, number: u64, failed_dependency: u64) {
        for phase in Phase::ALL {
            if phase != Phase::Failed {
                let _ = self.provider.remove_label(&self.cancel, repo, number, &phase.label());
            }
        }
        let _ = self.provider.add_label(&self.cancel, repo, number, &Phase::Failed.label());
        let _ = self.provider.remove_label(&self.cancel, repo, number, &self.config.trigger_label);
        let _ = self.provider.create_comment(
            &self.cancel,
            repo,
            number,
            &format!(
                "{}\n\nDependency #{failed_dependency} failed; this issue cannot proceed.",
                crate::codec::BOT_MARKER
            ),
        );
    }

    fn poll_repo(&self, repo: &str) {
        let Ok(numbers) = self
            .provider
            .list_issues_with_label(&self.cancel, repo, &self.config.trigger_label)
        else {
            log::warn(repo, "failed to list triggered issues this tick");
            return;
        };

        let mut all_states = self.all_states.lock().expect("all_states mutex poisoned");
        let repo_states = all_states.entry(repo.to_string()).or_default();

        for number in numbers {
            let Ok(issue) = self.provider.get_issue(&self.cancel, repo, number) else {
                continue;
            };
            let comments = self
                .provider
                .get_comments(&self.cancel, repo, number)
                .unwrap_or_default();
            let state = repo_states.entry(number).or_insert_with(|| {
                let bodies: Vec<&str> = comments.iter().map(|c| c.body.as_str()).collect();
                crate::codec::parse_from_comments(bodies)
                    .unwrap_or_else(|| IssueState::synthesize(&issue))
            });

            if state.current_phase.is_terminal() {
                continue;
            }

            if state.depends_on.is_empty() && !deps::has_opted_out(&issue.labels, &issue.body) {
                let comment_bodies: Vec<String> = comments.iter().map(|c| c.body.clone()).collect();
                state.depends_on = deps::resolve_dependencies(number, &issue.labels, &issue.body, &comment_bodies);
                state.blocked_by = state.depends_on.clone();
            }
        }

        let graph: HashMap<u64, Vec<u64>> = repo_states
            .iter()
            .map(|(n, s)| (*n, s.depends_on.clone()))
            .collect();
        let cycles = deps::detect_cycles(&graph);
        if !cycles.is_empty() {
            log::warn(repo, &format!("{} dependency cycle(s) detected", cycles.len()));
            state_machine::fail_cycle_members(&cycles, repo_states);
        }
    }

    fn dispatch_ready(&self) {
        let mut all_states = self.all_states.lock().expect("all_states mutex poisoned");
        let mut submitted = self.submitted.lock().expect("submitted mutex poisoned");

        for (repo, repo_states) in all_states.iter_mut() {
            let local = repo_states.clone();
            let mut ready_numbers = Vec::new();
            for (number, state) in repo_states.iter_mut() {
                if state.current_phase.is_terminal() {
                    continue;
                }
                if submitted.contains(&(repo.clone(), *number)) {
                    continue;
                }
                let oracle = ProviderBackedOracle {
                    provider: self.provider,
                    cancel: &self.cancel,
                    repo,
                    local: &local,
                };
                if deps::can_proceed(&state.depends_on, &oracle) {
                    state.blocked_by.clear();
                    ready_numbers.push(*number);
                }
            }

            for number in ready_numbers {
                let state = repo_states
                    .get(&number)
                    .cloned()
                    .expect("ready issue number was just read from this same map");
                let job = self.factory.build(repo, number, state);
                match self.pool.try_submit(job) {
                    Ok(()) => {
                        submitted.insert((repo.clone(), number));
                    }
                    Err(_) => {
                        // Pool is full this tick; retried next tick.
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Issue;
    use chrono::Utc;

    fn sample_issue(number: u64) -> Issue {
        Issue {
            repo: "acme/widgets".to_string(),
            number,
            title: "t".to_string(),
            body: "b".to_string(),
            labels: vec![],
            author: "a".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn oracle_treats_locally_completed_as_completed() {
        let mut local = HashMap::new();
        let mut state = IssueState::synthesize(&sample_issue(2));
        state.current_phase = Phase::Completed;
        local.insert(2u64, state);

        struct UnreachableProvider;
        impl Provider for UnreachableProvider {
            fn get_issue(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<Issue> {
                panic!("should not consult provider when state is local")
            }
            fn list_issues_with_label(&self, _c: &Cancel, _r: &str, _l: &str) -> crate::provider::PResult<Vec<u64>> { unimplemented!() }
            fn get_comments(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<Vec<crate::model::Comment>> { unimplemented!() }
            fn create_comment(&self, _c: &Cancel, _r: &str, _n: u64, _b: &str) -> crate::provider::PResult<String> { unimplemented!() }
            fn update_comment(&self, _c: &Cancel, _r: &str, _id: &str, _b: &str) -> crate::provider::PResult<()> { unimplemented!() }
            fn update_issue_body(&self, _c: &Cancel, _r: &str, _n: u64, _b: &str) -> crate::provider::PResult<()> { unimplemented!() }
            fn react_to_comment(&self, _c: &Cancel, _r: &str, _id: &str, _re: &str) -> crate::provider::PResult<()> { unimplemented!() }
            fn add_label(&self, _c: &Cancel, _r: &str, _n: u64, _l: &str) -> crate::provider::PResult<()> { unimplemented!() }
            fn remove_label(&self, _c: &Cancel, _r: &str, _n: u64, _l: &str) -> crate::provider::PResult<()> { unimplemented!() }
            fn create_pr(&self, _c: &Cancel, _r: &str, _b: &str, _base: &str, _t: &str, _body: &str) -> crate::provider::PResult<crate::provider::PullRequest> { unimplemented!() }
            fn get_pr(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<crate::provider::PullRequest> { unimplemented!() }
            fn get_pr_comments(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<Vec<crate::model::Comment>> { unimplemented!() }
            fn get_pr_review_comments(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<Vec<crate::model::Comment>> { unimplemented!() }
            fn is_mergeable(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<bool> { unimplemented!() }
            fn merge_pr(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<()> { unimplemented!() }
            fn clone_repo(&self, _c: &Cancel, _r: &str, _d: &std::path::Path) -> crate::provider::PResult<()> { unimplemented!() }
            fn get_default_branch(&self, _c: &Cancel, _r: &str) -> crate::provider::PResult<String> { unimplemented!() }
            fn is_collaborator(&self, _c: &Cancel, _r: &str, _u: &str) -> crate::provider::PResult<bool> { unimplemented!() }
            fn get_ci_status(&self, _c: &Cancel, _r: &str, _pr: u64) -> crate::provider::PResult<crate::provider::CiStatus> { unimplemented!() }
            fn get_ci_logs(&self, _c: &Cancel, _r: &str, _id: &str) -> crate::provider::PResult<String> { unimplemented!() }
        }

        let provider = UnreachableProvider;
        let cancel = Cancel::new();
        let oracle = ProviderBackedOracle {
            provider: &provider,
            cancel: &cancel,
            repo: "acme/widgets",
            local: &local,
        };
        assert!(deps::can_proceed(&[2], &oracle));
    }

    #[test]
    fn job_factory_is_object_safe_and_invocable() {
        struct FixedFactory;
        impl JobFactory for FixedFactory {
            fn build(&self, repo: &str, number: u64, state: IssueState) -> Job {
                Job {
                    repo: repo.to_string(),
                    number,
                    state: Arc::new(Mutex::new(state)),
                    run: Box::new(move |_c| crate::worker_pool::JobOutcome {
                        repo: repo.to_string(),
                        number,
                        final_phase: Phase::Completed,
                        error: None,
                    }),
                }
            }
        }
        let factory: Arc<dyn JobFactory> = Arc::new(FixedFactory);
        let job = factory.build("acme/widgets", 1, IssueState::synthesize(&sample_issue(1)));
        assert_eq!(job.repo, "acme/widgets");
    }

    /// Records every label/comment call so `fail_dependent` can be checked
    /// without a real provider.
    struct RecordingProvider {
        labels_added: Mutex<Vec<String>>,
        labels_removed: Mutex<Vec<String>>,
        comments: Mutex<Vec<String>>,
    }

    impl RecordingProvider {
        fn new() -> Self {
            Self {
                labels_added: Mutex::new(Vec::new()),
                labels_removed: Mutex::new(Vec::new()),
                comments: Mutex::new(Vec::new()),
            }
        }
    }

    impl Provider for RecordingProvider {
        fn get_issue(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<crate::model::Issue> { unimplemented!() }
        fn list_issues_with_label(&self, _c: &Cancel, _r: &str, _l: &str) -> crate::provider::PResult<Vec<u64>> { unimplemented!() }
        fn get_comments(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<Vec<crate::model::Comment>> { unimplemented!() }
        fn create_comment(&self, _c: &Cancel, _r: &str, _n: u64, body: &str) -> crate::provider::PResult<String> {
            self.comments.lock().unwrap().push(body.to_string());
            Ok("1".to_string())
        }
        fn update_comment(&self, _c: &Cancel, _r: &str, _id: &str, _b: &str) -> crate::provider::PResult<()> { unimplemented!() }
        fn update_issue_body(&self, _c: &Cancel, _r: &str, _n: u64, _b: &str) -> crate::provider::PResult<()> { unimplemented!() }
        fn react_to_comment(&self, _c: &Cancel, _r: &str, _id: &str, _re: &str) -> crate::provider::PResult<()> { unimplemented!() }
        fn add_label(&self, _c: &Cancel, _r: &str, _n: u64, label: &str) -> crate::provider::PResult<()> {
            self.labels_added.lock().unwrap().push(label.to_string());
            Ok(())
        }
        fn remove_label(&self, _c: &Cancel, _r: &str, _n: u64, label: &str) -> crate::provider::PResult<()> {
            self.labels_removed.lock().unwrap().push(label.to_string());
            Ok(())
        }
        fn create_pr(&self, _c: &Cancel, _r: &str, _b: &str, _base: &str, _t: &str, _body: &str) -> crate::provider::PResult<crate::provider::PullRequest> { unimplemented!() }
        fn get_pr(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<crate::provider::PullRequest> { unimplemented!() }
        fn get_pr_comments(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<Vec<crate::model::Comment>> { unimplemented!() }
        fn get_pr_review_comments(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<Vec<crate::model::Comment>> { unimplemented!() }
        fn is_mergeable(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<bool> { unimplemented!() }
        fn merge_pr(&self, _c: &Cancel, _r: &str, _n: u64) -> crate::provider::PResult<()> { unimplemented!() }
        fn clone_repo(&self, _c: &Cancel, _r: &str, _d: &std::path::Path) -> crate::provider::PResult<()> { unimplemented!() }
        fn get_default_branch(&self, _c: &Cancel, _r: &str) -> crate::provider::PResult<String> { unimplemented!() }
        fn is_collaborator(&self, _c: &Cancel, _r: &str, _u: &str) -> crate::provider::PResult<bool> { unimplemented!() }
        fn get_ci_status(&self, _c: &Cancel, _r: &str, _pr: u64) -> crate::provider::PResult<crate::provider::CiStatus> { unimplemented!() }
        fn get_ci_logs(&self, _c: &Cancel, _r: &str, _id: &str) -> crate::provider::PResult<String> { unimplemented!() }
    }

    #[test]
    fn fail_dependent_relabels_and_posts_a_comment() {
        let provider = RecordingProvider::new();
        let cancel = Cancel::new();
        let pool = WorkerPool::new(1, 1, cancel.clone());
        struct UnusedFactory;
        impl JobFactory for UnusedFactory {
            fn build(&self, _repo: &str, _number: u64, _state: IssueState) -> Job {
                unimplemented!()
            }
        }
        let scheduler = Scheduler::new(
            &provider,
            pool,
            Arc::new(UnusedFactory),
            cancel,
            SchedulerConfig {
                repos: vec!["acme/widgets".to_string()],
                trigger_label: "ai-implement".to_string(),
                poll_interval: Duration::from_secs(1),
                shutdown_deadline: Duration::from_secs(1),
            },
        );

        scheduler.fail_dependent("acme/widgets", 1, 2);

        assert!(provider.labels_added.lock().unwrap().contains(&Phase::Failed.label()));
        assert!(provider.labels_removed.lock().unwrap().contains(&"ai-implement".to_string()));
        let comments = provider.comments.lock().unwrap();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].contains("Dependency #2 failed"));
    }
}
