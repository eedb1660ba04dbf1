//! CLI entry point. Loads config and credentials, constructs the concrete
//! provider/agent, and dispatches to the subcommand: parse args, load
//! config, match on the command into small `cmd_*` functions, print
//! `Error: {e}` and exit 1 on failure.

mod cli;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use ultra_engineer_core::agent::ClaudeCliAgent;
use ultra_engineer_core::codec;
use ultra_engineer_core::config::{Config, Credentials};
use ultra_engineer_core::log;
use ultra_engineer_core::model::{FailureReason, IssueState, Phase};
use ultra_engineer_core::phases::PhaseConfig;
use ultra_engineer_core::progress::ProgressReporter;
use ultra_engineer_core::provider::gh_cli::GhCliProvider;
use ultra_engineer_core::provider::Provider;
use ultra_engineer_core::retry::Cancel;
use ultra_engineer_core::scheduler::{JobFactory, Scheduler, SchedulerConfig};
use ultra_engineer_core::state_machine::{IssueWorker, StepOutcome, WorkerConfig};
use ultra_engineer_core::worker_pool::{Job, JobOutcome, WorkerPool};

use cli::{Cli, Commands};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let cli = Cli::parse();

    if let Some(path) = &cli.log_file {
        if let Err(e) = log::set_log_file(path) {
            eprintln!("Error: failed to open log file {}: {e}", path.display());
            std::process::exit(1);
        }
    }

    let result = run(cli);
    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if matches!(cli.command, Commands::Version) {
        println!("ultra-engineer {VERSION}");
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    let creds = Credentials::load().context("resolving credentials")?;
    apply_credentials(&creds, cli.verbose);

    match cli.command {
        Commands::Version => unreachable!("handled above"),
        Commands::Daemon { repos } => cmd_daemon(&config, repos, cli.verbose),
        Commands::Run { repo, issue } => cmd_run(&config, &repo, issue),
        Commands::Status { repo, issue } => cmd_status(&config, &repo, issue),
        Commands::Abort { repo, issue } => cmd_abort(&config, &repo, issue),
    }
}

/// Exports resolved credentials into the process environment so the `gh`
/// and agent CLI subprocesses (which only read env, never take tokens as
/// arguments) pick them up — credentials are added to the environment
/// before the subprocess is launched, never passed as arguments.
fn apply_credentials(creds: &Credentials, verbose: bool) {
    if let Some(token) = &creds.gh_token {
        std::env::set_var("GH_TOKEN", token);
    }
    if let Some(token) = &creds.oauth_token {
        std::env::set_var("CLAUDE_CODE_OAUTH_TOKEN", token);
    } else if let Some(key) = &creds.api_key {
        std::env::set_var("ANTHROPIC_API_KEY", key);
    } else {
        log::warn("", "no CLAUDE_CODE_OAUTH_TOKEN or ANTHROPIC_API_KEY set; agent invocations will fail");
    }
    log::verbose(verbose, "", "credentials resolved");
}

fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_default();
    PathBuf::from(home).join(".ultra-engineer").join("config.yaml")
}

fn default_sandbox_root() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_default();
    PathBuf::from(home).join(".ultra-engineer").join("sandboxes")
}

/// `owner--repo--number`, a filesystem-safe per-issue sandbox directory name.
fn sandbox_name(repo: &str, number: u64) -> String {
    format!("{}--{number}", repo.replace('/', "--"))
}

fn worker_config(config: &Config) -> WorkerConfig {
    WorkerConfig {
        base_branch: config.defaults.base_branch.clone(),
        auto_merge: config.defaults.auto_merge,
        trigger_label: config.trigger_label.clone(),
        wait_for_ci: config.ci.wait_for_ci,
        ci_poll_interval: config.ci.poll_interval,
        ci_timeout: config.ci.timeout,
        max_ci_fix_attempts: config.ci.max_fix_attempts,
    }
}

fn phase_config(config: &Config) -> PhaseConfig {
    PhaseConfig {
        agent_timeout: config.claude.timeout,
        review_cycles: config.claude.review_cycles,
    }
}

/// Clones the repo into `sandbox` the first time it's seen; a pre-existing
/// `.git` directory is trusted as-is so a restarted daemon reuses its
/// checkout instead of re-cloning on every tick.
fn ensure_sandbox(provider: &dyn Provider, cancel: &Cancel, repo: &str, sandbox: &Path) -> Result<()> {
    if sandbox.join(".git").exists() {
        return Ok(());
    }
    std::fs::create_dir_all(sandbox)
        .with_context(|| format!("creating sandbox dir {}", sandbox.display()))?;
    provider
        .clone_repo(cancel, repo, sandbox)
        .map_err(|e| anyhow::anyhow!("cloning {repo}: {e}"))
}

// -- daemon -------------------------------------------------------------------

struct CliJobFactory {
    config: Arc<Config>,
    sandbox_root: PathBuf,
}

impl JobFactory for CliJobFactory {
    fn build(&self, repo: &str, number: u64, state: IssueState) -> Job {
        let config = self.config.clone();
        let sandbox_root = self.sandbox_root.clone();
        let repo_owned = repo.to_string();
        let shared_state = Arc::new(Mutex::new(state));
        let run_state = shared_state.clone();
        Job {
            repo: repo.to_string(),
            number,
            state: shared_state,
            run: Box::new(move |cancel: &Cancel| {
                run_issue_job(&config, &sandbox_root, &repo_owned, number, run_state, cancel)
            }),
        }
    }
}

/// Drives one issue as far as it will go this dispatch: repeated `step()`
/// calls until the phase is terminal or the next transition needs a human.
/// The scheduler re-submits on a later tick if there's more to do once new
/// input arrives.
fn run_issue_job(
    config: &Config,
    sandbox_root: &Path,
    repo: &str,
    number: u64,
    shared_state: Arc<Mutex<IssueState>>,
    cancel: &Cancel,
) -> JobOutcome {
    let provider = GhCliProvider::new();
    let agent = ClaudeCliAgent::new(config.claude.command.clone());
    let sandbox = sandbox_root.join(sandbox_name(repo, number));

    let issue = match provider.get_issue(cancel, repo, number) {
        Ok(issue) => issue,
        Err(e) => {
            log::warn(repo, &format!("issue #{number}: failed to fetch: {e}"));
            return JobOutcome {
                repo: repo.to_string(),
                number,
                final_phase: shared_state.lock().expect("job state mutex poisoned").current_phase,
                error: Some(e.to_string()),
            };
        }
    };

    if let Err(e) = ensure_sandbox(&provider, cancel, repo, &sandbox) {
        log::warn(repo, &format!("issue #{number}: sandbox setup failed: {e}"));
        return JobOutcome {
            repo: repo.to_string(),
            number,
            final_phase: shared_state.lock().expect("job state mutex poisoned").current_phase,
            error: Some(e.to_string()),
        };
    }

    let mut state = shared_state.lock().expect("job state mutex poisoned").clone();
    let progress = ProgressReporter::new(
        &provider,
        repo,
        number,
        state.clone(),
        config.progress.debounce_interval,
    );
    let worker = IssueWorker::new(
        &provider,
        &agent,
        phase_config(config),
        &progress,
        cancel,
        worker_config(config),
        sandbox,
    );

    loop {
        if cancel.is_cancelled() {
            *shared_state.lock().expect("job state mutex poisoned") = state.clone();
            return JobOutcome {
                repo: repo.to_string(),
                number,
                final_phase: state.current_phase,
                error: Some("cancelled".to_string()),
            };
        }
        match worker.step(&issue, &mut state) {
            Ok(StepOutcome::InProgress) => {
                *shared_state.lock().expect("job state mutex poisoned") = state.clone();
            }
            Ok(StepOutcome::AwaitingInput) | Ok(StepOutcome::Terminal) => {
                *shared_state.lock().expect("job state mutex poisoned") = state.clone();
                return JobOutcome {
                    repo: repo.to_string(),
                    number,
                    final_phase: state.current_phase,
                    error: if state.error.is_empty() { None } else { Some(state.error.clone()) },
                };
            }
            Err(e) => {
                log::warn(repo, &format!("issue #{number} step failed: {e}"));
                *shared_state.lock().expect("job state mutex poisoned") = state.clone();
                return JobOutcome {
                    repo: repo.to_string(),
                    number,
                    final_phase: state.current_phase,
                    error: Some(e.to_string()),
                };
            }
        }
    }
}

fn cmd_daemon(config: &Config, repos: Vec<String>, verbose: bool) -> Result<()> {
    let repos = if repos.is_empty() { config.repos.clone() } else { repos };
    if repos.is_empty() {
        anyhow::bail!("no repos given on the command line or in the config file");
    }

    let cancel = Cancel::new();
    let sig_cancel = cancel.clone();
    let interrupted = Arc::new(AtomicBool::new(false));
    let sig_interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        sig_interrupted.store(true, Ordering::SeqCst);
        sig_cancel.cancel();
    })
    .context("installing SIGINT/SIGTERM handler")?;

    let pool = WorkerPool::new(
        config.concurrency.max_per_repo,
        config.concurrency.max_total,
        cancel.clone(),
    );
    let factory: Arc<dyn JobFactory> = Arc::new(CliJobFactory {
        config: Arc::new(config.clone()),
        sandbox_root: default_sandbox_root(),
    });
    let provider = GhCliProvider::new();
    let scheduler = Scheduler::new(
        &provider,
        pool.clone(),
        factory,
        cancel,
        SchedulerConfig {
            repos: repos.clone(),
            trigger_label: config.trigger_label.clone(),
            poll_interval: config.poll_interval,
            shutdown_deadline: Duration::from_secs(60),
        },
    );

    log::info("", &format!("ultra-engineer {VERSION} daemon starting over {} repo(s)", repos.len()));
    log::verbose(verbose, "", &format!("trigger label: {}", config.trigger_label));
    scheduler.run();
    // Worker threads hold `queue_tx` for the pool's whole lifetime and never
    // exit on their own (worker_pool.rs); `scheduler.run()`'s internal
    // shutdown already waited for in-flight jobs, so the process simply
    // exits here without joining them.

    if interrupted.load(Ordering::SeqCst) {
        log::info("", "shut down after interrupt");
    }
    Ok(())
}

// -- run ------------------------------------------------------------------------

fn cmd_run(config: &Config, repo: &str, number: u64) -> Result<()> {
    let cancel = Cancel::new();
    let sig_cancel = cancel.clone();
    ctrlc::set_handler(move || sig_cancel.cancel()).context("installing SIGINT/SIGTERM handler")?;

    let provider = GhCliProvider::new();
    let agent = ClaudeCliAgent::new(config.claude.command.clone());

    let issue = provider
        .get_issue(&cancel, repo, number)
        .map_err(|e| anyhow::anyhow!("fetching {repo}#{number}: {e}"))?;
    let comments = provider
        .get_comments(&cancel, repo, number)
        .map_err(|e| anyhow::anyhow!("fetching comments for {repo}#{number}: {e}"))?;
    let bodies: Vec<&str> = comments.iter().map(|c| c.body.as_str()).collect();
    let mut state = codec::parse_from_comments(bodies).unwrap_or_else(|| IssueState::synthesize(&issue));

    let sandbox = default_sandbox_root().join(sandbox_name(repo, number));
    ensure_sandbox(&provider, &cancel, repo, &sandbox)?;

    let progress = ProgressReporter::new(&provider, repo, number, state.clone(), config.progress.debounce_interval);
    let worker = IssueWorker::new(
        &provider,
        &agent,
        phase_config(config),
        &progress,
        &cancel,
        worker_config(config),
        sandbox,
    );

    loop {
        if cancel.is_cancelled() {
            anyhow::bail!("interrupted");
        }
        let outcome = worker
            .step(&issue, &mut state)
            .map_err(|e| anyhow::anyhow!("{repo}#{number}: {e}"))?;
        println!("[{}#{number}] phase={} -> {:?}", repo, state.current_phase, outcome);
        match outcome {
            StepOutcome::InProgress => continue,
            StepOutcome::AwaitingInput => {
                println!("awaiting further input; exiting");
                return Ok(());
            }
            StepOutcome::Terminal => {
                println!("reached terminal phase: {}", state.current_phase);
                return Ok(());
            }
        }
    }
}

// -- status -----------------------------------------------------------------------

fn cmd_status(config: &Config, repo: &str, issue: Option<u64>) -> Result<()> {
    let cancel = Cancel::new();
    let provider = GhCliProvider::new();

    let numbers = match issue {
        Some(n) => vec![n],
        None => provider
            .list_issues_with_label(&cancel, repo, &config.trigger_label)
            .map_err(|e| anyhow::anyhow!("listing triggered issues in {repo}: {e}"))?,
    };

    if numbers.is_empty() {
        println!("no issues found in {repo} with label {}", config.trigger_label);
        return Ok(());
    }

    for number in numbers {
        print_issue_status(&provider, &cancel, repo, number);
    }
    Ok(())
}

fn print_issue_status(provider: &dyn Provider, cancel: &Cancel, repo: &str, number: u64) {
    let issue = match provider.get_issue(cancel, repo, number) {
        Ok(issue) => issue,
        Err(e) => {
            println!("{repo}#{number}  ERROR fetching issue: {e}");
            return;
        }
    };
    let comments = provider.get_comments(cancel, repo, number).unwrap_or_default();
    let bodies: Vec<&str> = comments.iter().map(|c| c.body.as_str()).collect();
    let state = codec::parse_from_comments(bodies).unwrap_or_else(|| IssueState::synthesize(&issue));

    println!("{repo}#{number}  {:<12} {}", state.current_phase.to_string(), issue.title);
    if state.pr_number != 0 {
        println!("  pr #{}  branch {}", state.pr_number, state.branch_name);
    }
    if !state.depends_on.is_empty() {
        println!("  depends_on {:?}  blocked_by {:?}", state.depends_on, state.blocked_by);
    }
    if let Some(reason) = state.failure_reason {
        println!("  failed: {reason}: {}", state.error);
    }
    println!("  last_updated {}", state.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
}

// -- abort --------------------------------------------------------------------------

fn cmd_abort(config: &Config, repo: &str, number: u64) -> Result<()> {
    let cancel = Cancel::new();
    let provider = GhCliProvider::new();

    let issue = provider
        .get_issue(&cancel, repo, number)
        .map_err(|e| anyhow::anyhow!("fetching {repo}#{number}: {e}"))?;
    let comments = provider
        .get_comments(&cancel, repo, number)
        .map_err(|e| anyhow::anyhow!("fetching comments for {repo}#{number}: {e}"))?;
    let bodies: Vec<&str> = comments.iter().map(|c| c.body.as_str()).collect();
    let mut state = codec::parse_from_comments(bodies).unwrap_or_else(|| IssueState::synthesize(&issue));

    if state.current_phase.is_terminal() {
        println!("{repo}#{number} is already {}", state.current_phase);
        return Ok(());
    }

    state.current_phase = Phase::Failed;
    state.failure_reason = Some(FailureReason::Other);
    state.error = "aborted via CLI".to_string();

    for phase in Phase::ALL {
        if phase != Phase::Failed {
            let _ = provider.remove_label(&cancel, repo, number, &phase.label());
        }
    }
    provider
        .add_label(&cancel, repo, number, &Phase::Failed.label())
        .map_err(|e| anyhow::anyhow!("labeling {repo}#{number} failed: {e}"))?;
    provider
        .add_label(&cancel, repo, number, "abort")
        .map_err(|e| anyhow::anyhow!("labeling {repo}#{number} abort: {e}"))?;
    let _ = provider.remove_label(&cancel, repo, number, &config.trigger_label);

    let body = codec::append_to_body(
        &format!("{}\n\nAborted via CLI.", codec::BOT_MARKER),
        &state,
    );
    provider
        .create_comment(&cancel, repo, number, &body)
        .map_err(|e| anyhow::anyhow!("posting abort comment on {repo}#{number}: {e}"))?;

    println!("{repo}#{number} aborted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_name_replaces_slash() {
        assert_eq!(sandbox_name("acme/widgets", 42), "acme--widgets--42");
    }

    #[test]
    fn default_config_path_is_under_home_dotdir() {
        let path = default_config_path();
        assert!(path.ends_with(".ultra-engineer/config.yaml"));
    }
}
