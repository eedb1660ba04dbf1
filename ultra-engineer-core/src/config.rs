//! Runtime configuration.
//!
//! Resolution order: **hardcoded default < YAML config file**. `${VAR}` is
//! expanded against the process environment anywhere in the raw file text
//! before the YAML is parsed, via a small set of hand-rolled
//! text-processing helpers — no templating crate.
//!
//! ```text
//! Key                              Default
//! ──────────────────────────────── ───────────────
//! provider                         "gitea"
//! poll_interval                    60s
//! trigger_label                    "ai-implement"
//! log_file                         ""
//! repos                            []
//! claude.command                   "claude"
//! claude.timeout                   30m
//! claude.review_cycles             5
//! retry.max_attempts               3 (0 = infinite)
//! retry.backoff_base               10s
//! retry.rate_limit_retry           5m
//! defaults.base_branch             "main"
//! defaults.auto_merge              true
//! concurrency.max_per_repo         1
//! concurrency.max_total            5
//! concurrency.dependency_detection "auto"
//! progress.enabled                 true
//! progress.debounce_interval       60s
//! ci.wait_for_ci                   false
//! ci.poll_interval                 30s
//! ci.timeout                       20m
//! ci.max_fix_attempts              3
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use std::{env, fs};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: String,
    pub poll_interval: Duration,
    pub trigger_label: String,
    pub log_file: String,
    pub repos: Vec<String>,
    pub claude: ClaudeConfig,
    pub retry: RetryConfig,
    pub defaults: DefaultsConfig,
    pub concurrency: ConcurrencyConfig,
    pub progress: ProgressConfig,
    pub ci: CiConfig,
}

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub command: String,
    pub timeout: Duration,
    pub review_cycles: u32,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: i64,
    pub backoff_base: Duration,
    pub rate_limit_retry: Duration,
}

#[derive(Debug, Clone)]
pub struct DefaultsConfig {
    pub base_branch: String,
    pub auto_merge: bool,
}

/// How dependency relationships are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyDetection {
    Auto,
    Manual,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub max_per_repo: usize,
    pub max_total: usize,
    pub dependency_detection: DependencyDetection,
}

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub enabled: bool,
    pub debounce_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CiConfig {
    pub wait_for_ci: bool,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub max_fix_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: "gitea".to_string(),
            poll_interval: secs(60),
            trigger_label: "ai-implement".to_string(),
            log_file: String::new(),
            repos: Vec::new(),
            claude: ClaudeConfig {
                command: "claude".to_string(),
                timeout: secs(1800),
                review_cycles: 5,
            },
            retry: RetryConfig {
                max_attempts: 3,
                backoff_base: secs(10),
                rate_limit_retry: secs(300),
            },
            defaults: DefaultsConfig {
                base_branch: "main".to_string(),
                auto_merge: true,
            },
            concurrency: ConcurrencyConfig {
                max_per_repo: 1,
                max_total: 5,
                dependency_detection: DependencyDetection::Auto,
            },
            progress: ProgressConfig {
                enabled: true,
                debounce_interval: secs(60),
            },
            ci: CiConfig {
                wait_for_ci: false,
                poll_interval: secs(30),
                timeout: secs(1200),
                max_fix_attempts: 3,
            },
        }
    }
}

impl Config {
    /// Load config from a YAML file at `path`, falling back to defaults for
    /// unset keys. Missing file is not an error — defaults apply throughout.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, |k| env::var(k).ok())
    }

    fn load_with_env(path: &Path, get_env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let expanded = expand_env_vars(&raw, &get_env);
        let file: RawConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(file.into_config())
    }
}

/// Expands `${VAR}` references against `get_env`, leaving unresolved
/// references untouched so a typo surfaces as a YAML parse error rather than
/// silently vanishing.
fn expand_env_vars(input: &str, get_env: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    // `find`/slicing on "${" and '}' only ever cuts at those single-byte
    // ASCII markers, so every slice below lands on a char boundary; the
    // text between markers is copied with `push_str` rather than walked
    // byte-by-byte, so multi-byte UTF-8 (non-ASCII repo names, labels, …)
    // round-trips intact.
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after_marker = &rest[start + 2..];
        let Some(end) = after_marker.find('}') else {
            // Unterminated `${`: copy the rest verbatim and stop.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = &after_marker[..end];
        match get_env(name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after_marker[end + 1..];
    }
    out.push_str(rest);
    out
}

// The raw deserialization shape mirrors the documented config file exactly: every section is
// optional so a sparse file only overrides what it names.

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    provider: Option<String>,
    poll_interval: Option<u64>,
    trigger_label: Option<String>,
    log_file: Option<String>,
    repos: Option<Vec<String>>,
    claude: Option<RawClaude>,
    retry: Option<RawRetry>,
    defaults: Option<RawDefaults>,
    concurrency: Option<RawConcurrency>,
    progress: Option<RawProgress>,
    ci: Option<RawCi>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawClaude {
    command: Option<String>,
    timeout: Option<u64>,
    review_cycles: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawRetry {
    max_attempts: Option<i64>,
    backoff_base: Option<u64>,
    rate_limit_retry: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawDefaults {
    base_branch: Option<String>,
    auto_merge: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConcurrency {
    max_per_repo: Option<usize>,
    max_total: Option<usize>,
    dependency_detection: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawProgress {
    enabled: Option<bool>,
    debounce_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawCi {
    wait_for_ci: Option<bool>,
    poll_interval: Option<u64>,
    timeout: Option<u64>,
    max_fix_attempts: Option<u32>,
}

impl RawConfig {
    fn into_config(self) -> Config {
        let d = Config::default();
        let claude = self.claude.unwrap_or_default();
        let retry = self.retry.unwrap_or_default();
        let defaults = self.defaults.unwrap_or_default();
        let concurrency = self.concurrency.unwrap_or_default();
        let progress = self.progress.unwrap_or_default();
        let ci = self.ci.unwrap_or_default();

        Config {
            provider: self.provider.unwrap_or(d.provider),
            poll_interval: self.poll_interval.map(secs).unwrap_or(d.poll_interval),
            trigger_label: self.trigger_label.unwrap_or(d.trigger_label),
            log_file: self.log_file.unwrap_or(d.log_file),
            repos: self.repos.unwrap_or(d.repos),
            claude: ClaudeConfig {
                command: claude.command.unwrap_or(d.claude.command),
                timeout: claude.timeout.map(secs).unwrap_or(d.claude.timeout),
                review_cycles: claude.review_cycles.unwrap_or(d.claude.review_cycles),
            },
            retry: RetryConfig {
                max_attempts: retry.max_attempts.unwrap_or(d.retry.max_attempts),
                backoff_base: retry.backoff_base.map(secs).unwrap_or(d.retry.backoff_base),
                rate_limit_retry: retry
                    .rate_limit_retry
                    .map(secs)
                    .unwrap_or(d.retry.rate_limit_retry),
            },
            defaults: DefaultsConfig {
                base_branch: defaults.base_branch.unwrap_or(d.defaults.base_branch),
                auto_merge: defaults.auto_merge.unwrap_or(d.defaults.auto_merge),
            },
            concurrency: ConcurrencyConfig {
                max_per_repo: concurrency.max_per_repo.unwrap_or(d.concurrency.max_per_repo),
                max_total: concurrency.max_total.unwrap_or(d.concurrency.max_total),
                dependency_detection: concurrency
                    .dependency_detection
                    .as_deref()
                    .map(parse_dependency_detection)
                    .unwrap_or(d.concurrency.dependency_detection),
            },
            progress: ProgressConfig {
                enabled: progress.enabled.unwrap_or(d.progress.enabled),
                debounce_interval: progress
                    .debounce_interval
                    .map(secs)
                    .unwrap_or(d.progress.debounce_interval),
            },
            ci: CiConfig {
                wait_for_ci: ci.wait_for_ci.unwrap_or(d.ci.wait_for_ci),
                poll_interval: ci.poll_interval.map(secs).unwrap_or(d.ci.poll_interval),
                timeout: ci.timeout.map(secs).unwrap_or(d.ci.timeout),
                max_fix_attempts: ci.max_fix_attempts.unwrap_or(d.ci.max_fix_attempts),
            },
        }
    }
}

fn parse_dependency_detection(s: &str) -> DependencyDetection {
    match s {
        "manual" => DependencyDetection::Manual,
        "disabled" => DependencyDetection::Disabled,
        _ => DependencyDetection::Auto,
    }
}

/// Credentials required to talk to the provider and the agent.
///
/// Resolution:
/// - `oauth_token`: `CLAUDE_CODE_OAUTH_TOKEN` env
/// - `api_key`: `ANTHROPIC_API_KEY` env (fallback when no OAuth token)
/// - `gh_token`: `GH_TOKEN` env, falling back to `gh auth token`
#[derive(Debug)]
pub struct Credentials {
    pub oauth_token: Option<String>,
    pub api_key: Option<String>,
    pub gh_token: Option<String>,
}

impl Credentials {
    pub fn load() -> Result<Self> {
        Self::load_with_env(|k| env::var(k).ok())
    }

    fn load_with_env(get_env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let oauth_token = get_env("CLAUDE_CODE_OAUTH_TOKEN").filter(|s| !s.is_empty());
        let api_key = get_env("ANTHROPIC_API_KEY").filter(|s| !s.is_empty());
        let gh_token = Self::resolve_gh_token(&get_env);
        Ok(Self {
            oauth_token,
            api_key,
            gh_token,
        })
    }

    fn resolve_gh_token(get_env: &impl Fn(&str) -> Option<String>) -> Option<String> {
        if let Some(token) = get_env("GH_TOKEN") {
            if !token.is_empty() {
                return Some(token);
            }
        }
        let output = std::process::Command::new("gh")
            .args(["auth", "token"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    }
}
