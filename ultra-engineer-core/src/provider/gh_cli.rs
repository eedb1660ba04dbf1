//! `gh` CLI adapter — concrete `Provider` implementation over GitHub.
//!
//! Shells out to the `gh` CLI for every operation: no GitHub API crate to
//! vendor or keep current, and it inherits the caller's existing `gh auth
//! login` session for free.

use super::{CiCheck, CiOverall, CiStatus, Mergeable, PResult, Provider, ProviderError, PullRequest};
use crate::model::{Comment, Issue};
use crate::retry::Cancel;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Stdio};

pub struct GhCliProvider;

impl GhCliProvider {
    pub fn new() -> Self {
        Self
    }

    fn run(args: &[&str]) -> PResult<String> {
        let out = Command::new("gh")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                ProviderError::new(format!("failed to spawn gh: {e}")).transient()
            })?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let code = out.status.code().unwrap_or(-1);
            let transient = stderr.to_lowercase().contains("timeout")
                || stderr.to_lowercase().contains("connection");
            let mut err = ProviderError::new(format!("gh {} failed ({code}): {stderr}", args.join(" ")));
            if transient {
                err = err.transient();
            }
            Err(err)
        }
    }

    fn parse_timestamp(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }
}

impl Default for GhCliProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_bucket(bucket: &str) -> String {
    match bucket {
        "fail" => "failure".to_string(),
        "cancel" => "cancelled".to_string(),
        other => other.to_string(),
    }
}

fn comment_from_json(v: &Value) -> Comment {
    Comment {
        id: v["id"]
            .as_str()
            .or_else(|| v["id"].as_u64().map(|_| "0"))
            .unwrap_or("")
            .to_string(),
        body: v["body"].as_str().unwrap_or("").to_string(),
        author: v["author"]["login"]
            .as_str()
            .or_else(|| v["user"]["login"].as_str())
            .unwrap_or("")
            .to_string(),
        created_at: v["createdAt"]
            .as_str()
            .or_else(|| v["created_at"].as_str())
            .map(GhCliProvider::parse_timestamp)
            .unwrap_or_else(Utc::now),
    }
}

impl Provider for GhCliProvider {
    fn get_issue(&self, _cancel: &Cancel, repo: &str, number: u64) -> PResult<Issue> {
        let n = number.to_string();
        let out = Self::run(&[
            "issue", "view", &n, "--repo", repo, "--json",
            "number,title,body,labels,author,createdAt,updatedAt",
        ])?;
        let v: Value = serde_json::from_str(&out)
            .map_err(|e| ProviderError::new(format!("bad issue json: {e}")))?;
        Ok(Issue {
            repo: repo.to_string(),
            number,
            title: v["title"].as_str().unwrap_or("").to_string(),
            body: v["body"].as_str().unwrap_or("").to_string(),
            labels: v["labels"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|l| l["name"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            author: v["author"]["login"].as_str().unwrap_or("").to_string(),
            created_at: v["createdAt"]
                .as_str()
                .map(Self::parse_timestamp)
                .unwrap_or_else(Utc::now),
            updated_at: v["updatedAt"]
                .as_str()
                .map(Self::parse_timestamp)
                .unwrap_or_else(Utc::now),
        })
    }

    fn list_issues_with_label(&self, _cancel: &Cancel, repo: &str, label: &str) -> PResult<Vec<u64>> {
        let out = Self::run(&[
            "issue", "list", "--repo", repo, "--state", "open", "--label", label,
            "--json", "number", "-q", ".[].number",
        ])?;
        let mut nums: Vec<u64> = out
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect();
        nums.sort_unstable();
        Ok(nums)
    }

    fn get_comments(&self, _cancel: &Cancel, repo: &str, number: u64) -> PResult<Vec<Comment>> {
        let n = number.to_string();
        let out = Self::run(&[
            "issue", "view", &n, "--repo", repo, "--json", "comments", "-q", ".comments",
        ])?;
        let v: Value = serde_json::from_str(&out).unwrap_or(Value::Array(vec![]));
        Ok(v.as_array()
            .map(|a| a.iter().map(comment_from_json).collect())
            .unwrap_or_default())
    }

    fn create_comment(&self, _cancel: &Cancel, repo: &str, number: u64, body: &str) -> PResult<String> {
        let n = number.to_string();
        let url = Self::run(&[
            "issue", "comment", &n, "--repo", repo, "--body", body,
        ])?;
        // gh prints the comment URL; the trailing path segment after '#' or
        // the last path component is the best opaque id we can recover.
        Ok(url.rsplit('-').next().unwrap_or(&url).to_string())
    }

    fn update_comment(&self, _cancel: &Cancel, repo: &str, comment_id: &str, body: &str) -> PResult<()> {
        Self::run(&[
            "api", "-X", "PATCH",
            &format!("repos/{repo}/issues/comments/{comment_id}"),
            "-f", &format!("body={body}"),
        ])?;
        Ok(())
    }

    fn update_issue_body(&self, _cancel: &Cancel, repo: &str, number: u64, body: &str) -> PResult<()> {
        let n = number.to_string();
        Self::run(&["issue", "edit", &n, "--repo", repo, "--body", body])?;
        Ok(())
    }

    fn react_to_comment(&self, _cancel: &Cancel, repo: &str, comment_id: &str, reaction: &str) -> PResult<()> {
        // Best-effort: swallow failures.
        let _ = Self::run(&[
            "api",
            &format!("repos/{repo}/issues/comments/{comment_id}/reactions"),
            "-f",
            &format!("content={reaction}"),
        ]);
        Ok(())
    }

    fn add_label(&self, _cancel: &Cancel, repo: &str, number: u64, label: &str) -> PResult<()> {
        let n = number.to_string();
        // Idempotent: gh errors if the label is already present, swallow it.
        let _ = Self::run(&["issue", "edit", &n, "--repo", repo, "--add-label", label]);
        Ok(())
    }

    fn remove_label(&self, _cancel: &Cancel, repo: &str, number: u64, label: &str) -> PResult<()> {
        let n = number.to_string();
        let _ = Self::run(&["issue", "edit", &n, "--repo", repo, "--remove-label", label]);
        Ok(())
    }

    fn create_pr(
        &self,
        _cancel: &Cancel,
        repo: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> PResult<PullRequest> {
        let out = Self::run(&[
            "pr", "create", "--repo", repo, "--head", branch, "--base", base,
            "--title", title, "--body", body,
        ])?;
        let number = out
            .rsplit('/')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(PullRequest {
            number,
            url: out,
            branch: branch.to_string(),
            mergeable: Mergeable::Unknown,
            is_draft: false,
        })
    }

    fn get_pr(&self, _cancel: &Cancel, repo: &str, number: u64) -> PResult<PullRequest> {
        let n = number.to_string();
        let out = Self::run(&[
            "pr", "view", &n, "--repo", repo, "--json",
            "number,url,headRefName,mergeable,isDraft",
        ])?;
        let v: Value = serde_json::from_str(&out)
            .map_err(|e| ProviderError::new(format!("bad pr json: {e}")))?;
        let mergeable = match v["mergeable"].as_str() {
            Some("MERGEABLE") => Mergeable::Mergeable,
            Some("CONFLICTING") => Mergeable::Conflicting,
            _ => Mergeable::Unknown,
        };
        Ok(PullRequest {
            number,
            url: v["url"].as_str().unwrap_or("").to_string(),
            branch: v["headRefName"].as_str().unwrap_or("").to_string(),
            mergeable,
            is_draft: v["isDraft"].as_bool().unwrap_or(false),
        })
    }

    fn get_pr_comments(&self, _cancel: &Cancel, repo: &str, number: u64) -> PResult<Vec<Comment>> {
        let n = number.to_string();
        let out = Self::run(&[
            "pr", "view", &n, "--repo", repo, "--json", "comments", "-q", ".comments",
        ])?;
        let v: Value = serde_json::from_str(&out).unwrap_or(Value::Array(vec![]));
        Ok(v.as_array()
            .map(|a| a.iter().map(comment_from_json).collect())
            .unwrap_or_default())
    }

    fn get_pr_review_comments(&self, _cancel: &Cancel, repo: &str, number: u64) -> PResult<Vec<Comment>> {
        let out = Self::run(&[
            "api",
            &format!("repos/{repo}/pulls/{number}/comments"),
            "--paginate",
        ])?;
        let v: Value = serde_json::from_str(&out).unwrap_or(Value::Array(vec![]));
        Ok(v.as_array()
            .map(|a| a.iter().map(comment_from_json).collect())
            .unwrap_or_default())
    }

    fn is_mergeable(&self, cancel: &Cancel, repo: &str, number: u64) -> PResult<bool> {
        Ok(matches!(
            self.get_pr(cancel, repo, number)?.mergeable,
            Mergeable::Mergeable
        ))
    }

    fn merge_pr(&self, _cancel: &Cancel, repo: &str, number: u64) -> PResult<()> {
        let n = number.to_string();
        match Self::run(&[
            "pr", "merge", &n, "--repo", repo, "--squash", "--delete-branch",
        ]) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.message.to_lowercase().contains("not mergeable")
                    || e.message.to_lowercase().contains("protected branch")
                    || e.message.to_lowercase().contains("review required")
                {
                    Err(ProviderError::merge_not_allowed(e.message))
                } else {
                    Err(e)
                }
            }
        }
    }

    fn clone_repo(&self, _cancel: &Cancel, repo: &str, dest: &Path) -> PResult<()> {
        let status = Command::new("git")
            .args([
                "clone",
                &format!("https://github.com/{repo}.git"),
                &dest.to_string_lossy(),
            ])
            .status()
            .map_err(|e| ProviderError::new(format!("failed to spawn git: {e}")).transient())?;
        if status.success() {
            Ok(())
        } else {
            Err(ProviderError::new(format!("git clone of {repo} failed")).transient())
        }
    }

    fn get_default_branch(&self, _cancel: &Cancel, repo: &str) -> PResult<String> {
        Self::run(&["repo", "view", repo, "--json", "defaultBranchRef", "-q", ".defaultBranchRef.name"])
    }

    fn is_collaborator(&self, _cancel: &Cancel, repo: &str, user: &str) -> PResult<bool> {
        match Self::run(&["api", &format!("repos/{repo}/collaborators/{user}")]) {
            Ok(_) => Ok(true),
            Err(e) if e.status == Some(404) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_ci_status(&self, _cancel: &Cancel, repo: &str, pr: u64) -> PResult<CiStatus> {
        let n = pr.to_string();
        let out = Self::run(&[
            "pr", "checks", &n, "--repo", repo, "--json",
            "name,state,bucket,link,description",
        ]);
        let out = match out {
            Ok(o) => o,
            Err(_) => {
                return Ok(CiStatus {
                    overall: CiOverall::Unknown,
                    checks: vec![],
                })
            }
        };
        let v: Value = serde_json::from_str(&out).unwrap_or(Value::Array(vec![]));
        let checks: Vec<CiCheck> = v
            .as_array()
            .map(|a| {
                a.iter()
                    .map(|c| CiCheck {
                        id: c["name"].as_str().unwrap_or("").to_string(),
                        name: c["name"].as_str().unwrap_or("").to_string(),
                        status: c["state"].as_str().unwrap_or("").to_string(),
                        // gh's own `bucket` vocabulary ("pass"/"fail"/"pending"/
                        // "skipping"/"cancel") is normalized to the
                        // provider-agnostic conclusion strings `ci::failed_checks`
                        // and the state machine branch on.
                        conclusion: c["bucket"].as_str().map(normalize_bucket),
                        details_url: c["link"].as_str().map(str::to_string),
                        output: c["description"].as_str().map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if checks.is_empty() {
            return Ok(CiStatus {
                overall: CiOverall::Unknown,
                checks,
            });
        }
        let overall = if checks.iter().any(|c| c.conclusion.as_deref() == Some("failure")) {
            CiOverall::Failure
        } else if checks
            .iter()
            .any(|c| matches!(c.status.as_str(), "PENDING" | "IN_PROGRESS" | "QUEUED"))
        {
            CiOverall::Pending
        } else {
            CiOverall::Success
        };
        Ok(CiStatus { overall, checks })
    }

    fn get_ci_logs(&self, _cancel: &Cancel, repo: &str, check_id: &str) -> PResult<String> {
        Self::run(&["run", "view", check_id, "--repo", repo, "--log"])
    }
}
