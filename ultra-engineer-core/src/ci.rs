//! Polls CI status and assembles failure logs for the
//! phase runtime's fix-CI loop.

use crate::provider::{CiCheck, CiOverall, CiStatus, PResult, Provider};
use crate::retry::Cancel;
use std::time::{Duration, Instant};

/// Outcome of a `wait_for_ci` poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Success,
    Failure,
    TimedOut,
}

/// Concatenates per-check logs for every failed check, falling back to the
/// check's embedded output or details URL when logs aren't fetchable.
pub fn failure_logs(
    provider: &dyn Provider,
    cancel: &Cancel,
    repo: &str,
    failed_checks: &[CiCheck],
) -> String {
    let mut out = String::new();
    for check in failed_checks {
        out.push_str(&format!("### {}\n", check.name));
        match provider.get_ci_logs(cancel, repo, &check.id) {
            Ok(logs) if !logs.trim().is_empty() => {
                out.push_str(&logs);
            }
            _ => {
                if let Some(output) = &check.output {
                    out.push_str(output);
                } else if let Some(url) = &check.details_url {
                    out.push_str(&format!("(logs unavailable; see {url})"));
                } else {
                    out.push_str("(logs unavailable)");
                }
            }
        }
        out.push('\n');
    }
    out
}

/// Polls CI on a fixed interval until success, failure, or `deadline` elapses.
///
/// Checks immediately on first call. A provider with no CI configured
/// returns `CiOverall::Unknown`, treated as success. Transient
/// provider errors are retried without counting against the deadline, as
/// long as they resolve before it elapses.
pub fn wait_for_ci(
    provider: &dyn Provider,
    cancel: &Cancel,
    repo: &str,
    pr: u64,
    poll_interval: Duration,
    deadline: Duration,
) -> PResult<WaitOutcome> {
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(crate::provider::ProviderError::new("operation cancelled"));
        }
        match provider.get_ci_status(cancel, repo, pr) {
            Ok(status) => match status.overall {
                CiOverall::Success | CiOverall::Unknown => return Ok(WaitOutcome::Success),
                CiOverall::Failure => return Ok(WaitOutcome::Failure),
                CiOverall::Pending => {}
            },
            Err(e) if e.classify() == crate::retry::ErrorKind::Permanent => return Err(e),
            Err(_) => {}
        }
        if start.elapsed() >= deadline {
            return Ok(WaitOutcome::TimedOut);
        }
        if !cancel.sleep(poll_interval.min(deadline.saturating_sub(start.elapsed()))) {
            return Err(crate::provider::ProviderError::new("operation cancelled"));
        }
    }
}

/// Partitions a `CiStatus`'s checks into the failed subset, for callers
/// that already have the status and just want the logs.
pub fn failed_checks(status: &CiStatus) -> Vec<CiCheck> {
    status
        .checks
        .iter()
        .filter(|c| c.conclusion.as_deref() == Some("failure"))
        .cloned()
        .collect()
}
