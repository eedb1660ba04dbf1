//! One progress comment per issue, created once and edited thereafter,
//! carrying a running status log plus the state block.

use crate::codec;
use crate::model::IssueState;
use crate::provider::{PResult, Provider};
use crate::retry::Cancel;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

struct Inner {
    state: IssueState,
    last_update_at: Option<DateTime<Utc>>,
    last_status: Option<String>,
}

/// Debounced, idempotent progress reporter for a single issue.
///
/// Operations on one reporter are serialized by an internal mutex; distinct
/// reporters (one per issue) never contend with each other.
pub struct ProgressReporter<'p> {
    provider: &'p dyn Provider,
    repo: String,
    number: u64,
    debounce_interval: chrono::Duration,
    inner: Mutex<Inner>,
}

impl<'p> ProgressReporter<'p> {
    pub fn new(
        provider: &'p dyn Provider,
        repo: impl Into<String>,
        number: u64,
        initial_state: IssueState,
        debounce_interval: std::time::Duration,
    ) -> Self {
        Self {
            provider,
            repo: repo.into(),
            number,
            debounce_interval: chrono::Duration::from_std(debounce_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            inner: Mutex::new(Inner {
                state: initial_state,
                last_update_at: None,
                last_status: None,
            }),
        }
    }

    fn render_body(state: &IssueState) -> String {
        let mut body = format!("{}\n\n### Progress Log\n", codec::BOT_MARKER);
        for line in &state.status_history {
            body.push_str(line);
            body.push('\n');
        }
        body.push('\n');
        body.push_str(&codec::append_to_body("", state));
        body
    }

    fn push_history(state: &mut IssueState, status: &str) {
        let line = format!("{}|{}", Utc::now().format("%H:%M:%S"), status);
        state.status_history.push(line);
    }

    fn write(&self, cancel: &Cancel, inner: &mut Inner) -> PResult<()> {
        let body = Self::render_body(&inner.state);
        match &inner.state.status_comment_id {
            None => {
                let id = self
                    .provider
                    .create_comment(cancel, &self.repo, self.number, &body)?;
                inner.state.status_comment_id = Some(id);
            }
            Some(id) => {
                self.provider.update_comment(cancel, &self.repo, id, &body)?;
            }
        }
        Ok(())
    }

    /// Debounced update: a no-op if `status` is unchanged and less than
    /// `debounce_interval` has elapsed since the last update.
    pub fn update(&self, cancel: &Cancel, status: &str) -> PResult<()> {
        let mut inner = self.inner.lock().expect("progress reporter mutex poisoned");
        let now = Utc::now();
        let same_status = inner.last_status.as_deref() == Some(status);
        let within_debounce = inner
            .last_update_at
            .map(|t| now - t < self.debounce_interval)
            .unwrap_or(false);
        if same_status && within_debounce {
            return Ok(());
        }
        if !same_status {
            Self::push_history(&mut inner.state, status);
        }
        inner.last_status = Some(status.to_string());
        inner.last_update_at = Some(now);
        self.write(cancel, &mut inner)
    }

    /// Bypass the time debounce, but still collapse consecutive identical
    /// statuses into a single history line: no new line is added, but the
    /// state block is still persisted.
    pub fn force_update(&self, cancel: &Cancel, status: &str) -> PResult<()> {
        let mut inner = self.inner.lock().expect("progress reporter mutex poisoned");
        let same_status = inner.last_status.as_deref() == Some(status);
        if !same_status {
            Self::push_history(&mut inner.state, status);
        }
        inner.last_status = Some(status.to_string());
        inner.last_update_at = Some(Utc::now());
        self.write(cancel, &mut inner)
    }

    /// Always edits, regardless of debounce state.
    pub fn finalize(&self, cancel: &Cancel, status: &str) -> PResult<()> {
        let mut inner = self.inner.lock().expect("progress reporter mutex poisoned");
        Self::push_history(&mut inner.state, status);
        inner.last_status = Some(status.to_string());
        inner.last_update_at = Some(Utc::now());
        self.write(cancel, &mut inner)
    }

    /// Read the current in-memory state (a clone, since the mutex guards it).
    pub fn current_state(&self) -> IssueState {
        self.inner
            .lock()
            .expect("progress reporter mutex poisoned")
            .state
            .clone()
    }

    /// Merge in the worker's view of the state (e.g. after a phase
    /// transition mutates fields outside the status text). `status_comment_id`
    /// and `status_history` are reporter-owned — the worker's copy never
    /// round-trips them from a prior `update`/`force_update`/`finalize` call,
    /// so taking `state` wholesale would reset them and create a fresh
    /// comment on every persist. Every other field is worker-owned and
    /// overwrites the reporter's copy.
    pub fn set_state(&self, state: IssueState) {
        let mut inner = self.inner.lock().expect("progress reporter mutex poisoned");
        let status_comment_id = inner.state.status_comment_id.clone();
        let status_history = std::mem::take(&mut inner.state.status_history);
        inner.state = state;
        inner.state.status_comment_id = status_comment_id;
        inner.state.status_history = status_history;
    }
}
