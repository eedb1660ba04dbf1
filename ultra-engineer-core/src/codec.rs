//! The hidden `IssueState` block embedded in comment bodies.
//!
//! The block is delimited by sentinels and placed at the end of a comment
//! body:
//!
//! ```text
//! <!-- ultra-engineer-state
//! { ... json ... }
//! -->
//! ```
//!
//! A separate bot marker (`<!-- ultra-engineer -->`) tags every comment this
//! system authors, state block or not.

use crate::model::IssueState;
use chrono::Utc;

/// Sentinel marking any comment authored by this system.
pub const BOT_MARKER: &str = "<!-- ultra-engineer -->";

const STATE_OPEN: &str = "<!-- ultra-engineer-state";
const STATE_CLOSE: &str = "-->";

/// True iff `body` contains the bot marker or a well-formed state block.
///
/// Used by the state machine to exclude the system's own comments when
/// scanning for user input.
pub fn is_bot_comment(body: &str) -> bool {
    body.contains(BOT_MARKER) || parse(body).is_some()
}

/// Find every well-formed `(json_text, span)` state block occurrence in `body`.
///
/// A block is well-formed if its JSON object parses as an `IssueState`;
/// malformed or partial blocks (e.g. a stray "-->" with no opener) are
/// skipped rather than erroring, tolerating non-ideal input.
fn find_blocks(body: &str) -> Vec<(IssueState, std::ops::Range<usize>)> {
    let mut out = Vec::new();
    let mut search_from = 0;
    while let Some(rel_open) = body[search_from..].find(STATE_OPEN) {
        let open = search_from + rel_open;
        let json_start = open + STATE_OPEN.len();
        let Some(rel_close) = body[json_start..].find(STATE_CLOSE) else {
            break;
        };
        let close = json_start + rel_close;
        let json_text = body[json_start..close].trim();
        if let Ok(state) = serde_json::from_str::<IssueState>(json_text) {
            out.push((state, open..(close + STATE_CLOSE.len())));
        }
        search_from = close + STATE_CLOSE.len();
    }
    out
}

/// Parse the newest well-formed state block in `body`, if any.
///
/// Within a single body we take the block with the greatest `last_updated`
/// in case a comment somehow carries more than one (e.g. after a manual edit).
pub fn parse(body: &str) -> Option<IssueState> {
    find_blocks(body)
        .into_iter()
        .map(|(s, _)| s)
        .max_by_key(|s| s.last_updated)
}

/// Parse every comment body and return the state block with the greatest
/// `last_updated` across the whole stream.
///
/// This is the function callers should use on startup / resumption: the
/// newest state block, full stop, regardless of which comment it lives in
/// or that comment's `created_at`.
pub fn parse_from_comments<'a, I>(bodies: I) -> Option<IssueState>
where
    I: IntoIterator<Item = &'a str>,
{
    bodies
        .into_iter()
        .filter_map(parse)
        .max_by_key(|s| s.last_updated)
}

/// Strip every well-formed state block out of `body`, leaving surrounding text intact.
pub fn strip(body: &str) -> String {
    let mut result = String::new();
    let mut last = 0;
    for (_, span) in find_blocks(body) {
        result.push_str(&body[last..span.start]);
        last = span.end;
    }
    result.push_str(&body[last..]);
    result.trim().to_string()
}

fn render_block(state: &IssueState) -> String {
    let json = serde_json::to_string_pretty(state).expect("IssueState always serializes");
    format!("{STATE_OPEN}\n{json}\n{STATE_CLOSE}")
}

/// Strip any prior state block from `body` (idempotent) and append a freshly
/// serialized one with `last_updated = now`.
pub fn append_to_body(body: &str, state: &IssueState) -> String {
    let mut fresh = state.clone();
    fresh.last_updated = Utc::now();
    let stripped = strip(body);
    if stripped.is_empty() {
        render_block(&fresh)
    } else {
        format!("{stripped}\n\n{}", render_block(&fresh))
    }
}

/// Replace the existing state block in place if one exists, else append.
///
/// Unlike `append_to_body`, this preserves the block's position in the body
/// when one was already present — useful for the progress reporter, which
/// re-renders the whole comment anyway but wants a stable mental model.
pub fn update_body(body: &str, state: &IssueState) -> String {
    let mut fresh = state.clone();
    fresh.last_updated = Utc::now();
    if find_blocks(body).is_empty() {
        append_to_body(body, &fresh)
    } else {
        let mut result = String::new();
        let mut last = 0;
        let blocks = find_blocks(body);
        for (i, (_, span)) in blocks.iter().enumerate() {
            result.push_str(&body[last..span.start]);
            if i == blocks.len() - 1 {
                result.push_str(&render_block(&fresh));
            }
            last = span.end;
        }
        result.push_str(&body[last..]);
        result
    }
}
