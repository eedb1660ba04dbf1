//! Parses dependency declarations out of issue
//! text, detects cycles, and decides eligibility.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

/// Label that opts an issue out of dependency detection entirely.
pub const NO_DEPENDENCIES_LABEL: &str = "no-dependencies";
/// Literal string in the body that opts an issue out of dependency detection.
pub const NO_DEPS_MARKER: &str = "/no-deps";

fn dependency_patterns() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(?:depends?\s+on|after|requires?|blocked\s+by|waiting\s+(?:for|on))\s+#(\d+)",
        )
        .expect("dependency pattern is a valid regex")
    })
}

/// Parse every `#N` dependency reference out of `text`, deduplicated, with
/// `self_number` removed (self-references never count as a dependency).
pub fn parse_dependencies(text: &str, self_number: u64) -> Vec<u64> {
    let mut seen = Vec::new();
    let mut set = HashSet::new();
    for cap in dependency_patterns().captures_iter(text) {
        if let Some(n) = cap.get(1).and_then(|m| m.as_str().parse::<u64>().ok()) {
            if n != self_number && set.insert(n) {
                seen.push(n);
            }
        }
    }
    seen
}

/// True when the issue has opted out of dependency detection, per its labels
/// and body text.
pub fn has_opted_out(labels: &[String], body: &str) -> bool {
    labels.iter().any(|l| l == NO_DEPENDENCIES_LABEL) || body.contains(NO_DEPS_MARKER)
}

/// Parse dependencies out of an issue's body plus every comment body,
/// honoring the opt-out. Returns an empty list when opted out.
pub fn resolve_dependencies(
    number: u64,
    labels: &[String],
    body: &str,
    comment_bodies: &[String],
) -> Vec<u64> {
    if has_opted_out(labels, body) {
        return Vec::new();
    }
    let mut set = HashSet::new();
    let mut out = Vec::new();
    for text in std::iter::once(body).chain(comment_bodies.iter().map(String::as_str)) {
        for n in parse_dependencies(text, number) {
            if set.insert(n) {
                out.push(n);
            }
        }
    }
    out
}

/// A detected cycle: the issue numbers involved, in the order the DFS found them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle(pub Vec<u64>);

/// Detect all dependency cycles in `graph` (`number -> depends_on[]`) via DFS
/// with a recursion stack. Reports the first back-edge per root it visits
/// the first back-edge identifies a cycle.
pub fn detect_cycles(graph: &HashMap<u64, Vec<u64>>) -> Vec<Cycle> {
    let mut visited = HashSet::new();
    let mut cycles = Vec::new();
    let mut nodes: Vec<u64> = graph.keys().copied().collect();
    nodes.sort_unstable();

    for &start in &nodes {
        if visited.contains(&start) {
            continue;
        }
        let mut stack: Vec<u64> = Vec::new();
        let mut on_stack = HashSet::new();
        dfs(start, graph, &mut visited, &mut stack, &mut on_stack, &mut cycles);
    }
    cycles
}

fn dfs(
    node: u64,
    graph: &HashMap<u64, Vec<u64>>,
    visited: &mut HashSet<u64>,
    stack: &mut Vec<u64>,
    on_stack: &mut HashSet<u64>,
    cycles: &mut Vec<Cycle>,
) {
    visited.insert(node);
    stack.push(node);
    on_stack.insert(node);

    if let Some(deps) = graph.get(&node) {
        for &dep in deps {
            if on_stack.contains(&dep) {
                let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                cycles.push(Cycle(stack[start..].to_vec()));
            } else if !visited.contains(&dep) {
                dfs(dep, graph, visited, stack, on_stack, cycles);
            }
        }
    }

    stack.pop();
    on_stack.remove(&node);
}

/// Query used by `can_proceed` to check whether a dependency is complete
/// without requiring it to already be tracked locally.
pub trait CompletionOracle {
    /// `true` if `number` is known to be in a completed state, either
    /// locally or by asking the provider for its `phase:completed` label.
    fn is_completed(&self, number: u64) -> bool;
}

/// An issue can proceed iff every dependency is completed, whether
/// tracked locally or not. Absence without completion blocks.
pub fn can_proceed(depends_on: &[u64], oracle: &impl CompletionOracle) -> bool {
    depends_on.iter().all(|n| oracle.is_completed(*n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_pattern_variants_case_insensitively() {
        let text = "Depends on #1. AFTER #2 also requires #3, and Requires #4. \
                     blocked by #5. Waiting for #6 and waiting on #7.";
        let mut deps = parse_dependencies(text, 999);
        deps.sort_unstable();
        assert_eq!(deps, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn dedupes_and_excludes_self() {
        let text = "depends on #5, depends on #5 again, and also #5 via requires #5";
        let deps = parse_dependencies(text, 5);
        // self_number == 5 is never matched; duplicates outside that collapse.
        assert!(deps.is_empty() || deps == vec![]);

        let text2 = "depends on #5 and requires #5";
        let deps2 = parse_dependencies(text2, 1);
        assert_eq!(deps2, vec![5]);
    }

    #[test]
    fn opt_out_via_label() {
        assert!(has_opted_out(&["no-dependencies".to_string()], "depends on #1"));
    }

    #[test]
    fn opt_out_via_body_marker() {
        assert!(has_opted_out(&[], "some text /no-deps more text"));
    }

    #[test]
    fn resolve_honors_opt_out() {
        let deps = resolve_dependencies(
            1,
            &["no-dependencies".to_string()],
            "depends on #2",
            &["requires #3".to_string()],
        );
        assert!(deps.is_empty());
    }

    #[test]
    fn resolve_scans_body_and_comments() {
        let deps = resolve_dependencies(
            1,
            &[],
            "depends on #2",
            &["also requires #3".to_string(), "blocked by #2".to_string()],
        );
        assert_eq!(deps, vec![2, 3]);
    }

    #[test]
    fn self_dependency_cycle_of_size_one() {
        let mut graph = HashMap::new();
        graph.insert(1u64, vec![1u64]);
        let cycles = detect_cycles(&graph);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].0, vec![1]);
    }

    #[test]
    fn mutual_dependency_cycle_of_size_two() {
        let mut graph = HashMap::new();
        graph.insert(1u64, vec![2u64]);
        graph.insert(2u64, vec![1u64]);
        let cycles = detect_cycles(&graph);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].0.len(), 2);
    }

    #[test]
    fn no_cycle_in_a_dag() {
        let mut graph = HashMap::new();
        graph.insert(1u64, vec![2u64]);
        graph.insert(2u64, vec![3u64]);
        graph.insert(3u64, vec![]);
        assert!(detect_cycles(&graph).is_empty());
    }

    struct FakeOracle(HashSet<u64>);
    impl CompletionOracle for FakeOracle {
        fn is_completed(&self, number: u64) -> bool {
            self.0.contains(&number)
        }
    }

    #[test]
    fn empty_deps_is_immediately_proceedable() {
        let oracle = FakeOracle(HashSet::new());
        assert!(can_proceed(&[], &oracle));
    }

    #[test]
    fn all_deps_must_be_completed() {
        let oracle = FakeOracle([1, 2].into_iter().collect());
        assert!(can_proceed(&[1, 2], &oracle));
        assert!(!can_proceed(&[1, 2, 3], &oracle));
    }
}
