//! Prompt templates for each phase handler. Kept in one place, alongside
//! its consumer, with a dedicated function per phase rather than one
//! `build_prompt`.

pub fn analyze_prompt(
    title: &str,
    body: &str,
    dotfile_dir: &str,
    questions_file: &str,
    plan_file: &str,
) -> String {
    let mut prompt = format!(
        "You are working on the repository at the current directory.\n\nIssue:\n{title}\n"
    );
    if !body.is_empty() {
        prompt.push_str(body);
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\nInstructions:\n\
         - Create the directory `{dotfile_dir}` if it does not exist\n\
         - Write any clarifying questions you need answered to `{dotfile_dir}/{questions_file}`\n\
         - If you have no questions, write exactly `NO_QUESTIONS_NEEDED` to that file\n\
         - Write your implementation plan to `{dotfile_dir}/{plan_file}`\n\
         - Do not write any other files and do not commit\n"
    ));
    prompt
}

pub fn review_plan_prompt(plan: &str, iteration: u32, total: u32) -> String {
    format!(
        "Review pass {iteration}/{total} of the implementation plan below. \
         Point out gaps, risks, or missing edge cases; propose concrete revisions.\n\n{plan}\n"
    )
}

pub fn integrate_feedback_prompt(feedback: &str) -> String {
    format!(
        "The plan received this feedback:\n{feedback}\n\n\
         Revise `.ultra-engineer/plan.md` accordingly. \
         Conclude your response with exactly one of `SIGNIFICANT_CHANGES` (the plan's \
         approach changed) or `MINOR_CHANGES` (only wording or small details changed).\n"
    )
}

pub fn implement_prompt(title: &str, number: u64, base_branch: &str) -> String {
    format!(
        "Implement the plan in `.ultra-engineer/plan.md` for issue #{number}: {title}\n\n\
         Instructions:\n\
         - Create a new branch with a descriptive name based on the issue\n\
         - Commit after each logical unit of work\n\
         - Rebase onto `{base_branch}` before pushing\n\
         - Push the branch when done\n\
         - If rebasing leaves unresolved conflicts, do not force past them; instead emit a \
           line of the exact form `MERGE_CONFLICT_UNRESOLVED: <file>, <file>, ...` listing \
           every conflicted file, and stop\n\
         - Otherwise, once pushed, emit a line of the exact form \
           `IMPLEMENTATION_COMPLETE <branch-name>`\n"
    )
}

pub fn review_code_prompt(iteration: u32, total: u32) -> String {
    format!(
        "Code review pass {iteration}/{total}. Review the changes on the current branch \
         against the plan in `.ultra-engineer/plan.md`. Fix anything that doesn't meet the \
         plan's intent, commit, and push.\n"
    )
}

pub fn fix_ci_prompt(check_name: &str, logs: &str, branch: &str) -> String {
    format!(
        "The CI check `{check_name}` is failing on branch `{branch}`. Logs:\n\n{logs}\n\n\
         Fix the failure, commit, and push to `{branch}`.\n"
    )
}

pub fn address_feedback_prompt(feedback: &str, branch: &str) -> String {
    format!(
        "The pull request received this reviewer feedback:\n{feedback}\n\n\
         Address it on branch `{branch}`, commit, and push.\n"
    )
}

/// Re-exported for external callers that only need the `analyze` wording
/// without the dotfile plumbing.
pub fn build_prompt(title: &str, body: &str) -> String {
    analyze_prompt(title, body, ".ultra-engineer", "questions.md", "plan.md")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_prompt_includes_title_and_body() {
        let prompt = analyze_prompt("Fix bug", "Some details", ".x", "q.md", "p.md");
        assert!(prompt.contains("Fix bug"));
        assert!(prompt.contains("Some details"));
        assert!(prompt.contains(".x/q.md"));
        assert!(prompt.contains(".x/p.md"));
    }

    #[test]
    fn implement_prompt_names_markers() {
        let prompt = implement_prompt("Add login", 42, "main");
        assert!(prompt.contains("#42"));
        assert!(prompt.contains("IMPLEMENTATION_COMPLETE"));
        assert!(prompt.contains("MERGE_CONFLICT_UNRESOLVED"));
        assert!(prompt.contains("main"));
    }
}
