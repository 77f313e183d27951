//! Built-in prompt templates, used when a project does not configure its
//! own template files. Placeholders use `{{key}}` substitution.

pub const DEFAULT_PLAN_TEMPLATE: &str = "\
You are an engineer planning a fix for the following issue.

Issue: {{title}}

{{body}}

Explore the repository in the current directory and write a concise,
numbered implementation plan: which files to change, what to change, and
how to verify the fix. Do not modify any files yet. Reply with the plan
only.";

pub const DEFAULT_IMPLEMENT_TEMPLATE: &str = "\
You are an engineer implementing a fix for the following issue.

Issue: {{title}}

{{body}}

Plan:
{{plan}}

Reviewer feedback from the previous iteration (empty on the first pass):
{{feedback}}

Apply the plan in the current directory, addressing any feedback above.
Edit files directly; keep the change minimal and focused on the issue.";

pub const DEFAULT_CODE_REVIEW_TEMPLATE: &str = "\
You are reviewing a change made for the following issue.

Issue: {{title}}

{{diff_instruction}}

Plan the change was built against:
{{plan}}

If the change correctly implements the plan and is safe to ship, reply
with exactly APPROVED on the first line. Otherwise, reply with the
specific changes required and do not use the word APPROVED anywhere in
your response.";

#[cfg(test)]
mod tests {
    use super::*;
    use mender_core::prompt::build_prompt;

    #[test]
    fn templates_substitute_cleanly() {
        for template in [
            DEFAULT_PLAN_TEMPLATE,
            DEFAULT_IMPLEMENT_TEMPLATE,
            DEFAULT_CODE_REVIEW_TEMPLATE,
        ] {
            let filled = build_prompt(
                template,
                &[
                    ("title", "t"),
                    ("body", "b"),
                    ("plan", "p"),
                    ("feedback", "f"),
                    ("diff_instruction", "d"),
                ],
            );
            assert!(!filled.contains("{{"), "unresolved placeholder in {filled}");
        }
    }
}
