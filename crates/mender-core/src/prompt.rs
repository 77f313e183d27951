use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Maximum length of issue body included in prompts.
pub const MAX_PROMPT_LEN: usize = 50_000;

const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Read a prompt template from disk. Returns None when the path is empty or
/// the file is missing, which means the built-in template applies.
pub fn load_template(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    std::fs::read_to_string(Path::new(path))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Prepare issue text for inclusion in a prompt: strip HTML tags, trim, and
/// truncate to `MAX_PROMPT_LEN` with a trailing marker.
pub fn sanitize_issue_content(s: &str) -> String {
    let stripped = strip_html(s);
    let trimmed = stripped.trim();
    if trimmed.len() <= MAX_PROMPT_LEN {
        return trimmed.to_string();
    }
    let mut cut = MAX_PROMPT_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &trimmed[..cut])
}

fn html_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").unwrap())
}

fn strip_html(s: &str) -> String {
    html_tag_re().replace_all(s, "").into_owned()
}

/// Substitute `{{key}}` placeholders in a template.
pub fn build_prompt(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{{{key}}}}}"), value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_html_tags() {
        let input = "Steps:<br><ul><li>one</li><li>two</li></ul>";
        let out = sanitize_issue_content(input);
        assert_eq!(out, "Steps:onetwo");
    }

    #[test]
    fn truncates_long_bodies_with_marker() {
        let input = "x".repeat(MAX_PROMPT_LEN + 500);
        let out = sanitize_issue_content(&input);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.len(), MAX_PROMPT_LEN + TRUNCATION_MARKER.len());
    }

    #[test]
    fn short_bodies_pass_through_trimmed() {
        assert_eq!(sanitize_issue_content("  hello\n"), "hello");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut input = "a".repeat(MAX_PROMPT_LEN - 1);
        input.push_str("héllo wörld");
        let out = sanitize_issue_content(&input);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn template_substitution() {
        let out = build_prompt(
            "Fix {{title}}.\n\n{{body}}",
            &[("title", "login timeout"), ("body", "it hangs")],
        );
        assert_eq!(out, "Fix login timeout.\n\nit hangs");
    }

    #[test]
    fn unknown_placeholders_left_alone() {
        let out = build_prompt("{{title}} {{missing}}", &[("title", "x")]);
        assert_eq!(out, "x {{missing}}");
    }

    #[test]
    fn load_template_empty_path() {
        assert_eq!(load_template(""), None);
        assert_eq!(load_template("/nonexistent/path/tmpl.md"), None);
    }
}
