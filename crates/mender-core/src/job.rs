use crate::issue::Issue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job state as a state machine.
///
/// Transitions:
///   Queued -> Planning (claim)
///   Planning -> Implementing -> Reviewing -> Testing -> Ready
///   Reviewing -> Implementing (changes requested, within budget)
///   Testing -> Implementing (tests failed, within budget)
///   Ready -> Approved | Rejected (human)
///   Approved -> Rebasing | AwaitingChecks (PR lifecycle)
///   Rebasing -> ResolvingConflicts | AwaitingChecks
///   ResolvingConflicts -> AwaitingChecks | Failed
///   AwaitingChecks -> Approved | Failed
///   any non-terminal -> Cancelled | Failed
///   Failed | Rejected -> Queued (retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Planning,
    Implementing,
    Reviewing,
    Testing,
    Ready,
    Rebasing,
    ResolvingConflicts,
    AwaitingChecks,
    Approved,
    Rejected,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 13] = [
        JobState::Queued,
        JobState::Planning,
        JobState::Implementing,
        JobState::Reviewing,
        JobState::Testing,
        JobState::Ready,
        JobState::Rebasing,
        JobState::ResolvingConflicts,
        JobState::AwaitingChecks,
        JobState::Approved,
        JobState::Rejected,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Planning => "planning",
            JobState::Implementing => "implementing",
            JobState::Reviewing => "reviewing",
            JobState::Testing => "testing",
            JobState::Ready => "ready",
            JobState::Rebasing => "rebasing",
            JobState::ResolvingConflicts => "resolving_conflicts",
            JobState::AwaitingChecks => "awaiting_checks",
            JobState::Approved => "approved",
            JobState::Rejected => "rejected",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Approved | JobState::Rejected | JobState::Failed | JobState::Cancelled
        )
    }

    /// In-flight states: everything a worker or the PR lifecycle is actively
    /// driving. Excludes `queued` (waiting for a worker) and `ready`
    /// (waiting for a human).
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            JobState::Planning
                | JobState::Implementing
                | JobState::Reviewing
                | JobState::Testing
                | JobState::Rebasing
                | JobState::ResolvingConflicts
                | JobState::AwaitingChecks
        )
    }

    /// States swept back to `queued` by startup recovery. `ready` jobs are
    /// awaiting a human and keep their state across restarts.
    pub fn is_recoverable(&self) -> bool {
        self.is_in_flight()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown job state: {s:?}"))
    }
}

/// Whether `from -> to` is a legal edge in the job state graph.
///
/// `Queued -> Planning` is reserved for the atomic claim; every other edge
/// here is driven by the pipeline runner, the PR lifecycle, or a human.
pub fn is_legal_transition(from: JobState, to: JobState) -> bool {
    use JobState::*;

    // Retry and PR-lifecycle edges out of otherwise-terminal states.
    if from.is_terminal() {
        return matches!(
            (from, to),
            (Failed, Queued) | (Rejected, Queued) | (Approved, Rebasing) | (Approved, AwaitingChecks)
        );
    }

    // Any non-terminal state can be cancelled or failed.
    if matches!(to, Cancelled | Failed) {
        return true;
    }

    matches!(
        (from, to),
        (Queued, Planning)
            | (Planning, Implementing)
            | (Implementing, Reviewing)
            // Budget exhaustion punts a re-queued implement step to a human.
            | (Implementing, Ready)
            | (Reviewing, Testing)
            | (Reviewing, Implementing)
            | (Testing, Ready)
            | (Testing, Implementing)
            | (Ready, Approved)
            | (Ready, Rejected)
            | (Rebasing, ResolvingConflicts)
            | (Rebasing, AwaitingChecks)
            | (ResolvingConflicts, AwaitingChecks)
            | (AwaitingChecks, Approved)
    )
}

/// One pipeline run for one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub issue_id: String,
    pub project_name: String,
    pub state: JobState,
    pub iteration: i64,
    pub max_iterations: i64,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
    pub reject_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub pr_merged_at: Option<String>,
    pub pr_closed_at: Option<String>,
    /// Joined from the issue row for display.
    #[serde(default)]
    pub issue_title: String,
    #[serde(default)]
    pub issue_source: String,
    #[serde(default)]
    pub source_issue_id: String,
}

/// Render the state for humans: an `approved` job whose PR has since merged
/// or closed reads as such instead of the raw state.
pub fn display_state(
    state: JobState,
    pr_merged_at: Option<&str>,
    pr_closed_at: Option<&str>,
) -> &'static str {
    if state == JobState::Approved {
        if pr_merged_at.is_some_and(|t| !t.is_empty()) {
            return "merged";
        }
        if pr_closed_at.is_some_and(|t| !t.is_empty()) {
            return "closed";
        }
    }
    state.as_str()
}

/// Short display form of an opaque id.
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Truncate to at most `n` characters; an ellipsis is applied only when
/// there is room for one (n > 3).
pub fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        return s.to_string();
    }
    if n <= 3 {
        return s.chars().take(n).collect();
    }
    let mut out: String = s.chars().take(n - 3).collect();
    out.push_str("...");
    out
}

const MAX_BRANCH_LEN: usize = 60;

/// Branch name for a job, e.g. `autopr/github-42-fix-login-timeout`.
///
/// Falls back to the short job id when the issue title slugs to nothing.
pub fn build_branch_name(issue: &Issue, job_id: &str) -> String {
    let mut prefix = String::from("autopr/");
    if !issue.source_issue_id.is_empty() {
        prefix.push_str(issue.source.as_str());
        prefix.push('-');
        prefix.push_str(&issue.source_issue_id);
        prefix.push('-');
    }

    let slug = slugify(&issue.title);
    if slug.is_empty() {
        return format!("autopr/{}", short_id(job_id));
    }

    let mut name = prefix + &slug;
    if name.len() > MAX_BRANCH_LEN {
        name.truncate(MAX_BRANCH_LEN);
        while name.ends_with('-') {
            name.pop();
        }
    }
    name
}

/// Convert a string to a git-branch-safe slug: lowercase alphanumerics with
/// single hyphens, no leading or trailing hyphen.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_dash = false;
    for c in s.to_lowercase().chars() {
        match c {
            'a'..='z' | '0'..='9' => {
                out.push(c);
                prev_dash = false;
            }
            ' ' | '-' | '_' | '/' | '.' => {
                if !prev_dash && !out.is_empty() {
                    out.push('-');
                    prev_dash = true;
                }
            }
            _ => {}
        }
    }
    out.trim_end_matches('-').to_string()
}
