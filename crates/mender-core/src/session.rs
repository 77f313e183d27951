use crate::job::JobState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which pipeline step a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Plan,
    Implement,
    CodeReview,
    Test,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Plan => "plan",
            Step::Implement => "implement",
            Step::CodeReview => "code_review",
            Step::Test => "test",
        }
    }

    /// The step a job in `state` is about to run, if any.
    pub fn for_state(state: JobState) -> Option<Step> {
        match state {
            JobState::Planning => Some(Step::Plan),
            JobState::Implementing => Some(Step::Implement),
            JobState::Reviewing => Some(Step::CodeReview),
            JobState::Testing => Some(Step::Test),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown session status: {other:?}")),
        }
    }
}

/// One language-model invocation: created before the provider call with
/// status `running`, finalized afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub job_id: String,
    pub step: String,
    pub iteration: i64,
    pub provider: String,
    pub status: SessionStatus,
    pub prompt: String,
    pub response: String,
    pub jsonl_path: Option<String>,
    pub commit_sha: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Per-job token totals aggregated across sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenSummary {
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub session_count: i64,
    /// Provider of the job's sessions (the most recent one when mixed).
    pub provider: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_for_state_covers_pipeline_states_only() {
        assert_eq!(Step::for_state(JobState::Planning), Some(Step::Plan));
        assert_eq!(Step::for_state(JobState::Implementing), Some(Step::Implement));
        assert_eq!(Step::for_state(JobState::Reviewing), Some(Step::CodeReview));
        assert_eq!(Step::for_state(JobState::Testing), Some(Step::Test));
        assert_eq!(Step::for_state(JobState::Queued), None);
        assert_eq!(Step::for_state(JobState::Ready), None);
        assert_eq!(Step::for_state(JobState::Approved), None);
    }
}
