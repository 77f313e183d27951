use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Marker substrings identifying content this daemon authored itself.
/// Issues carrying one of these are skipped during ingest so that PRs and
/// follow-up tickets we open never feed back into the pipeline.
pub const SELF_ID_MARKER: &str = "mender-id:";
pub const SENTRY_ISSUE_MARKER: &str = "mender-sentry-issue:";

pub fn contains_marker(body: &str) -> bool {
    body.contains(SELF_ID_MARKER) || body.contains(SENTRY_ISSUE_MARKER)
}

/// Which tracker an issue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Gitlab,
    Github,
    Sentry,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Gitlab => "gitlab",
            Source::Github => "github",
            Source::Sentry => "sentry",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gitlab" => Ok(Source::Gitlab),
            "github" => Ok(Source::Github),
            "sentry" => Ok(Source::Sentry),
            other => Err(anyhow::anyhow!("unknown issue source: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueState::Open => "open",
            IssueState::Closed => "closed",
        }
    }
}

impl FromStr for IssueState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(IssueState::Open),
            "closed" => Ok(IssueState::Closed),
            other => Err(anyhow::anyhow!("unknown issue state: {other:?}")),
        }
    }
}

/// The canonical record of an external ticket. Never deleted; refreshed on
/// every sync pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub project_name: String,
    pub source: Source,
    pub source_issue_id: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub state: IssueState,
    pub labels: Vec<String>,
    pub source_meta: serde_json::Value,
    pub source_updated_at: String,
    pub synced_at: String,
}

/// Input to `upsert_issue`. Uniqueness is the
/// (project_name, source, source_issue_id) triple; the canonical id is
/// assigned on first insert and stable from then on.
#[derive(Debug, Clone)]
pub struct IssueUpsert {
    pub project_name: String,
    pub source: Source,
    pub source_issue_id: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub state: IssueState,
    pub labels: Vec<String>,
    pub source_meta: Option<serde_json::Value>,
    pub source_updated_at: String,
}

impl IssueUpsert {
    pub fn new(project_name: &str, source: Source, source_issue_id: &str) -> Self {
        Self {
            project_name: project_name.into(),
            source,
            source_issue_id: source_issue_id.into(),
            title: String::new(),
            body: String::new(),
            url: String::new(),
            state: IssueState::Open,
            labels: Vec::new(),
            source_meta: None,
            source_updated_at: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_roundtrip() {
        for source in [Source::Gitlab, Source::Github, Source::Sentry] {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert!("jira".parse::<Source>().is_err());
    }

    #[test]
    fn marker_detection() {
        assert!(contains_marker("see mender-id: mnd-job-abc for details"));
        assert!(contains_marker("mender-sentry-issue: 95751702"));
        assert!(!contains_marker("an ordinary bug report"));
    }
}
