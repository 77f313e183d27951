//! Ingest pollers: periodically pull issues from each configured source,
//! upsert them, and enqueue jobs for anything without active work.

use crate::pool;
use anyhow::{Context, Result, bail};
use mender_core::config::{Config, ProjectConfig};
use mender_core::issue::{IssueState, IssueUpsert, Source, contains_marker};
use mender_db::Store;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Upsert an issue and create + enqueue a job when the issue has no active
/// one. Shared by the pollers and the webhook receiver — scenario parity
/// between the two ingest paths comes from this single function.
pub fn ingest_issue(
    store: &Store,
    job_tx: &mpsc::Sender<String>,
    upsert: &IssueUpsert,
    max_iterations: i64,
) -> Result<Option<String>> {
    let issue_id = store.upsert_issue(upsert)?;
    if store.has_active_job_for_issue(&issue_id)? {
        return Ok(None);
    }
    let job_id = store.create_job(&issue_id, &upsert.project_name, max_iterations)?;
    match job_tx.try_send(job_id.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            // The job stays queued; the next sync pass re-enqueues it.
            tracing::warn!(job = %job_id, "job channel full, enqueue dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::warn!(job = %job_id, "job channel closed");
        }
    }
    tracing::info!(job = %job_id, issue = %issue_id, "created job");
    Ok(Some(job_id))
}

/// Periodically pulls issues from configured sources.
pub struct Syncer {
    cfg: Arc<Config>,
    store: Arc<Store>,
    job_tx: mpsc::Sender<String>,
    client: reqwest::Client,
}

impl Syncer {
    pub fn new(cfg: Arc<Config>, store: Arc<Store>, job_tx: mpsc::Sender<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent("mender")
            .build()
            .context("build sync http client")?;
        Ok(Self {
            cfg,
            store,
            job_tx,
            client,
        })
    }

    /// Poll all sources at `interval` until cancelled. The first pass runs
    /// immediately.
    pub async fn run_loop(&self, cancel: CancellationToken, interval: Duration) {
        tracing::info!(?interval, "sync loop starting");
        self.sync_all().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("sync loop stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => self.sync_all().await,
            }
        }
    }

    pub async fn sync_all(&self) {
        for project in &self.cfg.projects {
            if let Err(e) = self.sync_project(project).await {
                tracing::error!(project = %project.name, error = %format!("{e:#}"), "sync project failed");
            }
        }
        // Wake workers for anything still queued (dropped enqueues, retries).
        let requeued = pool::enqueue_queued_jobs(&self.store, &self.job_tx);
        if requeued > 0 {
            tracing::debug!(requeued, "re-enqueued queued jobs");
        }
    }

    async fn sync_project(&self, project: &ProjectConfig) -> Result<()> {
        if project.gitlab.is_some() {
            self.sync_gitlab(project).await.context("gitlab sync")?;
        }
        if project.github.is_some() {
            self.sync_github(project).await.context("github sync")?;
        }
        if project.sentry.is_some() {
            self.sync_sentry(project).await.context("sentry sync")?;
        }
        Ok(())
    }

    async fn sync_gitlab(&self, project: &ProjectConfig) -> Result<()> {
        if self.cfg.tokens.gitlab.is_empty() {
            tracing::debug!(project = %project.name, "sync: skipping gitlab (no token)");
            return Ok(());
        }
        let gitlab = project.gitlab.as_ref().expect("checked by caller");
        let base_url = if gitlab.base_url.is_empty() {
            "https://gitlab.com"
        } else {
            &gitlab.base_url
        };

        let cursor = self.store.get_cursor(&project.name, Source::Gitlab)?;
        let mut request = self
            .client
            .get(format!(
                "{base_url}/api/v4/projects/{}/issues",
                gitlab.project_id
            ))
            .header("PRIVATE-TOKEN", &self.cfg.tokens.gitlab)
            .query(&[
                ("state", "opened"),
                ("per_page", "100"),
                ("order_by", "updated_at"),
                ("sort", "asc"),
            ]);
        if let Some(cursor) = &cursor {
            request = request.query(&[("updated_after", cursor.as_str())]);
        }

        let response = request.send().await.context("fetch gitlab issues")?;
        if !response.status().is_success() {
            bail!("gitlab API {}: {}", response.status(), body_snippet(response).await);
        }
        let issues: Vec<GitlabIssue> = response.json().await.context("decode gitlab issues")?;
        tracing::debug!(project = %project.name, count = issues.len(), "sync: gitlab issues fetched");

        let mut latest_updated = String::new();
        for issue in issues {
            let description = issue.description.unwrap_or_default();
            if contains_marker(&description) {
                continue;
            }
            let mut upsert =
                IssueUpsert::new(&project.name, Source::Gitlab, &issue.iid.to_string());
            upsert.title = issue.title;
            upsert.body = description;
            upsert.url = issue.web_url;
            upsert.state = IssueState::Open;
            upsert.labels = issue.labels;
            upsert.source_updated_at = issue.updated_at.clone();

            if let Err(e) = ingest_issue(
                &self.store,
                &self.job_tx,
                &upsert,
                self.cfg.daemon.max_iterations,
            ) {
                tracing::error!(iid = issue.iid, error = %e, "sync: ingest gitlab issue");
                continue;
            }
            latest_updated = issue.updated_at;
        }

        if !latest_updated.is_empty() {
            self.store
                .set_cursor(&project.name, Source::Gitlab, &latest_updated)?;
        }
        Ok(())
    }

    async fn sync_github(&self, project: &ProjectConfig) -> Result<()> {
        if self.cfg.tokens.github.is_empty() {
            tracing::debug!(project = %project.name, "sync: skipping github (no token)");
            return Ok(());
        }
        let github = project.github.as_ref().expect("checked by caller");

        let cursor = self.store.get_cursor(&project.name, Source::Github)?;
        let mut request = self
            .client
            .get(format!(
                "https://api.github.com/repos/{}/{}/issues",
                github.owner, github.repo
            ))
            .bearer_auth(&self.cfg.tokens.github)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .query(&[
                ("state", "open"),
                ("per_page", "100"),
                ("sort", "updated"),
                ("direction", "asc"),
            ]);
        if let Some(cursor) = &cursor {
            request = request.query(&[("since", cursor.as_str())]);
        }

        let response = request.send().await.context("fetch github issues")?;
        if !response.status().is_success() {
            bail!("github API {}: {}", response.status(), body_snippet(response).await);
        }
        let issues: Vec<GithubIssue> = response.json().await.context("decode github issues")?;
        tracing::debug!(project = %project.name, count = issues.len(), "sync: github issues fetched");

        let mut latest_updated = String::new();
        for issue in issues {
            // PRs show up in the issues API; skip them.
            if issue.pull_request.is_some() {
                continue;
            }
            let body = issue.body.unwrap_or_default();
            if contains_marker(&body) {
                continue;
            }
            let mut upsert =
                IssueUpsert::new(&project.name, Source::Github, &issue.number.to_string());
            upsert.title = issue.title;
            upsert.body = body;
            upsert.url = issue.html_url;
            upsert.state = IssueState::Open;
            upsert.labels = issue.labels.into_iter().map(|l| l.name).collect();
            upsert.source_updated_at = issue.updated_at.clone();

            if let Err(e) = ingest_issue(
                &self.store,
                &self.job_tx,
                &upsert,
                self.cfg.daemon.max_iterations,
            ) {
                tracing::error!(number = issue.number, error = %e, "sync: ingest github issue");
                continue;
            }
            latest_updated = issue.updated_at;
        }

        if !latest_updated.is_empty() {
            self.store
                .set_cursor(&project.name, Source::Github, &latest_updated)?;
        }
        Ok(())
    }

    async fn sync_sentry(&self, project: &ProjectConfig) -> Result<()> {
        if self.cfg.tokens.sentry.is_empty() {
            tracing::debug!(project = %project.name, "sync: skipping sentry (no token)");
            return Ok(());
        }
        let sentry = project.sentry.as_ref().expect("checked by caller");

        let cursor = self.store.get_cursor(&project.name, Source::Sentry)?;
        let mut request = self
            .client
            .get(format!(
                "{}/api/0/projects/{}/{}/issues/",
                self.cfg.sentry.base_url, sentry.org, sentry.project
            ))
            .bearer_auth(&self.cfg.tokens.sentry)
            .query(&[("query", "is:unresolved"), ("sort", "date")]);
        if let Some(cursor) = &cursor {
            request = request.query(&[("cursor", cursor.as_str())]);
        }

        let response = request.send().await.context("fetch sentry issues")?;
        if !response.status().is_success() {
            bail!("sentry API {}: {}", response.status(), body_snippet(response).await);
        }
        let link_header = response
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let issues: Vec<SentryIssue> = response.json().await.context("decode sentry issues")?;
        tracing::debug!(project = %project.name, count = issues.len(), "sync: sentry issues fetched");

        for issue in issues {
            let body = sentry_issue_body(&issue);
            let mut upsert = IssueUpsert::new(&project.name, Source::Sentry, &issue.id);
            upsert.title = issue.title.clone();
            upsert.body = body;
            upsert.url = issue.permalink.clone();
            upsert.state = IssueState::Open;
            upsert.source_updated_at = issue.last_seen.clone();

            if let Err(e) = ingest_issue(
                &self.store,
                &self.job_tx,
                &upsert,
                self.cfg.daemon.max_iterations,
            ) {
                tracing::error!(id = %issue.id, error = %e, "sync: ingest sentry issue");
            }
        }

        if let Some(next_cursor) = parse_sentry_next_cursor(&link_header) {
            self.store
                .set_cursor(&project.name, Source::Sentry, &next_cursor)?;
        }
        Ok(())
    }
}

async fn body_snippet(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    text.chars().take(1024).collect()
}

fn sentry_issue_body(issue: &SentryIssue) -> String {
    format!(
        "Sentry Issue: {}\n\nCulprit: {}\nCount: {}\nFirst Seen: {}\nLast Seen: {}\n\nPermalink: {}",
        issue.title, issue.culprit, issue.count, issue.first_seen, issue.last_seen, issue.permalink
    )
}

#[derive(Debug, Deserialize)]
struct GitlabIssue {
    iid: i64,
    title: String,
    description: Option<String>,
    web_url: String,
    #[serde(default)]
    labels: Vec<String>,
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct GithubIssue {
    number: i64,
    title: String,
    body: Option<String>,
    html_url: String,
    #[serde(default)]
    labels: Vec<GithubLabel>,
    updated_at: String,
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GithubLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SentryIssue {
    id: String,
    title: String,
    #[serde(default)]
    culprit: String,
    permalink: String,
    #[serde(default)]
    count: String,
    #[serde(default)]
    first_seen: String,
    #[serde(default)]
    last_seen: String,
}

/// Extract the next pagination cursor from Sentry's Link header.
///
/// Format: `<url>; rel="previous"; results="false"; cursor="...",
/// <url>; rel="next"; results="true"; cursor="..."`.
pub fn parse_sentry_next_cursor(link: &str) -> Option<String> {
    for part in split_link(link) {
        if part.contains(r#"rel="next""#) && part.contains(r#"results="true""#) {
            return extract_cursor(part);
        }
    }
    None
}

/// Split a Link header at `>,` boundaries; URLs may contain commas, so a
/// plain comma split is not safe.
fn split_link(link: &str) -> Vec<&str> {
    let bytes = link.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'>' && i + 1 < bytes.len() && bytes[i + 1] == b',' {
            parts.push(&link[start..=i]);
            start = i + 2;
            while start < bytes.len() && bytes[start] == b' ' {
                start += 1;
            }
            i = start;
            continue;
        }
        i += 1;
    }
    if start < link.len() {
        parts.push(&link[start..]);
    }
    parts
}

fn extract_cursor(part: &str) -> Option<String> {
    let start = part.find(r#"cursor=""#)? + r#"cursor=""#.len();
    let rest = &part[start..];
    match rest.find('"') {
        Some(end) => Some(rest[..end].to_string()),
        None => Some(rest.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender_db::Store;

    const SENTRY_LINK: &str = concat!(
        r#"<https://sentry.io/api/0/projects/org/proj/issues/?&cursor=100:0:1>; rel="previous"; results="false"; cursor="100:0:1", "#,
        r#"<https://sentry.io/api/0/projects/org/proj/issues/?&cursor=100:100:0>; rel="next"; results="true"; cursor="100:100:0""#
    );

    #[test]
    fn sentry_next_cursor_parsing() {
        assert_eq!(
            parse_sentry_next_cursor(SENTRY_LINK).as_deref(),
            Some("100:100:0")
        );
        // Last page: next link says results="false".
        let last_page = SENTRY_LINK.replace(r#"rel="next"; results="true""#, r#"rel="next"; results="false""#);
        assert_eq!(parse_sentry_next_cursor(&last_page), None);
        assert_eq!(parse_sentry_next_cursor(""), None);
    }

    #[test]
    fn sentry_body_synthesis() {
        let issue = SentryIssue {
            id: "95751702".into(),
            title: "TypeError in checkout".into(),
            culprit: "app/checkout.py".into(),
            permalink: "https://sentry.io/issues/95751702".into(),
            count: "14".into(),
            first_seen: "2025-10-30T00:00:00Z".into(),
            last_seen: "2025-11-01T00:00:00Z".into(),
        };
        let body = sentry_issue_body(&issue);
        assert!(body.contains("Culprit: app/checkout.py"));
        assert!(body.contains("Count: 14"));
        assert!(body.contains("Permalink: https://sentry.io/issues/95751702"));
    }

    #[test]
    fn ingest_deduplicates_active_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("mender.db")).unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let mut upsert = IssueUpsert::new("myproject", Source::Gitlab, "7");
        upsert.title = "double delivery".into();

        let first = ingest_issue(&store, &tx, &upsert, 3).unwrap();
        assert!(first.is_some(), "first delivery creates a job");
        assert_eq!(rx.try_recv().unwrap(), first.clone().unwrap());

        // Same payload again: issue refreshed, no second job.
        let second = ingest_issue(&store, &tx, &upsert, 3).unwrap();
        assert!(second.is_none(), "active job suppresses a duplicate");
        assert!(rx.try_recv().is_err());

        // Once the job is terminal a new delivery creates a fresh job.
        store.cancel_job(&first.unwrap()).unwrap();
        assert!(ingest_issue(&store, &tx, &upsert, 3).unwrap().is_some());
    }

    #[test]
    fn full_channel_drops_wakeup_but_keeps_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("mender.db")).unwrap();
        let (tx, mut rx) = mpsc::channel(1);

        let mut first = IssueUpsert::new("myproject", Source::Gitlab, "1");
        first.title = "first".into();
        let mut second = IssueUpsert::new("myproject", Source::Gitlab, "2");
        second.title = "second".into();

        let a = ingest_issue(&store, &tx, &first, 3).unwrap().unwrap();
        let b = ingest_issue(&store, &tx, &second, 3).unwrap().unwrap();

        // Only the first wake-up fit, but both jobs exist as queued.
        assert_eq!(rx.try_recv().unwrap(), a);
        assert!(rx.try_recv().is_err());
        let queued = store.list_queued_job_ids().unwrap();
        assert!(queued.contains(&a) && queued.contains(&b));

        // A sync pass repairs the dropped wake-up.
        assert_eq!(pool::enqueue_queued_jobs(&store, &tx), 1);
    }
}
