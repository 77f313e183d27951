//! Pull/merge request creation against the configured host.

use anyhow::{Context, Result, bail};
use mender_core::config::{Config, ProjectConfig};
use mender_core::issue::Issue;
use mender_core::job::{Job, short_id};
use mender_db::Store;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Cap on how much of the plan artifact is embedded in a PR body.
const PLAN_EMBED_LIMIT: usize = 2000;

/// Create a PR or MR for the job's branch, routed by project config.
pub async fn create_pr_for_project(
    cfg: &Config,
    project: &ProjectConfig,
    branch: &str,
    title: &str,
    body: &str,
) -> Result<String> {
    if let Some(github) = &project.github {
        if cfg.tokens.github.is_empty() {
            bail!("GITHUB_TOKEN required to create PR");
        }
        return create_github_pr(
            &cfg.tokens.github,
            &github.owner,
            &github.repo,
            branch,
            &project.base_branch,
            title,
            body,
        )
        .await;
    }
    if let Some(gitlab) = &project.gitlab {
        if cfg.tokens.gitlab.is_empty() {
            bail!("GITLAB_TOKEN required to create MR");
        }
        let base_url = if gitlab.base_url.is_empty() {
            "https://gitlab.com"
        } else {
            &gitlab.base_url
        };
        return create_gitlab_mr(
            &cfg.tokens.gitlab,
            base_url,
            &gitlab.project_id,
            branch,
            &project.base_branch,
            title,
            body,
        )
        .await;
    }
    bail!(
        "project {:?} has no GitHub or GitLab config for PR creation",
        project.name
    )
}

#[derive(Deserialize)]
struct GithubPrResponse {
    html_url: String,
}

async fn create_github_pr(
    token: &str,
    owner: &str,
    repo: &str,
    head: &str,
    base: &str,
    title: &str,
    body: &str,
) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("build http client")?;
    let url = format!("https://api.github.com/repos/{owner}/{repo}/pulls");
    let response = client
        .post(&url)
        .bearer_auth(token)
        .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        .header(reqwest::header::USER_AGENT, "mender")
        .json(&serde_json::json!({
            "title": title,
            "body": body,
            "head": head,
            "base": base,
        }))
        .send()
        .await
        .context("create github PR")?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("github API {status}: {text}");
    }
    let pr: GithubPrResponse = response.json().await.context("decode github PR response")?;
    Ok(pr.html_url)
}

#[derive(Deserialize)]
struct GitlabMrResponse {
    web_url: String,
}

async fn create_gitlab_mr(
    token: &str,
    base_url: &str,
    project_id: &str,
    source_branch: &str,
    target_branch: &str,
    title: &str,
    description: &str,
) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("build http client")?;
    let url = format!("{base_url}/api/v4/projects/{project_id}/merge_requests");
    let response = client
        .post(&url)
        .header("PRIVATE-TOKEN", token)
        .json(&serde_json::json!({
            "source_branch": source_branch,
            "target_branch": target_branch,
            "title": title,
            "description": description,
        }))
        .send()
        .await
        .context("create gitlab MR")?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("gitlab API {status}: {text}");
    }
    let mr: GitlabMrResponse = response.json().await.context("decode gitlab MR response")?;
    Ok(mr.web_url)
}

/// Assemble the PR title and body from the issue and the plan artifact. The
/// body carries our self-identifying marker so ingest never loops a PR back
/// into the pipeline.
pub fn build_pr_content(store: &Store, job: &Job, issue: &Issue) -> (String, String) {
    let title = format!("[AutoPR] {}", issue.title);

    let mut body = String::new();
    body.push_str(&format!("Closes {}\n\n", issue.url));
    body.push_str(&format!("**Issue:** {}\n\n", issue.title));

    if let Ok(Some(plan)) = store.get_latest_artifact(&job.id, "plan") {
        let mut content = plan.content;
        if content.len() > PLAN_EMBED_LIMIT {
            let mut cut = PLAN_EMBED_LIMIT;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str("\n\n_(truncated)_");
        }
        body.push_str("<details>\n<summary>Plan</summary>\n\n");
        body.push_str(&content);
        body.push_str("\n</details>\n\n");
    }

    body.push_str(&format!(
        "_Generated by mender from job `{}`_\n\nmender-id: {}\n",
        short_id(&job.id),
        job.id
    ));

    (title, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender_core::issue::{IssueUpsert, Source, contains_marker};

    fn seeded_job(store: &Store) -> (Job, Issue) {
        let mut upsert = IssueUpsert::new("myproject", Source::Github, "42");
        upsert.title = "Fix login timeout".into();
        upsert.url = "https://github.com/org/repo/issues/42".into();
        let issue_id = store.upsert_issue(&upsert).unwrap();
        let job_id = store.create_job(&issue_id, "myproject", 3).unwrap();
        (
            store.get_job(&job_id).unwrap(),
            store.get_issue(&issue_id).unwrap(),
        )
    }

    #[test]
    fn pr_content_includes_issue_and_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("mender.db")).unwrap();
        let (job, issue) = seeded_job(&store);
        store
            .put_artifact(&job.id, "plan", "1. reproduce\n2. fix")
            .unwrap();

        let (title, body) = build_pr_content(&store, &job, &issue);
        assert_eq!(title, "[AutoPR] Fix login timeout");
        assert!(body.contains("Closes https://github.com/org/repo/issues/42"));
        assert!(body.contains("1. reproduce"));
        assert!(contains_marker(&body), "PR body must carry the self-id marker");
    }

    #[test]
    fn oversized_plan_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("mender.db")).unwrap();
        let (job, issue) = seeded_job(&store);
        store
            .put_artifact(&job.id, "plan", &"x".repeat(5000))
            .unwrap();

        let (_, body) = build_pr_content(&store, &job, &issue);
        assert!(body.contains("_(truncated)_"));
        assert!(body.len() < 4000);
    }

    #[test]
    fn missing_plan_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("mender.db")).unwrap();
        let (job, issue) = seeded_job(&store);
        let (_, body) = build_pr_content(&store, &job, &issue);
        assert!(!body.contains("<details>"));
    }

    #[tokio::test]
    async fn pr_creation_requires_tokens() {
        let project = ProjectConfig {
            name: "p".into(),
            base_branch: "main".into(),
            github: Some(mender_core::config::ProjectGithub {
                owner: "org".into(),
                repo: "repo".into(),
            }),
            ..Default::default()
        };
        let cfg = Config::default();
        let err = create_pr_for_project(&cfg, &project, "branch", "t", "b")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("GITHUB_TOKEN"), "{err}");
    }
}
