//! Per-job pipeline orchestration: plan -> implement <-> review -> test ->
//! ready, with a bounded retry loop and a session row around every provider
//! invocation.

use crate::git::{self, RepoLocks};
use crate::provider::{Cancelled, Provider, ProviderResponse};
use crate::subprocess::run_cmd;
use crate::{pr, prompts};
use anyhow::{Context, Result, anyhow};
use mender_core::config::{Config, ProjectConfig};
use mender_core::issue::Issue;
use mender_core::job::{Job, JobState, build_branch_name};
use mender_core::prompt::{build_prompt, load_template, sanitize_issue_content};
use mender_core::session::{SessionStatus, Step};
use mender_db::Store;
use mender_db::sessions::SessionOutcome;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Ceiling for the project test command.
const TEST_TIMEOUT: Duration = Duration::from_secs(900);

/// How often a running job checks the store for an external cancel.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Verdict marker the review step looks for in the provider response.
const REVIEW_APPROVED_MARKER: &str = "APPROVED";

/// Artifact names shared between steps.
const ARTIFACT_PLAN: &str = "plan";
const ARTIFACT_FEEDBACK: &str = "feedback";

/// Retryable step outcomes: both loop the job back to `implementing`
/// instead of failing it. The feedback itself travels via the artifact
/// store.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("code review requested changes")]
    ReviewChangesRequested,
    #[error("tests failed")]
    TestsFailed,
}

/// Drives one job at a time through the pipeline. All effects are persisted;
/// nothing is returned beyond success or the failure already recorded.
pub struct Runner {
    store: Arc<Store>,
    provider: Arc<dyn Provider>,
    cfg: Arc<Config>,
    locks: Arc<RepoLocks>,
}

impl Runner {
    pub fn new(
        store: Arc<Store>,
        provider: Arc<dyn Provider>,
        cfg: Arc<Config>,
        locks: Arc<RepoLocks>,
    ) -> Self {
        Self {
            store,
            provider,
            cfg,
            locks,
        }
    }

    /// Process a job from its current state. Cancellation — whether via the
    /// token or an external `cancel_job` observed in the store — is not an
    /// error: the job and its running sessions are marked cancelled and the
    /// runner returns Ok.
    pub async fn run(&self, cancel: &CancellationToken, job_id: &str) -> Result<()> {
        let job = self.store.get_job(job_id)?;
        let issue = self
            .store
            .get_issue(&job.issue_id)
            .with_context(|| format!("get issue for job {job_id}"))?;

        let Some(project) = self.cfg.project_by_name(&job.project_name).cloned() else {
            return self
                .fail_job(job_id, job.state, &format!("project not found: {}", job.project_name))
                .await;
        };

        let cancel = cancel.child_token();
        let watcher = tokio::spawn(watch_for_store_cancel(
            Arc::clone(&self.store),
            job_id.to_string(),
            cancel.clone(),
        ));

        let result = self.drive(&cancel, job_id, job, &issue, &project).await;
        watcher.abort();

        match result {
            Err(e) if cancel.is_cancelled() || e.downcast_ref::<Cancelled>().is_some() => {
                tracing::info!(job = job_id, "job cancelled, marking state");
                if let Err(e) = self.store.cancel_job(job_id) {
                    tracing::warn!(job = job_id, error = %e, "cancel job");
                }
                match self.store.mark_running_sessions_cancelled(job_id) {
                    Ok(n) if n > 0 => {
                        tracing::info!(job = job_id, sessions = n, "cancelled running sessions")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(job = job_id, error = %e, "cancel sessions"),
                }
                Ok(())
            }
            other => other,
        }
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        job: Job,
        issue: &Issue,
        project: &ProjectConfig,
    ) -> Result<()> {
        let token = self.token_for_project(project);

        let work_dir = match job.worktree_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => {
                let branch = build_branch_name(issue, job_id);
                let work_dir = self.cfg.worktree_path(job_id);
                let mirror = self.cfg.local_repo_path(&project.name);

                let lock = self.locks.lock_for(&mirror);
                let guard = lock.lock().await;
                if let Err(e) =
                    git::ensure_bare_clone(&project.repo_url, &token, &mirror, &project.base_branch)
                        .await
                {
                    return self
                        .fail_job(job_id, job.state, &format!("prepare mirror: {e:#}"))
                        .await;
                }
                if let Err(e) =
                    git::clone_for_job(&mirror, &work_dir, &branch, &project.base_branch).await
                {
                    return self
                        .fail_job(job_id, job.state, &format!("clone for job: {e:#}"))
                        .await;
                }
                drop(guard);

                for (field, value) in [
                    ("worktree_path", work_dir.to_string_lossy().into_owned()),
                    ("branch_name", branch),
                ] {
                    if let Err(e) = self.store.update_job_field(job_id, field, Some(&value)) {
                        tracing::warn!(job = job_id, field, error = %e, "record working copy");
                    }
                }
                work_dir
            }
        };

        self.run_steps(cancel, job_id, job.state, issue, project, &work_dir)
            .await?;

        if self.cfg.daemon.auto_pr {
            self.maybe_auto_pr(job_id, issue, project, &work_dir, &token)
                .await?;
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        mut state: JobState,
        issue: &Issue,
        project: &ProjectConfig,
        work_dir: &Path,
    ) -> Result<()> {
        loop {
            let Some(step) = Step::for_state(state) else {
                return Ok(());
            };
            tracing::info!(job = job_id, step = %step, "running step");

            let result = match step {
                Step::Plan => self.run_plan(cancel, job_id, issue, project, work_dir).await,
                Step::Implement => {
                    self.run_implement(cancel, job_id, issue, project, work_dir)
                        .await
                }
                Step::CodeReview => {
                    self.run_code_review(cancel, job_id, issue, project, work_dir)
                        .await
                }
                Step::Test => self.run_test(cancel, job_id, project, work_dir).await,
            };

            match result {
                Ok(()) => {
                    let next = match state {
                        JobState::Planning => JobState::Implementing,
                        JobState::Implementing => JobState::Reviewing,
                        JobState::Reviewing => JobState::Testing,
                        JobState::Testing => JobState::Ready,
                        _ => return Ok(()),
                    };
                    self.store.transition_state(job_id, state, next)?;
                    state = next;
                }
                Err(e) if e.downcast_ref::<Cancelled>().is_some() => return Err(e),
                Err(e) => match e.downcast_ref::<StepError>() {
                    Some(StepError::ReviewChangesRequested) => {
                        self.store
                            .transition_state(job_id, JobState::Reviewing, JobState::Implementing)?;
                        if self.budget_exhausted(job_id)? {
                            return Ok(());
                        }
                        state = JobState::Implementing;
                    }
                    Some(StepError::TestsFailed) => {
                        tracing::info!(job = job_id, "tests failed, looping back to implement");
                        self.store
                            .transition_state(job_id, JobState::Testing, JobState::Implementing)?;
                        if self.budget_exhausted(job_id)? {
                            return Ok(());
                        }
                        state = JobState::Implementing;
                    }
                    None => return self.fail_job(job_id, state, &format!("{e:#}")).await,
                },
            }
        }
    }

    /// Check the iteration budget before re-entering the implement step.
    /// Exhausted means the job is punted to `ready` for a human and the
    /// retry loop ends; otherwise the iteration counter advances.
    fn budget_exhausted(&self, job_id: &str) -> Result<bool> {
        let job = self.store.get_job(job_id)?;
        if job.iteration >= job.max_iterations {
            tracing::info!(
                job = job_id,
                iterations = job.iteration,
                "iteration budget exhausted, moving to ready for human review"
            );
            if let Err(e) =
                self.store
                    .transition_state(job_id, JobState::Implementing, JobState::Ready)
            {
                tracing::warn!(job = job_id, error = %e, "budget punt transition");
            }
            return Ok(true);
        }
        self.store.increment_iteration(job_id)?;
        Ok(false)
    }

    async fn fail_job(&self, job_id: &str, from: JobState, message: &str) -> Result<()> {
        tracing::error!(job = job_id, state = %from, error = message, "job failed");
        if let Err(e) = self.store.transition_state(job_id, from, JobState::Failed) {
            tracing::warn!(job = job_id, error = %e, "fail transition");
        }
        if let Err(e) = self
            .store
            .update_job_field(job_id, "error_message", Some(message))
        {
            tracing::warn!(job = job_id, error = %e, "record error message");
        }
        Err(anyhow!("job {job_id} failed in {from}: {message}"))
    }

    /// Bracket a provider call with a session row. A cancelled invocation
    /// leaves the session `running` for the cancellation sweep to mark.
    async fn invoke_provider(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        step: Step,
        work_dir: &Path,
        prompt: &str,
    ) -> Result<ProviderResponse> {
        let job = self.store.get_job(job_id)?;
        let session_id =
            self.store
                .create_session(job_id, step, job.iteration, self.provider.name())?;

        match self.provider.run(cancel, work_dir, prompt).await {
            Ok(response) => {
                self.store.complete_session(
                    &session_id,
                    &SessionOutcome {
                        status: Some(SessionStatus::Completed),
                        prompt: prompt.to_string(),
                        response: response.text.clone(),
                        jsonl_path: response.jsonl_path.clone(),
                        commit_sha: response.commit_sha.clone(),
                        input_tokens: response.input_tokens,
                        output_tokens: response.output_tokens,
                        duration_ms: response.duration_ms,
                        error_message: None,
                    },
                )?;
                Ok(response)
            }
            Err(e) if e.downcast_ref::<Cancelled>().is_some() => Err(e),
            Err(e) => {
                if let Err(complete_err) = self.store.complete_session(
                    &session_id,
                    &SessionOutcome {
                        status: Some(SessionStatus::Failed),
                        prompt: prompt.to_string(),
                        error_message: Some(format!("{e:#}")),
                        ..Default::default()
                    },
                ) {
                    tracing::warn!(session = session_id, error = %complete_err, "complete session");
                }
                Err(e)
            }
        }
    }

    async fn run_plan(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        issue: &Issue,
        project: &ProjectConfig,
        work_dir: &Path,
    ) -> Result<()> {
        let template = project
            .prompts
            .as_ref()
            .and_then(|p| load_template(&p.plan))
            .unwrap_or_else(|| prompts::DEFAULT_PLAN_TEMPLATE.to_string());
        let body = sanitize_issue_content(&issue.body);
        let prompt = build_prompt(&template, &[("title", &issue.title), ("body", &body)]);

        let response = self
            .invoke_provider(cancel, job_id, Step::Plan, work_dir, &prompt)
            .await?;
        self.store
            .put_artifact(job_id, ARTIFACT_PLAN, &response.text)?;
        Ok(())
    }

    async fn run_implement(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        issue: &Issue,
        project: &ProjectConfig,
        work_dir: &Path,
    ) -> Result<()> {
        let template = project
            .prompts
            .as_ref()
            .and_then(|p| load_template(&p.implement))
            .unwrap_or_else(|| prompts::DEFAULT_IMPLEMENT_TEMPLATE.to_string());
        let plan = self
            .store
            .get_latest_artifact(job_id, ARTIFACT_PLAN)?
            .map(|a| a.content)
            .unwrap_or_default();
        let feedback = self
            .store
            .get_latest_artifact(job_id, ARTIFACT_FEEDBACK)?
            .map(|a| a.content)
            .unwrap_or_default();
        let body = sanitize_issue_content(&issue.body);
        let prompt = build_prompt(
            &template,
            &[
                ("title", &issue.title),
                ("body", &body),
                ("plan", &plan),
                ("feedback", &feedback),
            ],
        );

        self.invoke_provider(cancel, job_id, Step::Implement, work_dir, &prompt)
            .await?;

        // The agent writes code out-of-band; capture whatever it left behind.
        let message = format!("{}\n\nmender-id: {}", issue.title, job_id);
        match git::commit_all(work_dir, &message).await {
            Ok(Some(sha)) => {
                if let Err(e) = self.store.update_job_field(job_id, "commit_sha", Some(&sha)) {
                    tracing::warn!(job = job_id, error = %e, "record commit sha");
                }
            }
            Ok(None) => tracing::debug!(job = job_id, "implement step produced no changes"),
            Err(e) => tracing::warn!(job = job_id, error = %e, "commit implement changes"),
        }
        Ok(())
    }

    async fn run_code_review(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        issue: &Issue,
        project: &ProjectConfig,
        work_dir: &Path,
    ) -> Result<()> {
        let template = project
            .prompts
            .as_ref()
            .and_then(|p| load_template(&p.code_review))
            .unwrap_or_else(|| prompts::DEFAULT_CODE_REVIEW_TEMPLATE.to_string());
        let plan = self
            .store
            .get_latest_artifact(job_id, ARTIFACT_PLAN)?
            .map(|a| a.content)
            .unwrap_or_default();
        let diff_instruction = format!(
            "Inspect the branch changes with `git diff origin/{}...HEAD`.",
            project.base_branch
        );
        let prompt = build_prompt(
            &template,
            &[
                ("title", &issue.title),
                ("diff_instruction", &diff_instruction),
                ("plan", &plan),
            ],
        );

        let response = self
            .invoke_provider(cancel, job_id, Step::CodeReview, work_dir, &prompt)
            .await?;

        // The verdict is a substring contract with the review prompt.
        if response.text.contains(REVIEW_APPROVED_MARKER) {
            return Ok(());
        }
        self.store
            .put_artifact(job_id, ARTIFACT_FEEDBACK, &response.text)?;
        Err(StepError::ReviewChangesRequested.into())
    }

    async fn run_test(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
        project: &ProjectConfig,
        work_dir: &Path,
    ) -> Result<()> {
        let job = self.store.get_job(job_id)?;
        let session_id = self
            .store
            .create_session(job_id, Step::Test, job.iteration, "shell")?;

        let started = std::time::Instant::now();
        let output = run_cmd(&project.test_cmd, work_dir, TEST_TIMEOUT, cancel).await?;
        if output.cancelled {
            return Err(Cancelled.into());
        }

        let combined = format!("stdout:\n{}\nstderr:\n{}", output.stdout, output.stderr);
        let passed = output.success();
        self.store.complete_session(
            &session_id,
            &SessionOutcome {
                status: Some(if passed {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                }),
                prompt: project.test_cmd.clone(),
                response: combined.clone(),
                duration_ms: started.elapsed().as_millis() as i64,
                error_message: (!passed).then(|| format!("exit code {}", output.exit_code)),
                ..Default::default()
            },
        )?;

        if passed {
            return Ok(());
        }
        let feedback = format!(
            "Tests failed (exit {}). Command: {}\n\n{}",
            output.exit_code, project.test_cmd, combined
        );
        self.store
            .put_artifact(job_id, ARTIFACT_FEEDBACK, &feedback)?;
        Err(StepError::TestsFailed.into())
    }

    /// Push the branch and open a PR once a job reaches `ready`. Failure
    /// records an error but leaves the job in `ready` for a human.
    async fn maybe_auto_pr(
        &self,
        job_id: &str,
        issue: &Issue,
        project: &ProjectConfig,
        work_dir: &Path,
        token: &str,
    ) -> Result<()> {
        let job = self.store.get_job(job_id)?;
        if job.state != JobState::Ready {
            return Ok(());
        }
        let Some(branch) = job.branch_name.clone().filter(|b| !b.is_empty()) else {
            tracing::warn!(job = job_id, "auto_pr skipped: job has no branch name");
            return Ok(());
        };

        tracing::info!(job = job_id, "auto_pr enabled, creating PR");
        let (title, body) = pr::build_pr_content(&self.store, &job, issue);

        let result = async {
            git::push_branch(work_dir, &project.repo_url, token, &branch).await?;
            pr::create_pr_for_project(&self.cfg, project, &branch, &title, &body).await
        }
        .await;

        match result {
            Ok(url) => {
                if !url.is_empty() {
                    if let Err(e) = self.store.update_job_field(job_id, "pr_url", Some(&url)) {
                        tracing::warn!(job = job_id, error = %e, "record pr url");
                    }
                }
                self.store
                    .transition_state(job_id, JobState::Ready, JobState::Approved)?;
                tracing::info!(job = job_id, pr_url = %url, "auto-PR created");
            }
            Err(e) => {
                tracing::error!(job = job_id, error = %format!("{e:#}"), "auto-PR creation failed");
                if let Err(field_err) = self.store.update_job_field(
                    job_id,
                    "error_message",
                    Some(&format!("auto-create PR: {e:#}")),
                ) {
                    tracing::warn!(job = job_id, error = %field_err, "record PR error");
                }
            }
        }
        Ok(())
    }

    fn token_for_project(&self, project: &ProjectConfig) -> String {
        if project.gitlab.is_some() {
            return self.cfg.tokens.gitlab.clone();
        }
        if project.github.is_some() {
            return self.cfg.tokens.github.clone();
        }
        String::new()
    }
}

/// Cancel the runner's token when an external actor moves the job to
/// `cancelled` in the store (CLI cancel, webhook, another process).
async fn watch_for_store_cancel(store: Arc<Store>, job_id: String, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
        }
        match store.get_job(&job_id) {
            Ok(job) if job.state == JobState::Cancelled => {
                tracing::debug!(job = %job_id, "store cancel observed");
                cancel.cancel();
                return;
            }
            Ok(job) if job.state.is_terminal() => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job = %job_id, error = %e, "cancel watcher read failed");
            }
        }
    }
}
