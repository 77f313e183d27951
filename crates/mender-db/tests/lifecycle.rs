//! Store lifecycle tests: issue upserts, the job state machine as persisted,
//! sessions, artifacts, and cursors.

use mender_core::issue::{IssueUpsert, Source};
use mender_core::job::JobState;
use mender_core::session::{SessionStatus, Step};
use mender_db::jobs::{JobFilter, JobSort, StateFilter};
use mender_db::sessions::SessionOutcome;
use mender_db::{Store, StoreError};

fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("mender.db")).unwrap();
    (dir, store)
}

fn seed_issue(store: &Store, source_issue_id: &str) -> String {
    let mut upsert = IssueUpsert::new("myproject", Source::Gitlab, source_issue_id);
    upsert.title = format!("issue {source_issue_id}");
    upsert.url = format!("https://gitlab.example/issues/{source_issue_id}");
    store.upsert_issue(&upsert).unwrap()
}

#[test]
fn upsert_assigns_and_preserves_canonical_id() {
    let (_dir, store) = open_store();

    let mut upsert = IssueUpsert::new("myproject", Source::Sentry, "95751702");
    upsert.title = "boom".into();
    upsert.url = "https://sentry.local/issues/95751702".into();
    let first = store.upsert_issue(&upsert).unwrap();
    assert!(first.starts_with("mnd-"), "got {first}");

    upsert.title = "boom updated".into();
    upsert.labels = vec!["bug".into(), "p1".into()];
    let second = store.upsert_issue(&upsert).unwrap();
    assert_eq!(first, second, "canonical id must be stable across upserts");

    let issue = store.get_issue(&first).unwrap();
    assert_eq!(issue.title, "boom updated");
    assert_eq!(issue.labels, vec!["bug".to_string(), "p1".to_string()]);
    assert_eq!(issue.source, Source::Sentry);
}

#[test]
fn upsert_twice_with_identical_input_is_idempotent() {
    let (_dir, store) = open_store();
    let mut upsert = IssueUpsert::new("myproject", Source::Github, "42");
    upsert.title = "Fix login timeout".into();
    upsert.source_updated_at = "2025-11-01T00:00:00Z".into();

    let id1 = store.upsert_issue(&upsert).unwrap();
    let row1 = store.get_issue(&id1).unwrap();
    let id2 = store.upsert_issue(&upsert).unwrap();
    let row2 = store.get_issue(&id2).unwrap();

    assert_eq!(id1, id2);
    assert_eq!(row1.title, row2.title);
    assert_eq!(row1.source_updated_at, row2.source_updated_at);
    assert_eq!(row1.labels, row2.labels);
}

#[test]
fn get_missing_issue_is_not_found() {
    let (_dir, store) = open_store();
    let err = store.get_issue("mnd-missing").unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)), "got {err:?}");
}

#[test]
fn job_claim_and_transitions() {
    let (_dir, store) = open_store();
    let issue_id = seed_issue(&store, "1");

    let job_id = store.create_job(&issue_id, "myproject", 3).unwrap();
    assert!(job_id.starts_with("mnd-job-"), "got {job_id}");

    // Claim moves queued -> planning.
    let claimed = store.claim_job().unwrap();
    assert_eq!(claimed.as_deref(), Some(job_id.as_str()));
    let job = store.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Planning);

    store
        .transition_state(&job_id, JobState::Planning, JobState::Implementing)
        .unwrap();

    // Illegal edge.
    let err = store
        .transition_state(&job_id, JobState::Implementing, JobState::Approved)
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition { .. }), "got {err:?}");

    // Legal edge but stale `from`: row is in implementing, not planning.
    let err = store
        .transition_state(&job_id, JobState::Planning, JobState::Implementing)
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition { .. }), "got {err:?}");

    store
        .transition_state(&job_id, JobState::Implementing, JobState::Reviewing)
        .unwrap();
    assert_eq!(store.get_job(&job_id).unwrap().state, JobState::Reviewing);
}

#[test]
fn claim_on_empty_queue_returns_none() {
    let (_dir, store) = open_store();
    assert!(store.claim_job().unwrap().is_none());
}

#[test]
fn claim_hands_out_each_job_exactly_once() {
    let (_dir, store) = open_store();
    for i in 0..3 {
        let issue_id = seed_issue(&store, &i.to_string());
        store.create_job(&issue_id, "myproject", 3).unwrap();
    }

    let mut seen = std::collections::HashSet::new();
    while let Some(id) = store.claim_job().unwrap() {
        assert!(seen.insert(id), "job claimed twice");
    }
    assert_eq!(seen.len(), 3);
}

#[test]
fn has_active_job_for_issue_predicate() {
    let (_dir, store) = open_store();
    let issue_id = seed_issue(&store, "2");

    assert!(!store.has_active_job_for_issue(&issue_id).unwrap());

    let job_id = store.create_job(&issue_id, "myproject", 3).unwrap();
    // A queued job already counts — this is what dedups double ingest.
    assert!(store.has_active_job_for_issue(&issue_id).unwrap());

    store.cancel_job(&job_id).unwrap();
    assert!(!store.has_active_job_for_issue(&issue_id).unwrap());

    // A fresh job after the old one went terminal is allowed again.
    store.create_job(&issue_id, "myproject", 3).unwrap();
    assert!(store.has_active_job_for_issue(&issue_id).unwrap());
}

#[test]
fn recover_in_flight_requeues_and_is_idempotent() {
    let (_dir, store) = open_store();
    let issue_id = seed_issue(&store, "3");
    let job_id = store.create_job(&issue_id, "myproject", 3).unwrap();

    store.claim_job().unwrap();
    store
        .transition_state(&job_id, JobState::Planning, JobState::Implementing)
        .unwrap();
    store.increment_iteration(&job_id).unwrap();

    let recovered = store.recover_in_flight().unwrap();
    assert_eq!(recovered, 1);

    let job = store.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.iteration, 0, "iteration bookkeeping resets on recovery");

    // Second sweep is a no-op.
    assert_eq!(store.recover_in_flight().unwrap(), 0);
}

#[test]
fn recovery_leaves_ready_and_terminal_jobs_alone() {
    let (_dir, store) = open_store();
    let ready_issue = seed_issue(&store, "4");
    let ready_job = store.create_job(&ready_issue, "myproject", 3).unwrap();
    store.claim_job().unwrap();
    for (from, to) in [
        (JobState::Planning, JobState::Implementing),
        (JobState::Implementing, JobState::Reviewing),
        (JobState::Reviewing, JobState::Testing),
        (JobState::Testing, JobState::Ready),
    ] {
        store.transition_state(&ready_job, from, to).unwrap();
    }

    let failed_issue = seed_issue(&store, "5");
    let failed_job = store.create_job(&failed_issue, "myproject", 3).unwrap();
    store.claim_job().unwrap();
    store
        .transition_state(&failed_job, JobState::Planning, JobState::Failed)
        .unwrap();

    assert_eq!(store.recover_in_flight().unwrap(), 0);
    assert_eq!(store.get_job(&ready_job).unwrap().state, JobState::Ready);
    assert_eq!(store.get_job(&failed_job).unwrap().state, JobState::Failed);
}

#[test]
fn update_job_field_whitelist() {
    let (_dir, store) = open_store();
    let issue_id = seed_issue(&store, "6");
    let job_id = store.create_job(&issue_id, "myproject", 3).unwrap();

    store
        .update_job_field(&job_id, "branch_name", Some("autopr/gitlab-6-fix"))
        .unwrap();
    store
        .update_job_field(&job_id, "error_message", None)
        .unwrap();
    let job = store.get_job(&job_id).unwrap();
    assert_eq!(job.branch_name.as_deref(), Some("autopr/gitlab-6-fix"));

    let err = store
        .update_job_field(&job_id, "state", Some("approved"))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidField(_)), "got {err:?}");

    let err = store
        .update_job_field(&job_id, "id; DROP TABLE jobs", Some("x"))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidField(_)));
}

#[test]
fn cancel_job_and_running_sessions() {
    let (_dir, store) = open_store();
    let issue_id = seed_issue(&store, "7");
    let job_id = store.create_job(&issue_id, "myproject", 3).unwrap();
    store.claim_job().unwrap();

    let session_id = store
        .create_session(&job_id, Step::Plan, 0, "claude")
        .unwrap();

    store.cancel_job(&job_id).unwrap();
    let cancelled = store.mark_running_sessions_cancelled(&job_id).unwrap();
    assert_eq!(cancelled, 1);

    assert_eq!(store.get_job(&job_id).unwrap().state, JobState::Cancelled);
    let sessions = store.list_sessions_by_job(&job_id).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, session_id);
    assert_eq!(sessions[0].status, SessionStatus::Cancelled);

    // Cancelling again is harmless.
    store.cancel_job(&job_id).unwrap();
    assert_eq!(store.get_job(&job_id).unwrap().state, JobState::Cancelled);
}

#[test]
fn session_completion_and_token_aggregation() {
    let (_dir, store) = open_store();
    let issue_id = seed_issue(&store, "8");
    let job_id = store.create_job(&issue_id, "myproject", 3).unwrap();

    let s1 = store
        .create_session(&job_id, Step::Plan, 0, "claude")
        .unwrap();
    store
        .complete_session(
            &s1,
            &SessionOutcome {
                status: Some(SessionStatus::Completed),
                prompt: "plan it".into(),
                response: "the plan".into(),
                input_tokens: 100,
                output_tokens: 40,
                duration_ms: 1200,
                ..Default::default()
            },
        )
        .unwrap();

    let s2 = store
        .create_session(&job_id, Step::Implement, 0, "claude")
        .unwrap();
    store
        .complete_session(
            &s2,
            &SessionOutcome {
                status: Some(SessionStatus::Failed),
                error_message: Some("provider crashed".into()),
                input_tokens: 10,
                output_tokens: 0,
                ..Default::default()
            },
        )
        .unwrap();

    let sessions = store.list_sessions_by_job(&job_id).unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].step, "plan");
    assert_eq!(sessions[0].response, "the plan");
    assert_eq!(sessions[1].status, SessionStatus::Failed);

    let totals = store
        .aggregate_tokens_for_jobs(&[job_id.clone()])
        .unwrap();
    let summary = totals.get(&job_id).unwrap();
    assert_eq!(summary.total_input_tokens, 110);
    assert_eq!(summary.total_output_tokens, 40);
    assert_eq!(summary.session_count, 2);
    assert_eq!(summary.provider, "claude");
}

#[test]
fn artifact_revisions() {
    let (_dir, store) = open_store();
    let issue_id = seed_issue(&store, "9");
    let job_id = store.create_job(&issue_id, "myproject", 3).unwrap();

    assert!(store.get_latest_artifact(&job_id, "plan").unwrap().is_none());

    assert_eq!(store.put_artifact(&job_id, "plan", "v1").unwrap(), 1);
    assert_eq!(store.put_artifact(&job_id, "plan", "v2").unwrap(), 2);

    let latest = store.get_latest_artifact(&job_id, "plan").unwrap().unwrap();
    assert_eq!(latest.revision, 2);
    assert_eq!(latest.content, "v2");
}

#[test]
fn cursor_roundtrip() {
    let (_dir, store) = open_store();

    assert!(store.get_cursor("myproject", Source::Gitlab).unwrap().is_none());

    store
        .set_cursor("myproject", Source::Gitlab, "2025-11-01T10:00:00Z")
        .unwrap();
    store
        .set_cursor("myproject", Source::Gitlab, "2025-11-02T10:00:00Z")
        .unwrap();

    assert_eq!(
        store.get_cursor("myproject", Source::Gitlab).unwrap().as_deref(),
        Some("2025-11-02T10:00:00Z")
    );
    // Other sources are independent.
    assert!(store.get_cursor("myproject", Source::Github).unwrap().is_none());
}

#[test]
fn resolve_job_id_prefix() {
    let (_dir, store) = open_store();
    let issue_a = seed_issue(&store, "10");
    let issue_b = seed_issue(&store, "11");
    let job_a = store.create_job(&issue_a, "myproject", 3).unwrap();
    store.create_job(&issue_b, "myproject", 3).unwrap();

    assert_eq!(store.resolve_job_id(&job_a).unwrap(), job_a);
    assert_eq!(store.resolve_job_id(&job_a[..16]).unwrap(), job_a);

    let err = store.resolve_job_id("mnd-job-").unwrap_err();
    assert!(matches!(err, StoreError::AmbiguousId(_)), "got {err:?}");

    let err = store.resolve_job_id("mnd-job-zzzz").unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)), "got {err:?}");
}

#[test]
fn retry_requeues_failed_jobs_only() {
    let (_dir, store) = open_store();
    let issue_id = seed_issue(&store, "retry-1");
    let job_id = store.create_job(&issue_id, "myproject", 3).unwrap();
    store.claim_job().unwrap();
    store
        .transition_state(&job_id, JobState::Planning, JobState::Failed)
        .unwrap();
    store
        .update_job_field(&job_id, "error_message", Some("boom"))
        .unwrap();

    store.retry_job(&job_id).unwrap();
    let job = store.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.iteration, 0);
    assert!(job.error_message.is_none());

    // A queued job cannot be retried again.
    let err = store.retry_job(&job_id).unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition { .. }));
}

#[test]
fn list_jobs_filters_and_pagination() {
    let (_dir, store) = open_store();
    for i in 0..5 {
        let issue_id = seed_issue(&store, &format!("list-{i}"));
        store.create_job(&issue_id, "myproject", 3).unwrap();
    }
    // One job in another project.
    let mut other = IssueUpsert::new("otherproject", Source::Github, "1");
    other.title = "other".into();
    let other_issue = store.upsert_issue(&other).unwrap();
    store.create_job(&other_issue, "otherproject", 3).unwrap();

    // Claim one into planning so the active filter has something.
    store.claim_job().unwrap();

    let all = store
        .list_jobs(&JobFilter::default(), JobSort::CreatedAt, true)
        .unwrap();
    assert_eq!(all.len(), 6);
    assert!(!all[0].issue_title.is_empty(), "issue columns are joined in");

    let mine = store
        .list_jobs(
            &JobFilter {
                project: Some("myproject".into()),
                state: StateFilter::All,
            },
            JobSort::UpdatedAt,
            false,
        )
        .unwrap();
    assert_eq!(mine.len(), 5);

    let active = store
        .list_jobs(
            &JobFilter {
                project: None,
                state: StateFilter::Active,
            },
            JobSort::UpdatedAt,
            false,
        )
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].state, JobState::Planning);

    let queued = store
        .list_jobs(
            &JobFilter {
                project: None,
                state: StateFilter::Exact(JobState::Queued),
            },
            JobSort::UpdatedAt,
            false,
        )
        .unwrap();
    assert_eq!(queued.len(), 5);

    let (page, total) = store
        .list_jobs_page(&JobFilter::default(), JobSort::CreatedAt, true, 2, 4)
        .unwrap();
    assert_eq!(total, 6);
    assert_eq!(page.len(), 2);
}
