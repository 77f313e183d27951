use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS issues (
    id                TEXT PRIMARY KEY,
    project_name      TEXT NOT NULL,
    source            TEXT NOT NULL,
    source_issue_id   TEXT NOT NULL,
    title             TEXT NOT NULL DEFAULT '',
    body              TEXT NOT NULL DEFAULT '',
    url               TEXT NOT NULL DEFAULT '',
    state             TEXT NOT NULL DEFAULT 'open',
    labels_json       TEXT NOT NULL DEFAULT '[]',
    source_meta_json  TEXT NOT NULL DEFAULT '{}',
    source_updated_at TEXT NOT NULL DEFAULT '',
    synced_at         TEXT NOT NULL DEFAULT '',
    UNIQUE (project_name, source, source_issue_id)
);

CREATE TABLE IF NOT EXISTS jobs (
    id             TEXT PRIMARY KEY,
    issue_id       TEXT NOT NULL REFERENCES issues(id),
    project_name   TEXT NOT NULL,
    state          TEXT NOT NULL DEFAULT 'queued',
    iteration      INTEGER NOT NULL DEFAULT 0,
    max_iterations INTEGER NOT NULL DEFAULT 3,
    branch_name    TEXT,
    worktree_path  TEXT,
    commit_sha     TEXT,
    pr_url         TEXT,
    error_message  TEXT,
    reject_reason  TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    pr_merged_at   TEXT,
    pr_closed_at   TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_issue ON jobs(issue_id);

CREATE TABLE IF NOT EXISTS sessions (
    id            TEXT PRIMARY KEY,
    job_id        TEXT NOT NULL REFERENCES jobs(id),
    step          TEXT NOT NULL,
    iteration     INTEGER NOT NULL DEFAULT 0,
    provider      TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'running',
    prompt        TEXT NOT NULL DEFAULT '',
    response      TEXT NOT NULL DEFAULT '',
    jsonl_path    TEXT,
    commit_sha    TEXT,
    input_tokens  INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    duration_ms   INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_job ON sessions(job_id);

CREATE TABLE IF NOT EXISTS artifacts (
    job_id     TEXT NOT NULL REFERENCES jobs(id),
    name       TEXT NOT NULL,
    revision   INTEGER NOT NULL,
    content    TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    PRIMARY KEY (job_id, name, revision)
);

CREATE TABLE IF NOT EXISTS sync_cursors (
    project_name   TEXT NOT NULL,
    source         TEXT NOT NULL,
    cursor_value   TEXT NOT NULL DEFAULT '',
    last_synced_at TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (project_name, source)
);
"#;

pub fn create_schema(conn: &Connection) -> crate::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
