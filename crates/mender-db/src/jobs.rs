use crate::{Result, Store, StoreError, new_job_id, now_rfc3339};
use mender_core::job::{Job, JobState, is_legal_transition};
use rusqlite::{OptionalExtension, Row, params};
use rusqlite::types::Value as SqlValue;

/// Columns a caller may set through `update_job_field`. Everything else is
/// owned by a dedicated operation.
const UPDATABLE_FIELDS: &[&str] = &[
    "branch_name",
    "worktree_path",
    "commit_sha",
    "pr_url",
    "error_message",
    "reject_reason",
    "pr_merged_at",
    "pr_closed_at",
];

const JOB_SELECT: &str = "SELECT j.id, j.issue_id, j.project_name, j.state, j.iteration, \
     j.max_iterations, j.branch_name, j.worktree_path, j.commit_sha, j.pr_url, \
     j.error_message, j.reject_reason, j.created_at, j.updated_at, j.pr_merged_at, \
     j.pr_closed_at, i.title, i.source, i.source_issue_id \
     FROM jobs j LEFT JOIN issues i ON i.id = j.issue_id";

/// Which jobs `list_jobs` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    #[default]
    All,
    /// The seven in-flight states.
    Active,
    /// Approved jobs whose PR has merged.
    Merged,
    Exact(JobState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobSort {
    #[default]
    UpdatedAt,
    CreatedAt,
    State,
    Project,
}

impl JobSort {
    fn column(&self) -> &'static str {
        match self {
            JobSort::UpdatedAt => "j.updated_at",
            JobSort::CreatedAt => "j.created_at",
            JobSort::State => "j.state",
            JobSort::Project => "j.project_name",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub project: Option<String>,
    pub state: StateFilter,
}

impl Store {
    pub fn create_job(
        &self,
        issue_id: &str,
        project_name: &str,
        max_iterations: i64,
    ) -> Result<String> {
        let id = new_job_id();
        let now = now_rfc3339();
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, issue_id, project_name, state, iteration, max_iterations,
                                   created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?5)",
                params![id, issue_id, project_name, max_iterations, now],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        let job = self.with_reader(|conn| {
            let job = conn
                .query_row(
                    &format!("{JOB_SELECT} WHERE j.id = ?1"),
                    params![id],
                    job_from_row,
                )
                .optional()?;
            Ok(job)
        })?;
        job.ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    /// True when any job for the issue is in a non-terminal state. This is
    /// the ingest dedup predicate, so `queued` and `ready` count.
    pub fn has_active_job_for_issue(&self, issue_id: &str) -> Result<bool> {
        self.with_reader(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM jobs
                     WHERE issue_id = ?1
                       AND state NOT IN ('approved', 'rejected', 'failed', 'cancelled')
                 )",
                params![issue_id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    /// Atomically move the oldest `queued` job into `planning` and return
    /// its id. `Ok(None)` means the queue is empty — not an error.
    pub fn claim_job(&self) -> Result<Option<String>> {
        let now = now_rfc3339();
        self.with_writer(|conn| {
            let id = conn
                .query_row(
                    "UPDATE jobs SET state = 'planning', updated_at = ?1
                     WHERE id = (
                         SELECT id FROM jobs WHERE state = 'queued'
                         ORDER BY created_at ASC, id ASC LIMIT 1
                     )
                     RETURNING id",
                    params![now],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    /// Atomic guarded transition: fails with `IllegalTransition` when the
    /// edge is not in the table or the row is no longer in `from`.
    pub fn transition_state(&self, id: &str, from: JobState, to: JobState) -> Result<()> {
        if !is_legal_transition(from, to) {
            return Err(StoreError::IllegalTransition { from, to });
        }
        let now = now_rfc3339();
        let changed = self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
                params![to.as_str(), now, id, from.as_str()],
            )?;
            Ok(changed)
        })?;
        if changed == 0 {
            // Distinguish a missing row from a concurrent state change.
            self.get_job(id)?;
            return Err(StoreError::IllegalTransition { from, to });
        }
        Ok(())
    }

    pub fn increment_iteration(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        let changed = self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET iteration = iteration + 1, updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(changed)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    /// Set one of the whitelisted job columns. `None` clears it.
    pub fn update_job_field(&self, id: &str, field: &str, value: Option<&str>) -> Result<()> {
        if !UPDATABLE_FIELDS.contains(&field) {
            return Err(StoreError::InvalidField(field.to_string()));
        }
        let now = now_rfc3339();
        let sql_value = match value {
            Some(v) => SqlValue::Text(v.to_string()),
            None => SqlValue::Null,
        };
        let changed = self.with_writer(|conn| {
            let changed = conn.execute(
                &format!("UPDATE jobs SET {field} = ?1, updated_at = ?2 WHERE id = ?3"),
                params![sql_value, now, id],
            )?;
            Ok(changed)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    /// Move a job to `cancelled` from whatever non-terminal state it is in.
    /// A job already in a terminal state is left untouched.
    pub fn cancel_job(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        let changed = self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET state = 'cancelled', updated_at = ?1
                 WHERE id = ?2
                   AND state NOT IN ('approved', 'rejected', 'failed', 'cancelled')",
                params![now, id],
            )?;
            Ok(changed)
        })?;
        if changed == 0 {
            // Either unknown or already terminal; only the former is an error.
            self.get_job(id)?;
        }
        Ok(())
    }

    /// Human retry: requeue a `failed` or `rejected` job with fresh
    /// iteration bookkeeping and a cleared error.
    pub fn retry_job(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        let changed = self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET state = 'queued', iteration = 0, error_message = NULL,
                                 updated_at = ?1
                 WHERE id = ?2 AND state IN ('failed', 'rejected')",
                params![now, id],
            )?;
            Ok(changed)
        })?;
        if changed == 0 {
            let job = self.get_job(id)?;
            return Err(StoreError::IllegalTransition {
                from: job.state,
                to: JobState::Queued,
            });
        }
        Ok(())
    }

    /// Startup recovery sweep: every in-flight job (claimed by a worker or
    /// in the PR lifecycle when the previous process died) goes back to
    /// `queued` with its iteration bookkeeping reset. Idempotent.
    pub fn recover_in_flight(&self) -> Result<usize> {
        let now = now_rfc3339();
        self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET state = 'queued', iteration = 0, updated_at = ?1
                 WHERE state IN ('planning', 'implementing', 'reviewing', 'testing',
                                 'rebasing', 'resolving_conflicts', 'awaiting_checks')",
                params![now],
            )?;
            Ok(changed)
        })
    }

    pub fn list_queued_job_ids(&self) -> Result<Vec<String>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM jobs WHERE state = 'queued' ORDER BY created_at ASC, id ASC",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    pub fn count_jobs_in_state(&self, state: JobState) -> Result<i64> {
        self.with_reader(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE state = ?1",
                params![state.as_str()],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    pub fn count_jobs_by_state(&self) -> Result<Vec<(JobState, i64)>> {
        self.with_reader(|conn| {
            let mut stmt =
                conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state ORDER BY state")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|(s, n)| s.parse::<JobState>().ok().map(|state| (state, n)))
                .collect())
        })
    }

    pub fn list_jobs(
        &self,
        filter: &JobFilter,
        sort: JobSort,
        ascending: bool,
    ) -> Result<Vec<Job>> {
        let (where_clause, params_vec) = build_filter(filter);
        let direction = if ascending { "ASC" } else { "DESC" };
        let sql = format!(
            "{JOB_SELECT}{where_clause} ORDER BY {} {direction}",
            sort.column()
        );
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let jobs = stmt
                .query_map(rusqlite::params_from_iter(params_vec.iter()), job_from_row)?
                .collect::<rusqlite::Result<Vec<Job>>>()?;
            Ok(jobs)
        })
    }

    /// Paginated variant of `list_jobs`; returns the page plus the total row
    /// count for the filter.
    pub fn list_jobs_page(
        &self,
        filter: &JobFilter,
        sort: JobSort,
        ascending: bool,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<Job>, usize)> {
        let (where_clause, params_vec) = build_filter(filter);
        let direction = if ascending { "ASC" } else { "DESC" };
        let offset = page.saturating_sub(1) * page_size;
        self.with_reader(|conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM jobs j LEFT JOIN issues i ON i.id = j.issue_id{where_clause}"),
                rusqlite::params_from_iter(params_vec.iter()),
                |row| row.get(0),
            )?;
            let sql = format!(
                "{JOB_SELECT}{where_clause} ORDER BY {} {direction} LIMIT {page_size} OFFSET {offset}",
                sort.column()
            );
            let mut stmt = conn.prepare(&sql)?;
            let jobs = stmt
                .query_map(rusqlite::params_from_iter(params_vec.iter()), job_from_row)?
                .collect::<rusqlite::Result<Vec<Job>>>()?;
            Ok((jobs, total as usize))
        })
    }

    /// Expand a unique job id prefix into the full id.
    pub fn resolve_job_id(&self, prefix: &str) -> Result<String> {
        if prefix.is_empty() {
            return Err(StoreError::NotFound("job".to_string()));
        }
        let matches = self.with_reader(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM jobs WHERE id LIKE ?1 || '%' LIMIT 2")?;
            let ids = stmt
                .query_map(params![prefix], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })?;
        match matches.len() {
            0 => Err(StoreError::NotFound(format!("job {prefix}"))),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(StoreError::AmbiguousId(prefix.to_string())),
        }
    }
}

fn build_filter(filter: &JobFilter) -> (String, Vec<String>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params_vec: Vec<String> = Vec::new();

    if let Some(project) = &filter.project {
        params_vec.push(project.clone());
        clauses.push(format!("j.project_name = ?{}", params_vec.len()));
    }
    match filter.state {
        StateFilter::All => {}
        StateFilter::Active => {
            clauses.push(
                "j.state IN ('planning', 'implementing', 'reviewing', 'testing', \
                 'rebasing', 'resolving_conflicts', 'awaiting_checks')"
                    .to_string(),
            );
        }
        StateFilter::Merged => {
            clauses.push(
                "j.state = 'approved' AND j.pr_merged_at IS NOT NULL AND j.pr_merged_at != ''"
                    .to_string(),
            );
        }
        StateFilter::Exact(state) => {
            params_vec.push(state.as_str().to_string());
            clauses.push(format!("j.state = ?{}", params_vec.len()));
        }
    }

    if clauses.is_empty() {
        (String::new(), params_vec)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params_vec)
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state: String = row.get(3)?;
    Ok(Job {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        project_name: row.get(2)?,
        state: state.parse().unwrap_or(JobState::Failed),
        iteration: row.get(4)?,
        max_iterations: row.get(5)?,
        branch_name: row.get(6)?,
        worktree_path: row.get(7)?,
        commit_sha: row.get(8)?,
        pr_url: row.get(9)?,
        error_message: row.get(10)?,
        reject_reason: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        pr_merged_at: row.get(14)?,
        pr_closed_at: row.get(15)?,
        issue_title: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
        issue_source: row.get::<_, Option<String>>(17)?.unwrap_or_default(),
        source_issue_id: row.get::<_, Option<String>>(18)?.unwrap_or_default(),
    })
}
