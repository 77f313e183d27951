use crate::{Result, Store, StoreError, new_session_id, now_rfc3339};
use mender_core::session::{Session, SessionStatus, Step, TokenSummary};
use rusqlite::{Row, params};
use std::collections::HashMap;

const SESSION_COLUMNS: &str = "id, job_id, step, iteration, provider, status, prompt, response, \
     jsonl_path, commit_sha, input_tokens, output_tokens, duration_ms, error_message, \
     created_at, updated_at";

/// Finalization data for a session, written after the provider returns.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub status: Option<SessionStatus>,
    pub prompt: String,
    pub response: String,
    pub jsonl_path: Option<String>,
    pub commit_sha: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

impl Store {
    /// Record the start of a provider invocation (status `running`).
    pub fn create_session(
        &self,
        job_id: &str,
        step: Step,
        iteration: i64,
        provider: &str,
    ) -> Result<String> {
        let id = new_session_id();
        let now = now_rfc3339();
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, job_id, step, iteration, provider, status,
                                       created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?6)",
                params![id, job_id, step.as_str(), iteration, provider, now],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn complete_session(&self, id: &str, outcome: &SessionOutcome) -> Result<()> {
        let status = outcome.status.unwrap_or(SessionStatus::Completed);
        let now = now_rfc3339();
        let changed = self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET
                     status = ?1, prompt = ?2, response = ?3, jsonl_path = ?4,
                     commit_sha = ?5, input_tokens = ?6, output_tokens = ?7,
                     duration_ms = ?8, error_message = ?9, updated_at = ?10
                 WHERE id = ?11",
                params![
                    status.as_str(),
                    outcome.prompt,
                    outcome.response,
                    outcome.jsonl_path,
                    outcome.commit_sha,
                    outcome.input_tokens,
                    outcome.output_tokens,
                    outcome.duration_ms,
                    outcome.error_message,
                    now,
                    id,
                ],
            )?;
            Ok(changed)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// Sweep every `running` session of a job to `cancelled`. Invoked when
    /// the job itself is cancelled so no session is left dangling.
    pub fn mark_running_sessions_cancelled(&self, job_id: &str) -> Result<usize> {
        let now = now_rfc3339();
        self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = 'cancelled', updated_at = ?1
                 WHERE job_id = ?2 AND status = 'running'",
                params![now, job_id],
            )?;
            Ok(changed)
        })
    }

    pub fn list_sessions_by_job(&self, job_id: &str) -> Result<Vec<Session>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE job_id = ?1
                 ORDER BY rowid ASC"
            ))?;
            let sessions = stmt
                .query_map(params![job_id], session_from_row)?
                .collect::<rusqlite::Result<Vec<Session>>>()?;
            Ok(sessions)
        })
    }

    /// Token totals per job, for cost display.
    pub fn aggregate_tokens_for_jobs(
        &self,
        job_ids: &[String],
    ) -> Result<HashMap<String, TokenSummary>> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = std::iter::repeat_n("?", job_ids.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT job_id, SUM(input_tokens), SUM(output_tokens), COUNT(*),
                    MAX(provider)
             FROM sessions WHERE job_id IN ({placeholders})
             GROUP BY job_id"
        );
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(job_ids.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        TokenSummary {
                            total_input_tokens: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                            total_output_tokens: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                            session_count: row.get(3)?,
                            provider: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        },
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows.into_iter().collect())
        })
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(5)?;
    Ok(Session {
        id: row.get(0)?,
        job_id: row.get(1)?,
        step: row.get(2)?,
        iteration: row.get(3)?,
        provider: row.get(4)?,
        status: status.parse().unwrap_or(SessionStatus::Failed),
        prompt: row.get(6)?,
        response: row.get(7)?,
        jsonl_path: row.get(8)?,
        commit_sha: row.get(9)?,
        input_tokens: row.get(10)?,
        output_tokens: row.get(11)?,
        duration_ms: row.get(12)?,
        error_message: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}
