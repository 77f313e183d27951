use crate::{Result, Store, now_rfc3339};
use rusqlite::{OptionalExtension, params};

/// A named blob produced during the pipeline, e.g. the plan text. Revisions
/// are append-only; readers take the highest one.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub job_id: String,
    pub name: String,
    pub revision: i64,
    pub content: String,
    pub created_at: String,
}

impl Store {
    /// Append a new revision of the named artifact and return its number.
    pub fn put_artifact(&self, job_id: &str, name: &str, content: &str) -> Result<i64> {
        let now = now_rfc3339();
        self.with_writer(|conn| {
            let revision: i64 = conn.query_row(
                "INSERT INTO artifacts (job_id, name, revision, content, created_at)
                 VALUES (
                     ?1, ?2,
                     COALESCE((SELECT MAX(revision) FROM artifacts
                               WHERE job_id = ?1 AND name = ?2), 0) + 1,
                     ?3, ?4
                 )
                 RETURNING revision",
                params![job_id, name, content, now],
                |row| row.get(0),
            )?;
            Ok(revision)
        })
    }

    pub fn get_latest_artifact(&self, job_id: &str, name: &str) -> Result<Option<Artifact>> {
        self.with_reader(|conn| {
            let artifact = conn
                .query_row(
                    "SELECT job_id, name, revision, content, created_at
                     FROM artifacts WHERE job_id = ?1 AND name = ?2
                     ORDER BY revision DESC LIMIT 1",
                    params![job_id, name],
                    |row| {
                        Ok(Artifact {
                            job_id: row.get(0)?,
                            name: row.get(1)?,
                            revision: row.get(2)?,
                            content: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(artifact)
        })
    }
}
