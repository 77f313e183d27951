use crate::{Result, Store, StoreError, new_issue_id, now_rfc3339};
use mender_core::issue::{Issue, IssueUpsert};
use rusqlite::{OptionalExtension, Row, params};

const ISSUE_COLUMNS: &str = "id, project_name, source, source_issue_id, title, body, url, state, \
     labels_json, source_meta_json, source_updated_at, synced_at";

impl Store {
    /// Insert or refresh an issue. Conflict on the
    /// (project_name, source, source_issue_id) triple updates the mutable
    /// columns and returns the canonical id assigned on first insert.
    pub fn upsert_issue(&self, input: &IssueUpsert) -> Result<String> {
        let now = now_rfc3339();
        let source_updated = if input.source_updated_at.is_empty() {
            now.clone()
        } else {
            input.source_updated_at.clone()
        };
        let labels_json = serde_json::to_string(&input.labels)?;
        let meta_json = match &input.source_meta {
            Some(meta) => serde_json::to_string(meta)?,
            None => "{}".to_string(),
        };
        let source = input.source.as_str();
        let state = input.state.as_str();

        let id = self.with_writer(|conn| {
            let id: String = conn.query_row(
                "INSERT INTO issues (
                     id, project_name, source, source_issue_id, title, body, url, state,
                     labels_json, source_meta_json, source_updated_at, synced_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT (project_name, source, source_issue_id) DO UPDATE SET
                     title = excluded.title,
                     body = excluded.body,
                     url = excluded.url,
                     state = excluded.state,
                     labels_json = excluded.labels_json,
                     source_meta_json = excluded.source_meta_json,
                     source_updated_at = excluded.source_updated_at,
                     synced_at = excluded.synced_at
                 RETURNING id",
                params![
                    new_issue_id(),
                    input.project_name,
                    source,
                    input.source_issue_id,
                    input.title,
                    input.body,
                    input.url,
                    state,
                    labels_json,
                    meta_json,
                    source_updated,
                    now,
                ],
                |row| row.get(0),
            )?;
            Ok(id)
        })?;
        Ok(id)
    }

    pub fn get_issue(&self, id: &str) -> Result<Issue> {
        let issue = self.with_reader(|conn| {
            let issue = conn
                .query_row(
                    &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1"),
                    params![id],
                    issue_from_row,
                )
                .optional()?;
            Ok(issue)
        })?;
        issue.ok_or_else(|| StoreError::NotFound(format!("issue {id}")))
    }
}

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let source: String = row.get(2)?;
    let state: String = row.get(7)?;
    let labels_json: String = row.get(8)?;
    let meta_json: String = row.get(9)?;
    Ok(Issue {
        id: row.get(0)?,
        project_name: row.get(1)?,
        source: source.parse().unwrap_or(mender_core::issue::Source::Github),
        source_issue_id: row.get(3)?,
        title: row.get(4)?,
        body: row.get(5)?,
        url: row.get(6)?,
        state: state
            .parse()
            .unwrap_or(mender_core::issue::IssueState::Open),
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        source_meta: serde_json::from_str(&meta_json)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        source_updated_at: row.get(10)?,
        synced_at: row.get(11)?,
    })
}
