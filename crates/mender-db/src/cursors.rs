use crate::{Result, Store, now_rfc3339};
use mender_core::issue::Source;
use rusqlite::{OptionalExtension, params};

impl Store {
    /// Last-seen sync position for a (project, source) pair. `None` means
    /// the source has never been polled.
    pub fn get_cursor(&self, project: &str, source: Source) -> Result<Option<String>> {
        self.with_reader(|conn| {
            let cursor = conn
                .query_row(
                    "SELECT cursor_value FROM sync_cursors
                     WHERE project_name = ?1 AND source = ?2",
                    params![project, source.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(cursor)
        })
    }

    pub fn set_cursor(&self, project: &str, source: Source, cursor: &str) -> Result<()> {
        let now = now_rfc3339();
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO sync_cursors (project_name, source, cursor_value, last_synced_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (project_name, source) DO UPDATE SET
                     cursor_value = excluded.cursor_value,
                     last_synced_at = excluded.last_synced_at",
                params![project, source.as_str(), cursor, now],
            )?;
            Ok(())
        })
    }
}
