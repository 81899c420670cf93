//! SQLite-backed execution history.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use cadence_core::history::retention_cutoff;
use cadence_core::{ExecutionRecordSink, PipelineExecutionRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HistoryStore {
    db_path: PathBuf,
    max_items: usize,
}

impl HistoryStore {
    pub fn default_db_path() -> PathBuf {
        crate::settings::data_dir().join("cadence.db")
    }

    pub fn new(db_path: impl Into<PathBuf>, max_items: usize) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = Self {
            db_path,
            max_items: max_items.max(1),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> anyhow::Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("opening {}", self.db_path.display()))
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS execution_history (
              id TEXT PRIMARY KEY,
              created_at INTEGER NOT NULL,
              run_id TEXT NOT NULL,
              pipeline_name TEXT NOT NULL,
              status TEXT NOT NULL,
              final_text TEXT NOT NULL,
              record_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_created_at ON execution_history(created_at DESC);
            "#,
        )?;
        Ok(())
    }

    pub fn count(&self) -> anyhow::Result<usize> {
        let conn = self.open()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM execution_history", [], |row| {
            row.get(0)
        })?;
        Ok(n as usize)
    }

    /// Case-insensitive substring match on the final text, newest first.
    pub fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<PipelineExecutionRecord>> {
        let query = query.trim();
        if query.is_empty() {
            return self.recent(limit);
        }
        let pattern = format!("%{}%", escape_like(query));
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT record_json FROM execution_history
             WHERE final_text LIKE ?1 ESCAPE '\\'
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, clamp_limit(limit)], read_json)?;
        collect_records(rows)
    }

    pub fn clear(&self) -> anyhow::Result<usize> {
        let conn = self.open()?;
        Ok(conn.execute("DELETE FROM execution_history", [])?)
    }

    fn enforce_max_items(&self, conn: &Connection) -> anyhow::Result<usize> {
        let dropped = conn.execute(
            "DELETE FROM execution_history WHERE id NOT IN
             (SELECT id FROM execution_history ORDER BY created_at DESC LIMIT ?1)",
            params![self.max_items as i64],
        )?;
        if dropped > 0 {
            debug!(dropped, max_items = self.max_items, "history trimmed");
        }
        Ok(dropped)
    }
}

impl ExecutionRecordSink for HistoryStore {
    fn save(&self, record: &PipelineExecutionRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(record)?;
        let summary = &record.summary;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO execution_history
            (id, created_at, run_id, pipeline_name, status, final_text, record_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id,
                record.recorded_at.timestamp_millis(),
                summary.run_id,
                summary.pipeline_name,
                summary.status.as_str(),
                summary.final_text,
                json
            ],
        )?;
        self.enforce_max_items(&conn)?;
        Ok(())
    }

    fn get(&self, id: &str) -> anyhow::Result<Option<PipelineExecutionRecord>> {
        let conn = self.open()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM execution_history WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|raw| serde_json::from_str(&raw).context("decoding history record"))
            .transpose()
    }

    fn recent(&self, limit: usize) -> anyhow::Result<Vec<PipelineExecutionRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT record_json FROM execution_history ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![clamp_limit(limit)], read_json)?;
        collect_records(rows)
    }

    fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PipelineExecutionRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT record_json FROM execution_history
             WHERE created_at >= ?1 AND created_at < ?2
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(
            params![from.timestamp_millis(), to.timestamp_millis()],
            read_json,
        )?;
        collect_records(rows)
    }

    fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.open()?;
        Ok(conn.execute("DELETE FROM execution_history WHERE id = ?1", params![id])? > 0)
    }

    fn prune(&self, retention_days: u32) -> anyhow::Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = retention_cutoff(retention_days);
        let conn = self.open()?;
        let changed = conn.execute(
            "DELETE FROM execution_history WHERE created_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(changed)
    }
}

fn read_json(row: &Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}

/// Rows that no longer decode are skipped.
fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<String>>,
) -> anyhow::Result<Vec<PipelineExecutionRecord>> {
    let mut out = Vec::new();
    for raw in rows {
        match serde_json::from_str(&raw?) {
            Ok(record) => out.push(record),
            Err(e) => debug!("skipping undecodable history row: {e}"),
        }
    }
    Ok(out)
}

fn clamp_limit(limit: usize) -> i64 {
    limit.clamp(1, 5_000) as i64
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
