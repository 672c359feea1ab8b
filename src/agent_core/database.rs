//! SQLite database for the tool transcript and stream outcomes.
//!
//! Uses `rusqlite` in synchronous mode behind a mutex; writes are small and
//! happen once per tool call or stream end. WAL mode is enabled so readers
//! never block the loop.

use std::sync::Mutex;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::errors::AgentError;

// ─── Types ──────────────────────────────────────────────────────────────────

/// A tool invocation to append to the transcript.
#[derive(Debug, Clone)]
pub struct NewTranscriptEntry<'a> {
    pub channel_id: &'a str,
    pub cycle: u32,
    pub provider: &'a str,
    pub tool_name: &'a str,
    pub arguments: &'a serde_json::Value,
    pub result: &'a str,
    pub is_error: bool,
    /// [`AgentError::kind`] of a failed call.
    pub error_kind: Option<&'a str>,
    pub execution_time_ms: u64,
}

/// A stored transcript row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: i64,
    pub channel_id: String,
    pub timestamp: String,
    pub cycle: u32,
    pub provider: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: String,
    pub is_error: bool,
    pub error_kind: Option<String>,
    pub execution_time_ms: u64,
}

/// A finished stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRun {
    pub channel_id: String,
    pub model: String,
    pub status: String,
    pub tool_calls: u32,
    pub started_at: String,
    pub finished_at: String,
}

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database handle for the agent core.
pub struct AgentDatabase {
    conn: Mutex<Connection>,
}

impl AgentDatabase {
    /// Open (or create) the agent database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tool_transcript (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                cycle INTEGER NOT NULL,
                provider TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                result TEXT NOT NULL,
                is_error INTEGER NOT NULL DEFAULT 0,
                error_kind TEXT,
                execution_time_ms INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_transcript_channel
                ON tool_transcript(channel_id, id);

            CREATE TABLE IF NOT EXISTS stream_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL,
                tool_calls INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_runs_channel
                ON stream_runs(channel_id);
            ",
        )?;
        Ok(())
    }

    // ─── Transcript ─────────────────────────────────────────────────────

    /// Append one tool invocation. Returns the row id.
    pub fn insert_transcript_entry(&self, entry: &NewTranscriptEntry<'_>) -> Result<i64, AgentError> {
        let args_json = serde_json::to_string(entry.arguments)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tool_transcript
             (channel_id, cycle, provider, tool_name, arguments, result,
              is_error, error_kind, execution_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.channel_id,
                entry.cycle,
                entry.provider,
                entry.tool_name,
                args_json,
                entry.result,
                entry.is_error as i32,
                entry.error_kind,
                entry.execution_time_ms as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Transcript for one channel, oldest first.
    pub fn get_transcript(&self, channel_id: &str) -> Result<Vec<TranscriptEntry>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, channel_id, timestamp, cycle, provider, tool_name,
                    arguments, result, is_error, error_kind, execution_time_ms
             FROM tool_transcript
             WHERE channel_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![channel_id], |row| {
            Ok(TranscriptEntry {
                id: row.get(0)?,
                channel_id: row.get(1)?,
                timestamp: row.get(2)?,
                cycle: row.get(3)?,
                provider: row.get(4)?,
                tool_name: row.get(5)?,
                arguments: parse_json_value(row.get::<_, String>(6)?),
                result: row.get(7)?,
                is_error: row.get::<_, i32>(8)? != 0,
                error_kind: row.get(9)?,
                execution_time_ms: row.get::<_, i64>(10)? as u64,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // ─── Stream Runs ────────────────────────────────────────────────────

    /// Record how a stream ended.
    pub fn insert_stream_run(
        &self,
        channel_id: &str,
        model: &str,
        status: &str,
        tool_calls: u32,
        started_at: &str,
    ) -> Result<(), AgentError> {
        self.conn().execute(
            "INSERT INTO stream_runs (channel_id, model, status, tool_calls, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![channel_id, model, status, tool_calls, started_at],
        )?;
        Ok(())
    }

    /// Runs for one channel, oldest first.
    pub fn get_stream_runs(&self, channel_id: &str) -> Result<Vec<StreamRun>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT channel_id, model, status, tool_calls, started_at, finished_at
             FROM stream_runs
             WHERE channel_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![channel_id], |row| {
            Ok(StreamRun {
                channel_id: row.get(0)?,
                model: row.get(1)?,
                status: row.get(2)?,
                tool_calls: row.get(3)?,
                started_at: row.get(4)?,
                finished_at: row.get(5)?,
            })
        })?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Parse a JSON string into a serde_json::Value, defaulting to null.
fn parse_json_value(json: String) -> serde_json::Value {
    serde_json::from_str(&json).unwrap_or(serde_json::Value::Null)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> AgentDatabase {
        AgentDatabase::open(":memory:").unwrap()
    }

    #[test]
    fn test_transcript_roundtrip_in_order() {
        let db = test_db();
        let args = serde_json::json!({"path": "/tmp"});

        for (cycle, tool) in [(1, "list_directory"), (2, "read_file")] {
            db.insert_transcript_entry(&NewTranscriptEntry {
                channel_id: "c1",
                cycle,
                provider: "fs",
                tool_name: tool,
                arguments: &args,
                result: "ok",
                is_error: cycle == 2,
                error_kind: (cycle == 2).then_some("provider_unreachable"),
                execution_time_ms: 12,
            })
            .unwrap();
        }

        let entries = db.get_transcript("c1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tool_name, "list_directory");
        assert_eq!(entries[0].arguments["path"], "/tmp");
        assert!(!entries[0].is_error);
        assert!(entries[1].is_error);
        assert_eq!(entries[0].error_kind, None);
        assert_eq!(entries[1].error_kind.as_deref(), Some("provider_unreachable"));
        assert_eq!(entries[1].cycle, 2);
        assert!(db.get_transcript("other").unwrap().is_empty());
    }

    #[test]
    fn test_stream_runs() {
        let db = test_db();
        db.insert_stream_run("c1", "llama3.1", "completed", 3, "2024-01-01T00:00:00Z")
            .unwrap();
        let runs = db.get_stream_runs("c1").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].tool_calls, 3);
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.db");
        let path = path.to_str().unwrap();
        AgentDatabase::open(path)
            .unwrap()
            .insert_stream_run("c1", "m", "cancelled", 0, "t")
            .unwrap();
        assert_eq!(AgentDatabase::open(path).unwrap().get_stream_runs("c1").unwrap().len(), 1);
    }
}
