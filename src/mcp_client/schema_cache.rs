//! Persistent tool-schema cache.
//!
//! Stores each provider's discovered `ToolDescriptor` list as a JSON blob so
//! tool catalogs can be built before (or without) a live connection. WAL mode
//! is enabled so catalog reads don't block discovery writes.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::errors::McpError;
use super::types::ToolDescriptor;

// ─── Cache ───────────────────────────────────────────────────────────────────

/// SQLite-backed cache of tool schemas, keyed by provider name.
pub struct ToolSchemaCache {
    conn: Mutex<Connection>,
}

impl ToolSchemaCache {
    /// Open (or create) the cache at the given path.
    ///
    /// Pass `":memory:"` for an in-memory cache (tests).
    pub fn open(path: &str) -> Result<Self, McpError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tool_schemas (
                provider TEXT PRIMARY KEY,
                tools TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Replace the cached tool list for a provider.
    pub fn store(&self, provider: &str, tools: &[ToolDescriptor]) -> Result<(), McpError> {
        let json = serde_json::to_string(tools).map_err(|e| McpError::CacheError {
            reason: format!("failed to serialize tools for '{provider}': {e}"),
        })?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO tool_schemas (provider, tools, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(provider) DO UPDATE SET
                tools = excluded.tools,
                updated_at = excluded.updated_at",
            params![provider, json],
        )?;
        Ok(())
    }

    /// Cached tools for a provider, or `None` when nothing is stored.
    pub fn load(&self, provider: &str) -> Result<Option<Vec<ToolDescriptor>>, McpError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let json: Option<String> = conn
            .query_row(
                "SELECT tools FROM tool_schemas WHERE provider = ?1",
                params![provider],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| decode_tools(provider, &j)).transpose()
    }

    /// Drop the cached entry for a provider. Returns whether one existed.
    pub fn invalidate(&self, provider: &str) -> Result<bool, McpError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let removed = conn.execute(
            "DELETE FROM tool_schemas WHERE provider = ?1",
            params![provider],
        )?;
        Ok(removed > 0)
    }
}

fn decode_tools(provider: &str, json: &str) -> Result<Vec<ToolDescriptor>, McpError> {
    serde_json::from_str(json).map_err(|e| McpError::CacheError {
        reason: format!("corrupt cache entry for '{provider}': {e}"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
