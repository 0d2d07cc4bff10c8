//! SQLite-backed spec storage.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use mcpgate_core::{ServerSpec, TransportKind};

use crate::store::{Result, SpecStore, StoreError};

const COLUMNS: &str = "id, name, description, transport, command, args, env, working_dir, url, \
                       headers, timeout_secs, disabled";

/// A row as stored, before JSON columns are decoded.
struct SpecRow {
    id: String,
    name: String,
    description: Option<String>,
    transport: String,
    command: Option<String>,
    args: String,
    env: String,
    working_dir: Option<String>,
    url: Option<String>,
    headers: String,
    timeout_secs: i64,
    disabled: bool,
}

impl SpecRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            transport: row.get(3)?,
            command: row.get(4)?,
            args: row.get(5)?,
            env: row.get(6)?,
            working_dir: row.get(7)?,
            url: row.get(8)?,
            headers: row.get(9)?,
            timeout_secs: row.get(10)?,
            disabled: row.get(11)?,
        })
    }

    fn into_spec(self) -> Result<ServerSpec> {
        let transport: TransportKind =
            self.transport
                .parse()
                .map_err(|e: mcpgate_core::SpecError| StoreError::InvalidRecord {
                    id: self.id.clone(),
                    reason: e.to_string(),
                })?;
        let args: Vec<String> = serde_json::from_str(&self.args)?;
        let env: HashMap<String, String> = serde_json::from_str(&self.env)?;
        let headers: HashMap<String, String> = serde_json::from_str(&self.headers)?;

        Ok(ServerSpec {
            id: self.id,
            name: self.name,
            description: self.description,
            transport,
            command: self.command,
            args,
            env,
            working_dir: self.working_dir.map(PathBuf::from),
            url: self.url,
            headers,
            timeout_secs: u64::try_from(self.timeout_secs).unwrap_or_default(),
            disabled: self.disabled,
        })
    }
}

/// SQLite-backed spec storage.
pub struct SqliteSpecStore {
    /// Database connection (wrapped in mutex for thread safety).
    conn: Mutex<Connection>,
}

impl SqliteSpecStore {
    /// Open (or create) the database file at `path`.
    ///
    /// Creates parent directories and runs migrations if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        debug!(path = %path.display(), "Opened spec database");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Open store at the default data directory.
    pub fn open_default() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| StoreError::PathError("Could not find data directory".into()))?
            .join("mcpgate");
        Self::new(data_dir.join("servers.db"))
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Run database migrations.
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        let has_version_table: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
                [],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);

        let current_version: i32 = if has_version_table {
            conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )?
        } else {
            0
        };

        if current_version < 1 {
            conn.execute_batch(include_str!("../migrations/001_initial.sql"))?;
        }

        Ok(())
    }
}

#[async_trait]
impl SpecStore for SqliteSpecStore {
    async fn save(&self, spec: &ServerSpec) -> Result<()> {
        let args = serde_json::to_string(&spec.args)?;
        let env = serde_json::to_string(&spec.env)?;
        let headers = serde_json::to_string(&spec.headers)?;
        let working_dir = spec
            .working_dir
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let now = Utc::now().to_rfc3339();
        let timeout = i64::try_from(spec.timeout_secs).unwrap_or(i64::MAX);

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO servers (id, name, description, transport, command, args, env, \
             working_dir, url, headers, timeout_secs, disabled, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13) \
             ON CONFLICT(id) DO UPDATE SET \
                name = excluded.name, description = excluded.description, \
                transport = excluded.transport, command = excluded.command, \
                args = excluded.args, env = excluded.env, working_dir = excluded.working_dir, \
                url = excluded.url, headers = excluded.headers, \
                timeout_secs = excluded.timeout_secs, disabled = excluded.disabled, \
                updated_at = excluded.updated_at",
            params![
                spec.id,
                spec.name,
                spec.description,
                spec.transport.as_str(),
                spec.command,
                args,
                env,
                working_dir,
                spec.url,
                headers,
                timeout,
                spec.disabled,
                now,
            ],
        )?;

        debug!(server = %spec.id, disabled = spec.disabled, "Saved server spec");
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<ServerSpec>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM servers ORDER BY id", COLUMNS))?;
            let rows = stmt
                .query_map([], SpecRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter().map(SpecRow::into_spec).collect()
    }

    async fn exists_by_id(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row("SELECT 1 FROM servers WHERE id = ?1", [id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM servers WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }
}
