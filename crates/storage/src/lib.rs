#![forbid(unsafe_code)]

//! Durable state for engram: a single SQLite file co-located with the project
//! under `.engram/engram.db`.
//!
//! Four tables: `id_counters` (monotonic per-category identifier counters),
//! `buffer_items` (pending artifacts accumulated by the watchers),
//! `dispatches` (fold-agent dispatch lifecycle), and `server_state`
//! (singleton row with polling bookmarks, the fold-from marker, and the L0
//! staleness flag). All multi-step updates run in one transaction.

mod buffer;
mod counters;
mod dispatches;
mod state;

pub use buffer::{BufferItem, ItemKind};
pub use counters::IdRange;
pub use dispatches::{DispatchRow, DispatchState};
pub use state::ServerState;

use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

pub const DB_FILE: &str = "engram.db";

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    UnknownDispatch(i64),
    InvalidStateTransition { from: String, to: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::UnknownDispatch(id) => write!(f, "unknown dispatch id {id}"),
            Self::InvalidStateTransition { from, to } => {
                write!(f, "invalid dispatch transition {from} -> {to}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

/// Handle to the engram state store. Single writer by design; every
/// multi-row update runs inside one SQLite transaction.
#[derive(Debug)]
pub struct StateStore {
    engram_dir: PathBuf,
    conn: Connection,
}

impl StateStore {
    /// Open (or create) the store under `.engram/`.
    ///
    /// Tolerates the legacy key/value `server_state` shape left behind by the
    /// old migration tool: the `fold_from` value is read out, the table is
    /// rebuilt in the canonical single-row shape, and the value is restored.
    pub fn open(engram_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let engram_dir = engram_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&engram_dir)?;
        let conn = Connection::open(engram_dir.join(DB_FILE))?;
        let store = Self { engram_dir, conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn engram_dir(&self) -> &Path {
        &self.engram_dir
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;

        let legacy_fold_from = self.migrate_legacy_server_state()?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS id_counters (
              category TEXT PRIMARY KEY,
              next_id  INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS buffer_items (
              id          INTEGER PRIMARY KEY AUTOINCREMENT,
              path        TEXT NOT NULL,
              item_type   TEXT NOT NULL,
              chars       INTEGER NOT NULL DEFAULT 0,
              date        TEXT,
              drift_type  TEXT,
              added_at    TEXT NOT NULL,
              metadata    TEXT
            );

            CREATE TABLE IF NOT EXISTS dispatches (
              id          INTEGER PRIMARY KEY AUTOINCREMENT,
              chunk_id    INTEGER NOT NULL,
              chunk_type  TEXT NOT NULL DEFAULT 'fold',
              state       TEXT NOT NULL DEFAULT 'building',
              retry_count INTEGER NOT NULL DEFAULT 0,
              input_path  TEXT,
              prompt_path TEXT,
              error       TEXT,
              created_at  TEXT NOT NULL,
              updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS server_state (
              id                  INTEGER PRIMARY KEY CHECK (id = 1),
              last_poll_commit    TEXT,
              last_poll_time      TEXT,
              last_dispatch_time  TEXT,
              buffer_chars_total  INTEGER NOT NULL DEFAULT 0,
              last_session_mtime  INTEGER,
              last_session_offset INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;

        // Columns added after the first release; tolerated on old files.
        add_column_if_missing(&self.conn, "server_state", "fold_from", "TEXT")?;
        add_column_if_missing(&self.conn, "server_state", "l0_stale", "INTEGER DEFAULT 0")?;
        add_column_if_missing(
            &self.conn,
            "server_state",
            "last_session_offset",
            "INTEGER DEFAULT 0",
        )?;
        add_column_if_missing(&self.conn, "dispatches", "chunk_type", "TEXT DEFAULT 'fold'")?;

        self.conn.execute(
            "INSERT OR IGNORE INTO server_state (id, buffer_chars_total) VALUES (1, 0)",
            [],
        )?;

        for category in engram_core::IdCategory::ALL {
            self.conn.execute(
                "INSERT OR IGNORE INTO id_counters (category, next_id) VALUES (?1, 1)",
                params![category.as_str()],
            )?;
        }

        if let Some(fold_from) = legacy_fold_from {
            self.conn.execute(
                "UPDATE server_state SET fold_from = ?1 WHERE id = 1",
                params![fold_from],
            )?;
        }

        Ok(())
    }

    /// Detect and remove the legacy key/value `server_state` schema,
    /// returning its `fold_from` value when present.
    fn migrate_legacy_server_state(&self) -> Result<Option<String>, StoreError> {
        let mut stmt = self.conn.prepare("PRAGMA table_info(server_state)")?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        if columns.is_empty() {
            return Ok(None); // table doesn't exist yet
        }
        if !columns.iter().any(|c| c == "key") || columns.iter().any(|c| c == "id") {
            return Ok(None); // already the singleton shape
        }

        let legacy_fold_from: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM server_state WHERE key = 'fold_from'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        self.conn.execute("DROP TABLE server_state", [])?;
        Ok(legacy_fold_from)
    }
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), StoreError> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(err) if is_duplicate_column(&err) => Ok(()),
        Err(err) => Err(StoreError::Sql(err)),
    }
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => {
            message.contains("duplicate column name")
        }
        _ => false,
    }
}

/// Current UTC time as an RFC 3339 string (second precision).
pub(crate) fn now_iso() -> String {
    let now = time::OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
