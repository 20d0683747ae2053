#![forbid(unsafe_code)]

//! Dispatch lifecycle rows.
//!
//! One row per fold-agent invocation:
//! `building → dispatched → validated → committed`, with
//! `dispatched → retry → dispatched` (bounded) and `dispatched → failed` as
//! the alternative edges. Terminal states are `committed` and `failed`; the
//! single-writer dispatcher keeps at most one row non-terminal, and startup
//! recovery drains anything a crash left behind.

use rusqlite::{OptionalExtension, params};

use crate::{StateStore, StoreError, now_iso};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Building,
    Dispatched,
    Validated,
    Committed,
    Retry,
    Failed,
}

impl DispatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Dispatched => "dispatched",
            Self::Validated => "validated",
            Self::Committed => "committed",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "building" => Some(Self::Building),
            "dispatched" => Some(Self::Dispatched),
            "validated" => Some(Self::Validated),
            "committed" => Some(Self::Committed),
            "retry" => Some(Self::Retry),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }
}

#[derive(Clone, Debug)]
pub struct DispatchRow {
    pub id: i64,
    pub chunk_id: i64,
    pub chunk_type: String,
    pub state: DispatchState,
    pub retry_count: i64,
    pub input_path: Option<String>,
    pub prompt_path: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const DISPATCH_COLUMNS: &str =
    "id, chunk_id, chunk_type, state, retry_count, input_path, prompt_path, error, \
     created_at, updated_at";

fn row_to_dispatch(row: &rusqlite::Row<'_>) -> rusqlite::Result<DispatchRow> {
    let state_str: String = row.get(3)?;
    Ok(DispatchRow {
        id: row.get(0)?,
        chunk_id: row.get(1)?,
        chunk_type: row.get(2)?,
        state: DispatchState::parse(&state_str).unwrap_or(DispatchState::Failed),
        retry_count: row.get(4)?,
        input_path: row.get(5)?,
        prompt_path: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl StateStore {
    /// Create a dispatch record in `building` state. Returns the row id.
    pub fn dispatch_begin(
        &mut self,
        chunk_id: i64,
        chunk_type: &str,
        input_path: Option<&str>,
        prompt_path: Option<&str>,
    ) -> Result<i64, StoreError> {
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO dispatches \
             (chunk_id, chunk_type, state, retry_count, input_path, prompt_path, \
              created_at, updated_at) \
             VALUES (?1, ?2, 'building', 0, ?3, ?4, ?5, ?5)",
            params![chunk_id, chunk_type, input_path, prompt_path, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Transition a dispatch to a new state, replacing its error text.
    pub fn dispatch_set_state(
        &mut self,
        dispatch_id: i64,
        state: DispatchState,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE dispatches SET state = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            params![state.as_str(), error, now_iso(), dispatch_id],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownDispatch(dispatch_id));
        }
        Ok(())
    }

    /// Increment the retry counter. Returns the new count.
    pub fn dispatch_bump_retry(&mut self, dispatch_id: i64) -> Result<i64, StoreError> {
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE dispatches SET retry_count = retry_count + 1, updated_at = ?1 WHERE id = ?2",
            params![now_iso(), dispatch_id],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownDispatch(dispatch_id));
        }
        let count: i64 = tx.query_row(
            "SELECT retry_count FROM dispatches WHERE id = ?1",
            params![dispatch_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(count)
    }

    pub fn dispatch_get(&self, dispatch_id: i64) -> Result<Option<DispatchRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {DISPATCH_COLUMNS} FROM dispatches WHERE id = ?1"),
                params![dispatch_id],
                row_to_dispatch,
            )
            .optional()?)
    }

    /// All rows in non-terminal states, oldest first (for crash recovery).
    pub fn non_terminal_dispatches(&self) -> Result<Vec<DispatchRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatches \
             WHERE state NOT IN ('committed', 'failed') ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], row_to_dispatch)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_dispatches(&self, limit: usize) -> Result<Vec<DispatchRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatches ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit.clamp(1, 200) as i64], row_to_dispatch)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn last_dispatch(&self) -> Result<Option<DispatchRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {DISPATCH_COLUMNS} FROM dispatches ORDER BY id DESC LIMIT 1"),
                [],
                row_to_dispatch,
            )
            .optional()?)
    }

    /// Startup recovery sweep.
    ///
    /// `building` rows have no side effects yet and are discarded; the next
    /// iteration rebuilds from the buffer. `dispatched` and `validated` rows
    /// are returned for the dispatcher to recover — never silently dropped.
    pub fn recover_on_startup(&mut self) -> Result<Vec<DispatchRow>, StoreError> {
        let non_terminal = self.non_terminal_dispatches()?;
        if non_terminal.is_empty() {
            return Ok(Vec::new());
        }

        let tx = self.conn.transaction()?;
        for dispatch in &non_terminal {
            if dispatch.state == DispatchState::Building {
                tx.execute("DELETE FROM dispatches WHERE id = ?1", params![dispatch.id])?;
            }
        }
        tx.commit()?;

        Ok(non_terminal
            .into_iter()
            .filter(|d| {
                matches!(
                    d.state,
                    DispatchState::Dispatched | DispatchState::Validated | DispatchState::Retry
                )
            })
            .collect())
    }
}
