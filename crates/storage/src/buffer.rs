#![forbid(unsafe_code)]

//! Pending-artifact buffer.
//!
//! Watchers append items here; a dispatch consumes them atomically with its
//! own `building` transition. The running character total lives on the
//! singleton row so the dispatch-trigger check is one read.

use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, params, params_from_iter};

use crate::{StateStore, StoreError, now_iso};

/// Kind of a pending artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemKind {
    Doc,
    Issue,
    Prompts,
    Drift,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Doc => "doc",
            Self::Issue => "issue",
            Self::Prompts => "prompts",
            Self::Drift => "drift",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "doc" => Some(Self::Doc),
            "issue" => Some(Self::Issue),
            "prompts" => Some(Self::Prompts),
            "drift" => Some(Self::Drift),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BufferItem {
    pub id: i64,
    pub path: String,
    pub kind: ItemKind,
    pub chars: i64,
    pub date: Option<String>,
    pub drift_type: Option<String>,
    pub added_at: String,
    pub metadata: Option<String>,
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<BufferItem> {
    let kind_str: String = row.get(2)?;
    Ok(BufferItem {
        id: row.get(0)?,
        path: row.get(1)?,
        kind: ItemKind::parse(&kind_str).unwrap_or(ItemKind::Doc),
        chars: row.get(3)?,
        date: row.get(4)?,
        drift_type: row.get(5)?,
        added_at: row.get(6)?,
        metadata: row.get(7)?,
    })
}

const ITEM_COLUMNS: &str = "id, path, item_type, chars, date, drift_type, added_at, metadata";

impl StateStore {
    /// Insert a pending item and bump the running character total.
    pub fn buffer_append(
        &mut self,
        path: &str,
        kind: ItemKind,
        chars: i64,
        date: Option<&str>,
        drift_type: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<i64, StoreError> {
        if path.trim().is_empty() {
            return Err(StoreError::InvalidInput("buffer path must not be empty"));
        }
        let now = now_iso();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO buffer_items (path, item_type, chars, date, drift_type, added_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![path, kind.as_str(), chars, date, drift_type, now, metadata],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE server_state SET buffer_chars_total = buffer_chars_total + ?1 WHERE id = 1",
            params![chars],
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// All pending items, ordered by date then insertion order.
    pub fn buffer_items(&self) -> Result<Vec<BufferItem>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM buffer_items ORDER BY date, id"
        ))?;
        let items = stmt
            .query_map([], row_to_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn buffer_contains(&self, path: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM buffer_items WHERE path = ?1 LIMIT 1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn buffer_chars(&self) -> Result<i64, StoreError> {
        let total: i64 = self.conn.query_row(
            "SELECT buffer_chars_total FROM server_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Remove specific items by id, returning them. The character total is
    /// adjusted in the same transaction.
    pub fn buffer_consume(&mut self, item_ids: &[i64]) -> Result<Vec<BufferItem>, StoreError> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = std::iter::repeat("?")
            .take(item_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let id_params: Vec<SqlValue> = item_ids.iter().map(|id| SqlValue::Integer(*id)).collect();

        let tx = self.conn.transaction()?;
        let items = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM buffer_items WHERE id IN ({placeholders}) \
                 ORDER BY date, id"
            ))?;
            let rows = stmt
                .query_map(params_from_iter(id_params.iter()), row_to_item)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let removed_chars: i64 = items.iter().map(|item| item.chars).sum();
        tx.execute(
            &format!("DELETE FROM buffer_items WHERE id IN ({placeholders})"),
            params_from_iter(id_params.iter()),
        )?;
        tx.execute(
            "UPDATE server_state SET buffer_chars_total = MAX(0, buffer_chars_total - ?1) \
             WHERE id = 1",
            params![removed_chars],
        )?;
        tx.commit()?;
        Ok(items)
    }

    /// Remove every item dated strictly before `day` (plus undated items),
    /// returning the consumed rows.
    pub fn buffer_consume_before(&mut self, day: &str) -> Result<Vec<BufferItem>, StoreError> {
        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare(
                "SELECT id FROM buffer_items WHERE date IS NULL OR substr(date, 1, 10) < ?1",
            )?;
            let rows = stmt
                .query_map(params![day], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            rows
        };
        self.buffer_consume(&ids)
    }

    /// Drop every pending item and zero the total. Returns removed count.
    pub fn buffer_clear(&mut self) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM buffer_items", [])?;
        tx.execute(
            "UPDATE server_state SET buffer_chars_total = 0 WHERE id = 1",
            [],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}
