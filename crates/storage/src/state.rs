#![forbid(unsafe_code)]

//! Singleton server-state row: polling bookmarks, the fold-from marker, and
//! the L0 staleness flag.
//!
//! Crash-safe ordering contract (enforced by the dispatcher): `l0_stale` is
//! set **before** a dispatch transitions `validated → committed`, so a crash
//! between the two leaves a recoverable dispatch whose staleness flag is
//! already durable.

use rusqlite::params;

use crate::{StateStore, StoreError, now_iso};

/// Snapshot of the singleton row for status display.
#[derive(Clone, Debug, Default)]
pub struct ServerState {
    pub last_poll_commit: Option<String>,
    pub last_poll_time: Option<String>,
    pub last_dispatch_time: Option<String>,
    pub buffer_chars_total: i64,
    pub last_session_mtime: Option<i64>,
    pub last_session_offset: i64,
    pub fold_from: Option<String>,
    pub l0_stale: bool,
}

impl StateStore {
    pub fn server_state(&self) -> Result<ServerState, StoreError> {
        let state = self.conn.query_row(
            "SELECT last_poll_commit, last_poll_time, last_dispatch_time, buffer_chars_total, \
                    last_session_mtime, last_session_offset, fold_from, l0_stale \
             FROM server_state WHERE id = 1",
            [],
            |row| {
                Ok(ServerState {
                    last_poll_commit: row.get(0)?,
                    last_poll_time: row.get(1)?,
                    last_dispatch_time: row.get(2)?,
                    buffer_chars_total: row.get(3)?,
                    last_session_mtime: row.get(4)?,
                    last_session_offset: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    fold_from: row.get(6)?,
                    l0_stale: row.get::<_, Option<i64>>(7)?.unwrap_or(0) != 0,
                })
            },
        )?;
        Ok(state)
    }

    pub fn fold_from(&self) -> Result<Option<String>, StoreError> {
        let value: Option<String> = self.conn.query_row(
            "SELECT fold_from FROM server_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    pub fn set_fold_from(&self, day: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE server_state SET fold_from = ?1 WHERE id = 1",
            params![day],
        )?;
        Ok(())
    }

    pub fn clear_fold_from(&self) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE server_state SET fold_from = NULL WHERE id = 1", [])?;
        Ok(())
    }

    pub fn l0_stale(&self) -> Result<bool, StoreError> {
        let value: Option<i64> = self.conn.query_row(
            "SELECT l0_stale FROM server_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(value.unwrap_or(0) != 0)
    }

    pub fn mark_l0_stale(&self) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE server_state SET l0_stale = 1 WHERE id = 1", [])?;
        Ok(())
    }

    pub fn clear_l0_stale(&self) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE server_state SET l0_stale = 0 WHERE id = 1", [])?;
        Ok(())
    }

    pub fn set_last_poll_commit(&self, commit: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE server_state SET last_poll_commit = ?1 WHERE id = 1",
            params![commit],
        )?;
        Ok(())
    }

    pub fn touch_last_poll_time(&self) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE server_state SET last_poll_time = ?1 WHERE id = 1",
            params![now_iso()],
        )?;
        Ok(())
    }

    pub fn touch_last_dispatch_time(&self) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE server_state SET last_dispatch_time = ?1 WHERE id = 1",
            params![now_iso()],
        )?;
        Ok(())
    }

    pub fn set_session_bookmarks(
        &self,
        mtime: Option<i64>,
        offset: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE server_state SET last_session_mtime = ?1, last_session_offset = ?2 \
             WHERE id = 1",
            params![mtime, offset],
        )?;
        Ok(())
    }
}
