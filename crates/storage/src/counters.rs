#![forbid(unsafe_code)]

//! Monotonic per-category identifier counters.
//!
//! Each row of `id_counters` stores the *next available* numeric id for a
//! category. Counters only move forward; a reservation of `k` ids returns
//! `[next, next+k)` and bumps the counter atomically. Ids are never reused,
//! even after the entry that used them is deleted.

use engram_core::IdCategory;
use rusqlite::{OptionalExtension, params};

use crate::{StateStore, StoreError};

/// A reserved half-open range of numeric ids `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdRange {
    pub category: IdCategory,
    pub start: i64,
    pub end: i64,
}

impl IdRange {
    pub fn len(&self) -> usize {
        (self.end - self.start).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Formatted identifier strings, e.g. `["C042", "C043"]`.
    pub fn formatted(&self) -> Vec<String> {
        (self.start..self.end)
            .map(|n| self.category.format_id(n))
            .collect()
    }
}

impl StateStore {
    /// Atomically reserve `k` sequential ids for `category`.
    pub fn reserve_ids(&mut self, category: IdCategory, k: usize) -> Result<IdRange, StoreError> {
        if k == 0 {
            return Err(StoreError::InvalidInput("reservation count must be >= 1"));
        }
        let k = k as i64;

        let tx = self.conn.transaction()?;
        let start: Option<i64> = tx
            .query_row(
                "SELECT next_id FROM id_counters WHERE category = ?1",
                params![category.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let start = match start {
            Some(n) => n,
            None => {
                tx.execute(
                    "INSERT INTO id_counters (category, next_id) VALUES (?1, 1)",
                    params![category.as_str()],
                )?;
                1
            }
        };
        tx.execute(
            "UPDATE id_counters SET next_id = ?1 WHERE category = ?2",
            params![start + k, category.as_str()],
        )?;
        tx.commit()?;

        Ok(IdRange {
            category,
            start,
            end: start + k,
        })
    }

    /// Raise the counter floor and reserve `k` ids in one transaction.
    ///
    /// Equivalent to `bump_counter_floor` followed by `reserve_ids`, but a
    /// crash between the two cannot be observed.
    pub fn reserve_ids_with_floor(
        &mut self,
        category: IdCategory,
        min_next: i64,
        k: usize,
    ) -> Result<IdRange, StoreError> {
        if k == 0 {
            return Err(StoreError::InvalidInput("reservation count must be >= 1"));
        }
        let k = k as i64;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO id_counters (category, next_id) VALUES (?1, ?2)
             ON CONFLICT(category) DO UPDATE SET next_id = MAX(next_id, excluded.next_id)",
            params![category.as_str(), min_next.max(1)],
        )?;
        let start: i64 = tx.query_row(
            "SELECT next_id FROM id_counters WHERE category = ?1",
            params![category.as_str()],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE id_counters SET next_id = ?1 WHERE category = ?2",
            params![start + k, category.as_str()],
        )?;
        tx.commit()?;

        Ok(IdRange {
            category,
            start,
            end: start + k,
        })
    }

    /// Raise a counter so that `next_id >= min_next`. Never lowers it.
    ///
    /// Used before each reservation to guarantee the counter sits above every
    /// id already present in the living docs, so counters and docs cannot
    /// collide after an external edit.
    pub fn bump_counter_floor(
        &mut self,
        category: IdCategory,
        min_next: i64,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO id_counters (category, next_id) VALUES (?1, ?2)
             ON CONFLICT(category) DO UPDATE SET next_id = MAX(next_id, excluded.next_id)",
            params![category.as_str(), min_next.max(1)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The next available id number for `category`, without advancing.
    pub fn peek_counter(&self, category: IdCategory) -> Result<i64, StoreError> {
        let next: Option<i64> = self
            .conn
            .query_row(
                "SELECT next_id FROM id_counters WHERE category = ?1",
                params![category.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(next.unwrap_or(1))
    }
}
