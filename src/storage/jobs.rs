// LibriSplit - Chapter-aware audiobook splitter
// Copyright (C) 2025 Henning Berge
//
// This program works alongside Libation (https://github.com/rmcrackan/Libation)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Persisted job records
//!
//! Each save is one `INSERT ... ON CONFLICT DO UPDATE` of a single row, so a
//! crash leaves either the old or the new record, never a mix.

use crate::error::{Result, SplitError};
use crate::jobs::state::{JobRecord, JobState};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

/// Key-value store of job records, keyed by book id
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load a book's record, `None` when the book was never seen
    pub async fn load(&self, book_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM JobRecords WHERE book_id = ?")
            .bind(book_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record).transpose()
    }

    /// Insert or replace a record; durable when this returns
    pub async fn save(&self, record: &JobRecord) -> Result<()> {
        let committed = serde_json::to_string(&record.committed_parts)?;
        let failure_reason = record.failure().map(str::to_string);

        sqlx::query(
            r#"
            INSERT INTO JobRecords (
                book_id, title, total_parts, max_part_ms, state, state_part,
                failure_reason, committed_parts, output_name, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(book_id) DO UPDATE SET
                title = excluded.title,
                total_parts = excluded.total_parts,
                max_part_ms = excluded.max_part_ms,
                state = excluded.state,
                state_part = excluded.state_part,
                failure_reason = excluded.failure_reason,
                committed_parts = excluded.committed_parts,
                output_name = excluded.output_name,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.book_id)
        .bind(&record.title)
        .bind(record.total_parts as i64)
        .bind(record.max_part_ms as i64)
        .bind(record.state.as_str())
        .bind(record.state.part().map(|k| k as i64))
        .bind(failure_reason)
        .bind(committed)
        .bind(&record.output_name)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All records, most recently updated first
    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT * FROM JobRecords ORDER BY updated_at DESC, book_id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Records in the given state
    pub async fn list_by_state(&self, state: &JobState) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT * FROM JobRecords WHERE state = ? ORDER BY book_id")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Book other than `book_id` whose parts use `output_name`
    ///
    /// Names are compared case-insensitively, like most desktop filesystems do.
    pub async fn output_name_owner(&self, output_name: &str, book_id: &str) -> Result<Option<String>> {
        let owner: Option<String> = sqlx::query_scalar(
            "SELECT book_id FROM JobRecords \
             WHERE output_name = ? COLLATE NOCASE AND book_id != ? \
             ORDER BY book_id LIMIT 1",
        )
        .bind(output_name)
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(owner)
    }

    /// Forget a book; returns whether a record existed
    pub async fn delete(&self, book_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM JobRecords WHERE book_id = ?")
            .bind(book_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Forget every book; returns how many records were removed
    pub async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM JobRecords")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<JobRecord> {
    let book_id: String = row.try_get("book_id")?;
    let corrupt = |reason: String| SplitError::CorruptJobRecord {
        book_id: book_id.clone(),
        reason,
    };

    let state_name: String = row.try_get("state")?;
    let state_part: Option<i64> = row.try_get("state_part")?;
    let failure_reason: Option<String> = row.try_get("failure_reason")?;
    let state = JobState::from_parts(
        &state_name,
        state_part.and_then(|k| u32::try_from(k).ok()),
        failure_reason,
    )
    .ok_or_else(|| corrupt(format!("unknown state '{}' ({:?})", state_name, state_part)))?;

    let committed_json: String = row.try_get("committed_parts")?;
    let committed_parts: BTreeSet<u32> = serde_json::from_str(&committed_json)
        .map_err(|e| corrupt(format!("committed parts: {}", e)))?;

    let updated_at: String = row.try_get("updated_at")?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("timestamp: {}", e)))?;

    Ok(JobRecord {
        title: row.try_get("title")?,
        total_parts: row.try_get::<i64, _>("total_parts")? as u32,
        max_part_ms: row.try_get::<i64, _>("max_part_ms")? as u64,
        state,
        committed_parts,
        output_name: row.try_get("output_name")?,
        updated_at,
        book_id,
    })
}
