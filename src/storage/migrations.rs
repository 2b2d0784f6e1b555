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


//! Database migrations
//!
//! Migrations are plain SQL run at startup and tracked in the `_migrations`
//! table, so no build-time database connection is needed.

use crate::error::Result;
use sqlx::{Executor, SqlitePool};

/// Number of migrations defined below
pub const MIGRATION_COUNT: usize = 2;

/// Run all database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_migrations_table(pool).await?;

    run_migration(pool, 1, "job_records", create_job_records(pool)).await?;
    run_migration(pool, 2, "job_records_output_name", add_output_name(pool)).await?;

    Ok(())
}

/// Create migrations tracking table
async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    Ok(())
}

/// Run a single migration if it hasn't been applied yet
async fn run_migration(
    pool: &SqlitePool,
    id: i32,
    name: &str,
    migration_fn: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    let applied: Option<i32> = sqlx::query_scalar("SELECT id FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    if applied.is_some() {
        return Ok(());
    }

    migration_fn.await?;

    sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

/// One row per book; every state transition rewrites that row
async fn create_job_records(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS JobRecords (
            book_id TEXT PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            total_parts INTEGER NOT NULL DEFAULT 0 CHECK (total_parts >= 0),
            max_part_ms INTEGER NOT NULL DEFAULT 0 CHECK (max_part_ms >= 0),
            state TEXT NOT NULL CHECK (state IN (
                'pending', 'planning', 'part_in_progress',
                'part_committed', 'completed', 'failed'
            )),
            state_part INTEGER,
            failure_reason TEXT,
            committed_parts TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_job_records_state ON JobRecords(state);
        "#,
    )
    .await?;

    Ok(())
}

/// Part file base name, so books sharing a title never share files
async fn add_output_name(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
        ALTER TABLE JobRecords ADD COLUMN output_name TEXT;

        CREATE INDEX IF NOT EXISTS idx_job_records_output_name
            ON JobRecords(output_name COLLATE NOCASE);
        "#,
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::storage::database::Database;

    #[tokio::test]
    async fn test_migrations() {
        let db = Database::new_in_memory()
            .await
            .expect("Failed to create database");

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_migrations' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .expect("Failed to query tables");

        assert_eq!(tables, vec!["JobRecords"]);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::new_in_memory()
            .await
            .expect("Failed to create database");

        db.migrate().await.expect("Second migration run failed");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _migrations")
            .fetch_one(db.pool())
            .await
            .expect("Failed to query migrations");
        assert_eq!(count, super::MIGRATION_COUNT as i64);
    }

    #[tokio::test]
    async fn test_unknown_state_is_rejected() {
        let db = Database::new_in_memory()
            .await
            .expect("Failed to create database");

        let result = sqlx::query(
            "INSERT INTO JobRecords (book_id, title, state, updated_at) VALUES ('x', 'x', 'exploded', '')",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_err());
    }
}
