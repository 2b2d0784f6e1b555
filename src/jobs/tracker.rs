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


//! Job tracker
//!
//! The only writer of job records. Every transition is validated, written to
//! the store, and only then applied to the caller's in-memory record, so
//! memory is never ahead of disk.

use crate::error::{Result, SplitError};
use crate::jobs::state::{JobRecord, JobState};
use crate::storage::JobStore;
use chrono::Utc;
use log::debug;

#[derive(Debug, Clone)]
pub struct JobTracker {
    store: JobStore,
}

impl JobTracker {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Load a book's record, or a fresh `Pending` one (not yet persisted)
    pub async fn open(&self, book_id: &str, title: &str) -> Result<JobRecord> {
        Ok(self
            .store
            .load(book_id)
            .await?
            .unwrap_or_else(|| JobRecord::new(book_id, title)))
    }

    /// Enter `Planning` (first run, resume, or retry of a failed book)
    pub async fn begin_planning(&self, record: &mut JobRecord) -> Result<()> {
        self.transition(record, JobState::Planning, |_| {}).await
    }

    /// Store the plan's shape and the part file name while in `Planning`
    ///
    /// Committed parts above `keep_through` are forgotten; they are re-cut.
    pub async fn record_plan(
        &self,
        record: &mut JobRecord,
        total_parts: u32,
        max_part_ms: u64,
        keep_through: u32,
        output_name: &str,
    ) -> Result<()> {
        if record.state != JobState::Planning {
            return Err(self.invalid(record, "plan"));
        }
        self.transition(record, JobState::Planning, |r| {
            r.total_parts = total_parts;
            r.max_part_ms = max_part_ms;
            r.committed_parts.retain(|k| *k <= keep_through);
            r.output_name = Some(output_name.to_string());
        })
        .await
    }

    pub async fn start_part(&self, record: &mut JobRecord, part_index: u32) -> Result<()> {
        self.transition(record, JobState::PartInProgress(part_index), |_| {})
            .await
    }

    /// Mark a part as durable; it will never be cut again
    pub async fn commit_part(&self, record: &mut JobRecord, part_index: u32) -> Result<()> {
        self.transition(record, JobState::PartCommitted(part_index), |r| {
            r.committed_parts.insert(part_index);
        })
        .await
    }

    pub async fn complete(&self, record: &mut JobRecord) -> Result<()> {
        self.transition(record, JobState::Completed, |_| {}).await
    }

    pub async fn fail(&self, record: &mut JobRecord, reason: impl Into<String>) -> Result<()> {
        self.transition(record, JobState::Failed(reason.into()), |_| {})
            .await
    }

    /// Forget a book so it is processed from scratch next time
    pub async fn reset(&self, book_id: &str) -> Result<bool> {
        self.store.delete(book_id).await
    }

    pub async fn reset_all(&self) -> Result<u64> {
        self.store.delete_all().await
    }

    async fn transition<F>(&self, record: &mut JobRecord, next: JobState, update: F) -> Result<()>
    where
        F: FnOnce(&mut JobRecord),
    {
        if !record.state.can_transition_to(&next, record.total_parts) {
            return Err(self.invalid(record, &next.to_string()));
        }

        let mut updated = record.clone();
        updated.state = next;
        update(&mut updated);
        updated.updated_at = Utc::now();

        self.store.save(&updated).await?;
        debug!("[{}] {} -> {}", record.book_id, record.state, updated.state);

        *record = updated;
        Ok(())
    }

    fn invalid(&self, record: &JobRecord, to: &str) -> SplitError {
        SplitError::InvalidTransition {
            book_id: record.book_id.clone(),
            from: record.state.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    async fn tracker() -> JobTracker {
        let db = Database::new_in_memory().await.unwrap();
        JobTracker::new(JobStore::new(db.pool().clone()))
    }

    async fn persisted(tracker: &JobTracker, book_id: &str) -> JobRecord {
        tracker.store().load(book_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_every_transition_is_persisted() {
        let tracker = tracker().await;
        let mut record = tracker.open("B001", "Book").await.unwrap();
        assert!(tracker.store().load("B001").await.unwrap().is_none());

        tracker.begin_planning(&mut record).await.unwrap();
        tracker.record_plan(&mut record, 2, 36_000_000, 0, "Book").await.unwrap();
        assert_eq!(persisted(&tracker, "B001").await, record);

        tracker.start_part(&mut record, 1).await.unwrap();
        assert_eq!(persisted(&tracker, "B001").await.state, JobState::PartInProgress(1));

        tracker.commit_part(&mut record, 1).await.unwrap();
        tracker.start_part(&mut record, 2).await.unwrap();
        tracker.commit_part(&mut record, 2).await.unwrap();
        tracker.complete(&mut record).await.unwrap();

        let stored = persisted(&tracker, "B001").await;
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.committed_parts, [1, 2].into_iter().collect());
    }

    #[tokio::test]
    async fn test_invalid_transition_changes_nothing() {
        let tracker = tracker().await;
        let mut record = tracker.open("B001", "Book").await.unwrap();
        tracker.begin_planning(&mut record).await.unwrap();
        tracker.record_plan(&mut record, 3, 1_000, 0, "Book").await.unwrap();
        tracker.start_part(&mut record, 1).await.unwrap();

        let err = tracker.start_part(&mut record, 2).await.unwrap_err();
        assert!(matches!(err, SplitError::InvalidTransition { .. }));
        assert_eq!(record.state, JobState::PartInProgress(1));
        assert_eq!(persisted(&tracker, "B001").await.state, JobState::PartInProgress(1));
    }

    #[tokio::test]
    async fn test_record_plan_keeps_committed_prefix_only() {
        let tracker = tracker().await;
        let mut record = tracker.open("B001", "Book").await.unwrap();
        record.committed_parts = [1, 2, 4].into_iter().collect();

        tracker.begin_planning(&mut record).await.unwrap();
        tracker.record_plan(&mut record, 5, 1_000, 2, "Book").await.unwrap();

        assert_eq!(record.committed_parts, [1, 2].into_iter().collect());
        assert_eq!(record.output_name.as_deref(), Some("Book"));
        assert_eq!(persisted(&tracker, "B001").await, record);
    }

    #[tokio::test]
    async fn test_record_plan_requires_planning() {
        let tracker = tracker().await;
        let mut record = tracker.open("B001", "Book").await.unwrap();
        assert!(tracker.record_plan(&mut record, 2, 1_000, 0, "Book").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_book_can_be_retried() {
        let tracker = tracker().await;
        let mut record = tracker.open("B001", "Book").await.unwrap();
        tracker.begin_planning(&mut record).await.unwrap();
        tracker.fail(&mut record, "download failed").await.unwrap();

        let mut reopened = tracker.open("B001", "Book").await.unwrap();
        assert_eq!(reopened.failure(), Some("download failed"));
        tracker.begin_planning(&mut reopened).await.unwrap();
        assert_eq!(reopened.state, JobState::Planning);
    }

    #[tokio::test]
    async fn test_reset() {
        let tracker = tracker().await;
        let mut record = tracker.open("B001", "Book").await.unwrap();
        tracker.begin_planning(&mut record).await.unwrap();

        assert!(tracker.reset("B001").await.unwrap());
        assert_eq!(tracker.open("B001", "Book").await.unwrap().state, JobState::Pending);
        assert_eq!(tracker.reset_all().await.unwrap(), 0);
    }
}
