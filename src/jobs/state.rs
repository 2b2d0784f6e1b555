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


//! Job states and records
//!
//! ```text
//! Pending -> Planning -> PartInProgress(1) -> PartCommitted(1)
//!         -> PartInProgress(2) -> ... -> PartCommitted(n) -> Completed
//! ```
//!
//! `Failed(reason)` is reachable from every state. Every state except
//! `Completed` may go back to `Planning`, which is how a resumed or retried
//! book re-enters the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Processing state of one book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Planning,
    PartInProgress(u32),
    PartCommitted(u32),
    Completed,
    Failed(String),
}

impl JobState {
    /// Stable name used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Planning => "planning",
            JobState::PartInProgress(_) => "part_in_progress",
            JobState::PartCommitted(_) => "part_committed",
            JobState::Completed => "completed",
            JobState::Failed(_) => "failed",
        }
    }

    /// Rebuild a state from its stored columns
    pub fn from_parts(name: &str, part: Option<u32>, reason: Option<String>) -> Option<Self> {
        match (name, part) {
            ("pending", _) => Some(JobState::Pending),
            ("planning", _) => Some(JobState::Planning),
            ("part_in_progress", Some(k)) if k > 0 => Some(JobState::PartInProgress(k)),
            ("part_committed", Some(k)) if k > 0 => Some(JobState::PartCommitted(k)),
            ("completed", _) => Some(JobState::Completed),
            ("failed", _) => Some(JobState::Failed(reason.unwrap_or_default())),
            _ => None,
        }
    }

    /// Part index carried by the state, if any
    pub fn part(&self) -> Option<u32> {
        match self {
            JobState::PartInProgress(k) | JobState::PartCommitted(k) => Some(*k),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed(_))
    }

    /// Check whether `next` may follow this state for a plan of `total_parts`
    pub fn can_transition_to(&self, next: &JobState, total_parts: u32) -> bool {
        use JobState::*;

        match (self, next) {
            (_, Failed(_)) => true,
            (Completed, _) => false,
            (_, Planning) => true,
            (Planning, PartInProgress(k)) => *k >= 1 && *k <= total_parts,
            (Planning, Completed) => total_parts > 0,
            (PartInProgress(k), PartCommitted(j)) => k == j,
            (PartCommitted(k), PartInProgress(j)) => *j == k + 1 && *j <= total_parts,
            (PartCommitted(k), Completed) => *k == total_parts,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::PartInProgress(k) => write!(f, "part {} in progress", k),
            JobState::PartCommitted(k) => write!(f, "part {} committed", k),
            JobState::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// What a run should do with a book, given its record and a fresh plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Book already completed
    Skip,
    /// Stored plan differs from the fresh one; discard everything
    Restart,
    /// Continue at this 1-based part; earlier parts are committed
    ResumeAt(u32),
}

/// Durable progress of one book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub book_id: String,
    pub title: String,
    /// 0 until a plan was recorded
    pub total_parts: u32,
    /// Budget the plan was made with, in milliseconds
    pub max_part_ms: u64,
    pub state: JobState,
    pub committed_parts: BTreeSet<u32>,
    /// Base name of the part files; fixed once the first plan is recorded
    #[serde(default)]
    pub output_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Record for a book never seen before
    pub fn new(book_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            title: title.into(),
            total_parts: 0,
            max_part_ms: 0,
            state: JobState::Pending,
            committed_parts: BTreeSet::new(),
            output_name: None,
            updated_at: Utc::now(),
        }
    }

    /// Length of the run of committed parts starting at part 1
    pub fn committed_prefix(&self) -> u32 {
        let mut prefix = 0;
        while self.committed_parts.contains(&(prefix + 1)) {
            prefix += 1;
        }
        prefix
    }

    /// Decide where processing continues for a fresh plan
    ///
    /// The plan is deterministic, so a matching part count and budget means
    /// the stored part numbers still refer to the same time ranges.
    pub fn resume_decision(&self, total_parts: u32, max_part_ms: u64) -> ResumeDecision {
        if self.state == JobState::Completed {
            return ResumeDecision::Skip;
        }

        let has_plan = self.total_parts > 0;
        if has_plan && (self.total_parts != total_parts || self.max_part_ms != max_part_ms) {
            return ResumeDecision::Restart;
        }

        let prefix = if has_plan { self.committed_prefix() } else { 0 };
        ResumeDecision::ResumeAt((prefix + 1).min(total_parts + 1))
    }

    /// Failure reason, when failed
    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}
