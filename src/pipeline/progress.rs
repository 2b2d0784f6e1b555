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


//! Run progress reporting
//!
//! The orchestrator reports what it is doing as [`ProgressEvent`]s through an
//! optional [`ProgressCallback`]; the command line turns them into progress
//! bars and status lines. The final [`RunSummary`] groups books by outcome.

use std::sync::Arc;
use std::time::Duration;

/// Something observable happened during a run
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    RunStarted {
        total_books: usize,
    },
    BookStarted {
        book_id: String,
        title: String,
        /// 1-based position in the run
        position: usize,
        total_books: usize,
    },
    /// The source file is missing and is being fetched
    Downloading {
        book_id: String,
        title: String,
    },
    BookPlanned {
        book_id: String,
        total_parts: u32,
        /// First part that will be cut; `total_parts + 1` when nothing is left
        resume_at: u32,
        oversized_parts: usize,
        total_duration: Duration,
    },
    PartStarted {
        book_id: String,
        part_index: u32,
        total_parts: u32,
        duration: Duration,
    },
    PartProgress {
        book_id: String,
        part_index: u32,
        /// 0.0 - 1.0
        fraction: f32,
    },
    PartRetry {
        book_id: String,
        part_index: u32,
        /// Attempt about to start
        attempt: u32,
        max_attempts: u32,
        reason: String,
    },
    PartCommitted {
        book_id: String,
        part_index: u32,
        total_parts: u32,
        bytes: u64,
    },
    BookFinished {
        book_id: String,
        title: String,
        outcome: BookOutcome,
    },
    RunFinished {
        summary: RunSummary,
    },
}

/// Callback type for progress updates
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// How one book ended in this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookOutcome {
    /// Split into `parts` files
    Completed { parts: u32 },
    /// Short enough to stay whole; written as a single file
    Skipped,
    /// Completed by an earlier run, nothing done
    AlreadyProcessed,
    Failed(String),
    /// Stopped by cancellation; resumes on the next run
    Interrupted,
}

impl BookOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            BookOutcome::Completed { .. } => "completed",
            BookOutcome::Skipped => "skipped",
            BookOutcome::AlreadyProcessed => "already processed",
            BookOutcome::Failed(_) => "failed",
            BookOutcome::Interrupted => "interrupted",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, BookOutcome::Failed(_))
    }

    /// Status line for a book, e.g. `"Dune: split into 3 parts"`
    pub fn display_string(&self, title: &str) -> String {
        match self {
            BookOutcome::Completed { parts } => format!("{}: split into {} parts", title, parts),
            BookOutcome::Skipped => format!("{}: no split needed", title),
            BookOutcome::AlreadyProcessed => format!("{}: already processed, skipping", title),
            BookOutcome::Failed(reason) => format!("{}: failed - {}", title, reason),
            BookOutcome::Interrupted => format!("{}: interrupted, will resume", title),
        }
    }
}

/// Outcome of one book in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookReport {
    pub book_id: String,
    pub title: String,
    pub outcome: BookOutcome,
}

/// Per-book outcomes of a run, in library order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub reports: Vec<BookReport>,
}

impl RunSummary {
    fn count(&self, predicate: impl Fn(&BookOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| predicate(&r.outcome)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, BookOutcome::Completed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, BookOutcome::Skipped))
    }

    pub fn already_processed(&self) -> usize {
        self.count(|o| matches!(o, BookOutcome::AlreadyProcessed))
    }

    pub fn interrupted(&self) -> usize {
        self.count(|o| matches!(o, BookOutcome::Interrupted))
    }

    /// Failed books with their reasons
    pub fn failures(&self) -> impl Iterator<Item = (&BookReport, &str)> {
        self.reports.iter().filter_map(|r| match &r.outcome {
            BookOutcome::Failed(reason) => Some((r, reason.as_str())),
            _ => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        self.reports.iter().any(|r| r.outcome.is_failure())
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted() > 0
    }

    pub fn total_parts_written(&self) -> u32 {
        self.reports
            .iter()
            .map(|r| match r.outcome {
                BookOutcome::Completed { parts } => parts,
                BookOutcome::Skipped => 1,
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(title: &str, outcome: BookOutcome) -> BookReport {
        BookReport {
            book_id: title.to_string(),
            title: title.to_string(),
            outcome,
        }
    }

    #[test]
    fn test_summary_counts() {
        let summary = RunSummary {
            reports: vec![
                report("a", BookOutcome::Completed { parts: 3 }),
                report("b", BookOutcome::Skipped),
                report("c", BookOutcome::AlreadyProcessed),
                report("d", BookOutcome::Failed("Cut of part 2 failed".to_string())),
                report("e", BookOutcome::Completed { parts: 2 }),
            ],
        };

        assert_eq!(summary.completed(), 2);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.already_processed(), 1);
        assert_eq!(summary.interrupted(), 0);
        assert_eq!(summary.total_parts_written(), 6);
        assert!(summary.has_failures());
        assert!(!summary.was_interrupted());

        let failures: Vec<_> = summary.failures().map(|(r, why)| (r.title.as_str(), why)).collect();
        assert_eq!(failures, vec![("d", "Cut of part 2 failed")]);
    }

    #[test]
    fn test_display_string() {
        assert_eq!(
            BookOutcome::Completed { parts: 3 }.display_string("Dune"),
            "Dune: split into 3 parts"
        );
        assert_eq!(
            BookOutcome::AlreadyProcessed.display_string("Dune"),
            "Dune: already processed, skipping"
        );
        assert_eq!(BookOutcome::Interrupted.label(), "interrupted");
    }
}
