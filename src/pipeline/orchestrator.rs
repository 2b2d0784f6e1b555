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


//! Book orchestration
//!
//! Drives each book through download, chapter loading, planning and the
//! part-by-part cut loop, recording every step with the [`JobTracker`].
//!
//! # Failure scope
//! - A book's own errors (download, metadata, cut after retries) mark only
//!   that book `Failed`; the other books carry on.
//! - Cancellation leaves the book's record as of its last transition, so
//!   the next run resumes it.
//! - A fatal error (missing tool) stops scheduling further books and is
//!   returned from [`Orchestrator::run`].
//!
//! Parts of one book are cut strictly in order. Books may run in parallel up
//! to [`RunSettings::max_concurrent_books`].

use crate::audio::chapters::{load_chapter_table, ChapterProbe};
use crate::audio::cutter::{CutProgress, Cutter, OutputCheck, PartCutter, SourceFile};
use crate::audio::metadata::{rebase, EmbedMetadata};
use crate::error::{Result, SplitError};
use crate::file::manager::{DirectoryCopyIn, FileManager};
use crate::file::paths::{disambiguated_name, safe_title, source_extension, OutputLayout, PartPaths};
use crate::jobs::state::{JobRecord, JobState, ResumeDecision};
use crate::jobs::tracker::JobTracker;
use crate::library::{Book, BookDescriptor, Downloader};
use crate::pipeline::progress::{BookOutcome, BookReport, ProgressCallback, ProgressEvent, RunSummary};
use crate::split::planner::{plan, PartPlan, SplitPlan};
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Knobs of a run
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Longest allowed part, except single oversized chapters
    pub max_part_duration: Duration,
    pub max_concurrent_books: usize,
    /// Total attempts per part, including the first
    pub max_cut_attempts: u32,
    pub output_check: OutputCheck,
    /// Copy finished books here
    pub copy_to: Option<PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_part_duration: Duration::from_secs(10 * 3600),
            max_concurrent_books: 1,
            max_cut_attempts: 3,
            output_check: OutputCheck::default(),
            copy_to: None,
        }
    }
}

impl RunSettings {
    fn max_part_ms(&self) -> u64 {
        u64::try_from(self.max_part_duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Splits a library of books, resumably
pub struct Orchestrator<P, C, D> {
    probe: P,
    cutter: PartCutter<C>,
    downloader: D,
    tracker: JobTracker,
    layout: OutputLayout,
    files: FileManager,
    copy_in: Option<DirectoryCopyIn>,
    settings: RunSettings,
    progress: Option<ProgressCallback>,
    /// Output names handed out this run (lowercased) -> book id
    claimed_names: Mutex<HashMap<String, String>>,
}

impl<P, C, D> Orchestrator<P, C, D>
where
    P: ChapterProbe,
    C: Cutter,
    D: Downloader,
{
    pub fn new(
        settings: RunSettings,
        layout: OutputLayout,
        tracker: JobTracker,
        probe: P,
        engine: C,
        downloader: D,
    ) -> Self {
        let files = FileManager::new(layout.root().to_path_buf());
        let copy_in = settings
            .copy_to
            .clone()
            .map(|destination| DirectoryCopyIn::new(destination, files.clone()));

        Self {
            probe,
            cutter: PartCutter::new(engine, files.clone(), settings.output_check),
            downloader,
            tracker,
            layout,
            files,
            copy_in,
            settings,
            progress: None,
            claimed_names: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(callback) = &self.progress {
            callback(event);
        }
    }

    /// Process every book; per-book failures end up in the summary
    pub async fn run(
        &self,
        books: Vec<BookDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let total_books = books.len();
        info!("Processing {} book(s)", total_books);
        self.emit(ProgressEvent::RunStarted { total_books });

        // Cancelled on a fatal error so no new book starts
        let stop = cancel.child_token();
        let stop = &stop;

        let mut results: Vec<(usize, BookReport, Option<SplitError>)> =
            stream::iter(books.iter().enumerate())
                .map(|(i, book)| async move {
                    let (outcome, fatal) = match self.process_at(book, i + 1, total_books, stop).await {
                        Ok(outcome) => (outcome, None),
                        Err(e) => {
                            stop.cancel();
                            (BookOutcome::Interrupted, Some(e))
                        }
                    };
                    let report = BookReport {
                        book_id: book.id.clone(),
                        title: book.title.clone(),
                        outcome,
                    };
                    (i, report, fatal)
                })
                .buffer_unordered(self.settings.max_concurrent_books.max(1))
                .collect()
                .await;

        results.sort_by_key(|(i, _, _)| *i);

        let mut fatal = None;
        let mut summary = RunSummary::default();
        for (_, report, error) in results {
            if fatal.is_none() {
                fatal = error;
            }
            summary.reports.push(report);
        }

        if let Some(e) = fatal {
            error!("Run aborted: {}", e);
            return Err(e);
        }

        info!(
            "Run finished: {} completed, {} skipped, {} already processed, {} failed, {} interrupted",
            summary.completed(),
            summary.skipped(),
            summary.already_processed(),
            summary.failures().count(),
            summary.interrupted()
        );
        self.emit(ProgressEvent::RunFinished {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Process one book; `Err` only for fatal errors
    pub async fn process_book(
        &self,
        book: &BookDescriptor,
        cancel: &CancellationToken,
    ) -> Result<BookOutcome> {
        self.process_at(book, 1, 1, cancel).await
    }

    async fn process_at(
        &self,
        book: &BookDescriptor,
        position: usize,
        total_books: usize,
        cancel: &CancellationToken,
    ) -> Result<BookOutcome> {
        info!("[{}/{}] {}", position, total_books, book.title);
        self.emit(ProgressEvent::BookStarted {
            book_id: book.id.clone(),
            title: book.title.clone(),
            position,
            total_books,
        });

        let mut record = JobRecord::new(&book.id, &book.title);
        let result = match self.tracker.open(&book.id, &book.title).await {
            Ok(opened) => {
                record = opened;
                self.drive_book(book, &mut record, cancel).await
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancellation() => {
                info!("'{}' interrupted at {}", book.title, record.state);
                BookOutcome::Interrupted
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let reason = e.user_message();
                error!("'{}' failed: {}", book.title, reason);
                if let Err(save_error) = self.tracker.fail(&mut record, reason.clone()).await {
                    error!("Could not record failure of '{}': {}", book.title, save_error);
                }
                BookOutcome::Failed(reason)
            }
        };

        info!("{}", outcome.display_string(&book.title));
        self.emit(ProgressEvent::BookFinished {
            book_id: book.id.clone(),
            title: book.title.clone(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    async fn drive_book(
        &self,
        book: &BookDescriptor,
        record: &mut JobRecord,
        cancel: &CancellationToken,
    ) -> Result<BookOutcome> {
        if record.state == JobState::Completed {
            return Ok(BookOutcome::AlreadyProcessed);
        }
        if cancel.is_cancelled() {
            return Err(SplitError::Cancelled);
        }

        let book = self.prepare(book, cancel).await?;
        let plan = plan(&book.chapters, self.settings.max_part_duration)?;
        let total_parts = plan.total_parts();
        let max_part_ms = self.settings.max_part_ms();
        let extension = source_extension(&book.source_path);
        let name = self.output_name(&book, record).await?;
        self.check_source_clash(&book, &name, &[total_parts, record.total_parts], &extension)
            .await?;

        for part in plan.oversized_parts() {
            warn!(
                "'{}' part {} is {:.1}h, a single chapter longer than the limit",
                book.title,
                part.part_index,
                part.duration().as_secs_f64() / 3600.0
            );
        }

        let (keep_through, resume_at) = match record.resume_decision(total_parts, max_part_ms) {
            ResumeDecision::Skip => return Ok(BookOutcome::AlreadyProcessed),
            ResumeDecision::Restart => {
                info!(
                    "'{}' was planned with different settings, starting over",
                    book.title
                );
                self.discard_parts(&name, 1..=record.total_parts, record.total_parts, &extension)
                    .await?;
                (0, 1)
            }
            ResumeDecision::ResumeAt(k) => (k - 1, k),
        };

        self.tracker.begin_planning(record).await?;
        self.tracker
            .record_plan(record, total_parts, max_part_ms, keep_through, &name)
            .await?;

        if resume_at > 1 {
            info!("Resuming '{}' at part {} of {}", book.title, resume_at, total_parts);
            self.check_committed(&name, resume_at, total_parts, &extension).await;
        }
        self.discard_parts(&name, resume_at..=total_parts, total_parts, &extension)
            .await?;

        self.emit(ProgressEvent::BookPlanned {
            book_id: book.id.clone(),
            total_parts,
            resume_at,
            oversized_parts: plan.oversized_parts().count(),
            total_duration: plan.total_duration,
        });

        let source = SourceFile {
            size_bytes: FileManager::get_file_size(&book.source_path).await?,
            duration: book.total_duration(),
            path: book.source_path.clone(),
        };

        for part in plan.parts.iter().filter(|p| p.part_index >= resume_at) {
            if cancel.is_cancelled() {
                return Err(SplitError::Cancelled);
            }

            self.tracker.start_part(record, part.part_index).await?;
            self.emit(ProgressEvent::PartStarted {
                book_id: book.id.clone(),
                part_index: part.part_index,
                total_parts,
                duration: part.duration(),
            });

            let metadata = rebase(part, &book.title, book.author.as_deref(), &extension)?;
            let paths = self
                .layout
                .part_paths(&name, part.part_index, total_parts, &extension);
            let bytes = self
                .cut_with_retry(&book, &source, part, &metadata, &paths, cancel)
                .await?;

            self.tracker.commit_part(record, part.part_index).await?;
            info!(
                "Committed {} ({:.1} MB)",
                paths.final_path.display(),
                bytes as f64 / 1_000_000.0
            );
            self.emit(ProgressEvent::PartCommitted {
                book_id: book.id.clone(),
                part_index: part.part_index,
                total_parts,
                bytes,
            });
        }

        self.tracker.complete(record).await?;
        self.copy_finished(&name, &plan, &extension).await;

        Ok(if plan.is_split() {
            BookOutcome::Completed { parts: total_parts }
        } else {
            BookOutcome::Skipped
        })
    }

    /// Local file and chapter table of a listed book
    async fn prepare(&self, descriptor: &BookDescriptor, cancel: &CancellationToken) -> Result<Book> {
        let source_path = self.locate_source(descriptor, cancel).await?;
        let chapters = load_chapter_table(
            &self.probe,
            &source_path,
            &descriptor.title,
            descriptor.length_hint,
        )
        .await?;

        Ok(Book {
            id: descriptor.id.clone(),
            title: descriptor.title.clone(),
            author: descriptor.author.clone(),
            source_path,
            chapters,
        })
    }

    /// Base name of a book's part files, never shared with another book
    ///
    /// The plain title is used unless another book already owns it, in this
    /// run or in the job store; then the book id is added. A name, once
    /// recorded, is kept for good.
    async fn output_name(&self, book: &Book, record: &JobRecord) -> Result<String> {
        let mut claimed = self.claimed_names.lock().await;
        if let Some(name) = &record.output_name {
            claimed.insert(name.to_lowercase(), book.id.clone());
            return Ok(name.clone());
        }

        let plain = safe_title(&book.title);
        for candidate in [plain.clone(), disambiguated_name(&book.title, &book.id)] {
            let key = candidate.to_lowercase();
            if claimed.get(&key).is_some_and(|owner| *owner != book.id) {
                continue;
            }
            if let Some(owner) = self
                .tracker
                .store()
                .output_name_owner(&candidate, &book.id)
                .await?
            {
                debug!("'{}' is taken by {}", candidate, owner);
                continue;
            }

            if candidate != plain {
                info!("'{}' shares its title with another book, writing '{}'", book.title, candidate);
            }
            claimed.insert(key, book.id.clone());
            return Ok(candidate);
        }

        Err(SplitError::InvalidPath(format!(
            "No free output name for '{}' ({})",
            book.title, book.id
        )))
    }

    /// Fail a book whose part files would land on its own source
    ///
    /// Checked for every plan size in `plans` before anything is deleted.
    async fn check_source_clash(
        &self,
        book: &Book,
        name: &str,
        plans: &[u32],
        extension: &str,
    ) -> Result<()> {
        let source = FileManager::canonical_path(&book.source_path).await;

        for &total_parts in plans.iter().filter(|t| **t > 0) {
            for part_index in 1..=total_parts {
                let paths = self.layout.part_paths(name, part_index, total_parts, extension);
                for path in paths.all() {
                    if FileManager::canonical_path(path).await == source {
                        return Err(SplitError::InvalidPath(format!(
                            "Output {} would overwrite the source of '{}'; move the book out of the output folder",
                            path.display(),
                            book.title
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Local source file, downloading it when missing
    async fn locate_source(&self, book: &BookDescriptor, cancel: &CancellationToken) -> Result<PathBuf> {
        if let Some(path) = &book.source_path {
            if FileManager::file_exists(path).await {
                return Ok(path.clone());
            }
            warn!("Source of '{}' is gone: {}", book.title, path.display());
        }

        info!("Downloading '{}'", book.title);
        self.emit(ProgressEvent::Downloading {
            book_id: book.id.clone(),
            title: book.title.clone(),
        });
        let path = self.downloader.download(book, cancel).await?;
        debug!("Downloaded '{}' to {}", book.title, path.display());
        Ok(path)
    }

    async fn cut_with_retry(
        &self,
        book: &Book,
        source: &SourceFile,
        part: &PartPlan,
        metadata: &EmbedMetadata,
        paths: &PartPaths,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let max_attempts = self.settings.max_cut_attempts.max(1);
        let mut attempt = 1;

        loop {
            let progress = self.part_progress(&book.id, part.part_index);
            match self
                .cutter
                .cut_part(source, part, metadata, paths, cancel, progress)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    attempt += 1;
                    warn!(
                        "'{}' part {}: {} (attempt {} of {})",
                        book.title, part.part_index, e, attempt, max_attempts
                    );
                    self.emit(ProgressEvent::PartRetry {
                        book_id: book.id.clone(),
                        part_index: part.part_index,
                        attempt,
                        max_attempts,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn part_progress(&self, book_id: &str, part_index: u32) -> Option<CutProgress> {
        let callback = self.progress.clone()?;
        let book_id = book_id.to_string();
        let progress: CutProgress = Arc::new(move |fraction: f32| {
            callback(ProgressEvent::PartProgress {
                book_id: book_id.clone(),
                part_index,
                fraction,
            })
        });
        Some(progress)
    }

    /// Delete every file the given parts of a plan may have left behind
    async fn discard_parts(
        &self,
        title: &str,
        parts: std::ops::RangeInclusive<u32>,
        total_parts: u32,
        extension: &str,
    ) -> Result<()> {
        let mut removed = 0;
        for part_index in parts {
            let paths = self.layout.part_paths(title, part_index, total_parts, extension);
            removed += self.files.discard_part(&paths).await?;
        }
        if removed > 0 {
            info!("Removed {} stale file(s) of '{}'", removed, title);
        }
        Ok(())
    }

    /// Committed parts are never re-cut; a missing one is only reported
    async fn check_committed(&self, title: &str, resume_at: u32, total_parts: u32, extension: &str) {
        for part_index in 1..resume_at {
            let paths = self.layout.part_paths(title, part_index, total_parts, extension);
            if !FileManager::file_exists(&paths.final_path).await {
                warn!(
                    "Committed part {} of '{}' is missing: {}",
                    part_index,
                    title,
                    paths.final_path.display()
                );
            }
        }
    }

    async fn copy_finished(&self, title: &str, plan: &SplitPlan, extension: &str) {
        let Some(copy_in) = &self.copy_in else {
            return;
        };

        let parts: Vec<PathBuf> = plan
            .parts
            .iter()
            .map(|p| {
                self.layout
                    .part_paths(title, p.part_index, plan.total_parts(), extension)
                    .final_path
            })
            .collect();

        if let Err(e) = copy_in.copy_in(&parts).await {
            warn!(
                "Copy of '{}' to {} failed: {}",
                title,
                copy_in.destination().display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RunSettings::default();
        assert_eq!(settings.max_part_ms(), 36_000_000);
        assert_eq!(settings.max_cut_attempts, 3);
        assert_eq!(settings.max_concurrent_books, 1);
        assert!(settings.copy_to.is_none());
    }
}
