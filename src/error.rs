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


//! Error types for LibriSplit
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are grouped by pipeline stage (metadata, download, cutting, job state,
//! files, configuration) so the orchestrator can decide whether a failure is
//! scoped to one book, retryable, or fatal for the whole run.
//!
//! ## Failure scope
//!
//! - `MetadataUnreadable` - degrades to a single synthetic chapter where possible
//! - `DownloadFailed` - the book is marked failed, siblings continue
//! - `CutFailed` - retried a bounded number of times, then the book is failed
//! - `Cancelled` - the run was interrupted; the book stays resumable
//! - `ToolNotFound` / `InvalidConfiguration` - fatal, checked before any book
//! - `SqlxError` - fatal, the job store can no longer record progress

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our SplitError type
pub type Result<T> = std::result::Result<T, SplitError>;

/// Main error type for LibriSplit
#[derive(Error, Debug)]
pub enum SplitError {
    // ===== Metadata Errors =====

    /// Chapter table or duration could not be read from the source file
    #[error("Metadata unreadable for {path}: {reason}")]
    MetadataUnreadable { path: PathBuf, reason: String },

    // ===== Download Errors =====

    /// Download/decrypt of a catalog item did not produce a local file
    #[error("Download failed for '{book}': {reason}")]
    DownloadFailed { book: String, reason: String },

    // ===== Cutting Errors =====

    /// The external transcoding engine failed to produce a part
    #[error("Cut of part {part} failed (exit code {exit_code:?}): {stderr}")]
    CutFailed {
        part: u32,
        /// Process exit code, `None` when killed by a signal
        exit_code: Option<i32>,
        /// Tail of the engine's stderr
        stderr: String,
    },

    /// The engine exited successfully but its output is not plausible
    #[error("Output for part {part} failed verification: {reason}")]
    OutputRejected { part: u32, reason: String },

    /// External tool binary could not be launched
    #[error("External tool not found: {tool} ({path})")]
    ToolNotFound { tool: String, path: PathBuf },

    // ===== Planning Errors =====

    /// Planner input is unusable (e.g. zero duration budget)
    #[error("Invalid split plan: {0}")]
    InvalidPlan(String),

    /// A rebased chapter fell outside its part's span
    #[error("Chapter '{chapter}' does not fit inside part {part}")]
    RebaseInvariant { part: u32, chapter: String },

    // ===== Job State Errors =====

    /// Requested job state transition is not allowed from the current state
    #[error("Invalid job transition for '{book_id}': {from} -> {to}")]
    InvalidTransition {
        book_id: String,
        from: String,
        to: String,
    },

    /// Persisted job record could not be decoded
    #[error("Corrupt job record for '{book_id}': {reason}")]
    CorruptJobRecord { book_id: String, reason: String },

    // ===== File Errors =====

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic file I/O error with context
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// Invalid file path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // ===== Configuration Errors =====

    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Library provider is not usable (Libation not configured, export failed, ...)
    #[error("Library provider error: {0}")]
    LibraryError(String),

    // ===== General Errors =====

    /// Operation was cancelled by user or system
    #[error("Operation cancelled")]
    Cancelled,

    /// Database migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SplitError {
    /// Create an InvalidConfiguration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        SplitError::InvalidConfiguration(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        SplitError::InternalError(message.into())
    }

    /// Create a MetadataUnreadable error
    pub fn metadata_unreadable<S: Into<String>>(path: impl Into<PathBuf>, reason: S) -> Self {
        SplitError::MetadataUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a DownloadFailed error
    pub fn download_failed<B: Into<String>, S: Into<String>>(book: B, reason: S) -> Self {
        SplitError::DownloadFailed {
            book: book.into(),
            reason: reason.into(),
        }
    }

    /// Check if a part cut may be attempted again
    ///
    /// Only failures of the engine itself are retried; a missing tool or a
    /// cancellation will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SplitError::CutFailed { .. } | SplitError::OutputRejected { .. }
        )
    }

    /// Check if this error is the interrupt path rather than a real failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SplitError::Cancelled)
    }

    /// Check if this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SplitError::ToolNotFound { .. }
                | SplitError::InvalidConfiguration(_)
                | SplitError::MigrationFailed(_)
                | SplitError::SqlxError(_)
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            SplitError::ToolNotFound { tool, path } => format!(
                "{} is required but could not be started from '{}'. Check the tool path in your configuration.",
                tool,
                path.display()
            ),
            SplitError::CutFailed {
                part,
                exit_code,
                stderr,
            } => {
                let tail = stderr.lines().last().unwrap_or("no output");
                match exit_code {
                    Some(code) => format!("Part {} could not be cut (exit code {}): {}", part, code, tail),
                    None => format!("Part {} could not be cut (terminated): {}", part, tail),
                }
            }
            SplitError::DownloadFailed { book, reason } => {
                format!("Could not download '{}': {}. It will be retried on the next run.", book, reason)
            }
            SplitError::Cancelled => {
                "Stopped by user. Run again to continue where you left off.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cut_failures_are_retryable() {
        let err = SplitError::CutFailed {
            part: 2,
            exit_code: Some(1),
            stderr: "Invalid data found when processing input".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert!(!SplitError::Cancelled.is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        let err = SplitError::ToolNotFound {
            tool: "ffmpeg".to_string(),
            path: PathBuf::from("/usr/bin/ffmpeg"),
        };
        assert!(err.is_fatal());
        assert!(SplitError::config("max_part_hours must be positive").is_fatal());
        assert!(!SplitError::download_failed("Book", "exit 1").is_fatal());
    }

    #[test]
    fn test_job_database_errors_are_fatal() {
        assert!(SplitError::SqlxError(sqlx::Error::PoolClosed).is_fatal());
        let corrupt = SplitError::CorruptJobRecord {
            book_id: "B001".to_string(),
            reason: "unknown state".to_string(),
        };
        assert!(!corrupt.is_fatal());
    }

    #[test]
    fn test_user_message_uses_last_stderr_line() {
        let err = SplitError::CutFailed {
            part: 3,
            exit_code: Some(183),
            stderr: "line one\nNo space left on device".to_string(),
        };
        assert_eq!(
            err.user_message(),
            "Part 3 could not be cut (exit code 183): No space left on device"
        );
    }
}
