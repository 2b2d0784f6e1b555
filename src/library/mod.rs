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


//! Source library providers
//!
//! A provider lists the books to process ([`BookSource`]) and, when it can,
//! fetches a book that is not on disk yet ([`Downloader`]).
//!
//! # Providers
//! - [`libation::LibationCli`] - a Libation installation, driven through its CLI
//! - [`scanner::DirectoryLibrary`] - any folder of audio files

pub mod libation;
pub mod scanner;

use crate::audio::chapters::ChapterTable;
use crate::error::{Result, SplitError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use libation::LibationCli;
pub use scanner::DirectoryLibrary;

/// A book as listed by a provider, before its file is inspected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDescriptor {
    /// Stable identity across runs: the catalog id (ASIN) when known
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    /// Remote catalog identifier used for downloading
    pub catalog_id: Option<String>,
    /// Local source file; `None` means it must be downloaded first
    pub source_path: Option<PathBuf>,
    /// Runtime from the catalog, used when the file's duration is unreadable
    pub length_hint: Option<Duration>,
}

/// A book ready for planning: a local file and its chapter table
#[derive(Debug, Clone)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub source_path: PathBuf,
    pub chapters: ChapterTable,
}

impl Book {
    pub fn total_duration(&self) -> Duration {
        self.chapters.total_duration
    }
}

/// Capability: list the books to process
pub trait BookSource: Send + Sync {
    fn books(&self) -> impl Future<Output = Result<Vec<BookDescriptor>>> + Send;
}

/// Capability: download and decrypt a book, returning the local file
pub trait Downloader: Send + Sync {
    fn download(
        &self,
        book: &BookDescriptor,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<PathBuf>> + Send;
}

/// Downloader for providers that can't fetch anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDownloader;

impl Downloader for NoDownloader {
    async fn download(&self, book: &BookDescriptor, _cancel: &CancellationToken) -> Result<PathBuf> {
        Err(SplitError::download_failed(
            &book.title,
            "file is missing and no download source is configured",
        ))
    }
}

/// Keep books whose author contains `filter` (case-insensitive)
pub fn filter_by_author(books: Vec<BookDescriptor>, filter: Option<&str>) -> Vec<BookDescriptor> {
    let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) else {
        return books;
    };
    let needle = filter.to_lowercase();

    books
        .into_iter()
        .filter(|b| {
            b.author
                .as_deref()
                .map_or(false, |a| a.to_lowercase().contains(&needle))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(title: &str, author: Option<&str>) -> BookDescriptor {
        BookDescriptor {
            id: title.to_string(),
            title: title.to_string(),
            author: author.map(str::to_string),
            catalog_id: None,
            source_path: None,
            length_hint: None,
        }
    }

    #[test]
    fn test_filter_by_author() {
        let books = vec![
            descriptor("Dune", Some("Frank Herbert")),
            descriptor("Foundation", Some("Isaac Asimov")),
            descriptor("Anonymous", None),
        ];

        let filtered = filter_by_author(books.clone(), Some("herbert"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].title, "Dune");

        assert_eq!(filter_by_author(books.clone(), None).len(), 3);
        assert_eq!(filter_by_author(books, Some("  ")).len(), 3);
    }

    #[tokio::test]
    async fn test_no_downloader_fails_per_book() {
        let err = NoDownloader
            .download(&descriptor("Dune", None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SplitError::DownloadFailed { .. }));
        assert!(!err.is_fatal());
    }
}
