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


//! Library folder scanning
//!
//! Finds audio files below a folder and matches catalog entries to them.
//! Libation's export carries no file paths, so books are found by title,
//! ASIN, or author and title words appearing in the file's path.

use crate::error::{Result, SplitError};
use crate::file::paths::sanitize_filename;
use crate::library::{BookDescriptor, BookSource};
use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Extensions treated as audiobooks
const AUDIO_EXTENSIONS: &[&str] = &["m4b", "m4a", "mp3", "aac"];

/// Shortest word used for fuzzy author/title matching
const MIN_MATCH_WORD_LEN: usize = 4;

/// Check if file is an audio file
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Recursively collect audio files, sorted by path
///
/// Folders in `skip` (typically the output folder) are not entered, so
/// finished parts are never mistaken for books.
pub async fn scan_audio_files(directory: &Path, skip: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        return Err(SplitError::InvalidPath(format!(
            "Library folder does not exist: {}",
            directory.display()
        )));
    }

    let mut skipped = Vec::with_capacity(skip.len());
    for dir in skip {
        if let Ok(resolved) = fs::canonicalize(dir).await {
            skipped.push(resolved);
        }
    }

    let mut files = Vec::new();
    scan_recursive(directory, &skipped, &mut files).await?;
    files.sort();
    Ok(files)
}

fn scan_recursive<'a>(
    dir: &'a Path,
    skip: &'a [PathBuf],
    files: &'a mut Vec<PathBuf>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = fs::read_dir(dir).await.map_err(|e| {
            SplitError::FileIoError(format!("Failed to read directory {}: {}", dir.display(), e))
        })?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            SplitError::FileIoError(format!(
                "Failed to read directory entry in {}: {}",
                dir.display(),
                e
            ))
        })? {
            let path = entry.path();
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                // Skip our own state folder and other hidden folders
                if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with('.'))
                {
                    continue;
                }
                if !skip.is_empty()
                    && fs::canonicalize(&path)
                        .await
                        .map_or(false, |resolved| skip.contains(&resolved))
                {
                    debug!("Not scanning {}", path.display());
                    continue;
                }
                scan_recursive(&path, skip, files).await?;
            } else if is_audio_file(&path) && !is_partial_output(&path) {
                files.push(path);
            }
        }

        Ok(())
    })
}

fn is_partial_output(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map_or(false, |s| s.ends_with(".partial"))
}

/// Searchable index of the audio files in a folder
#[derive(Debug, Clone)]
pub struct AudioIndex {
    root: PathBuf,
    /// (lowercased relative path, absolute path)
    entries: Vec<(String, PathBuf)>,
}

impl AudioIndex {
    pub async fn build(root: &Path, skip: &[PathBuf]) -> Result<Self> {
        let files = scan_audio_files(root, skip).await?;
        info!("Found {} audio files in {}", files.len(), root.display());
        Ok(Self::from_files(root, files))
    }

    pub fn from_files(root: &Path, files: Vec<PathBuf>) -> Self {
        let entries = files
            .into_iter()
            .map(|path| {
                let key = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_lowercase();
                (key, path)
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            entries,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the file of a catalog entry
    ///
    /// Strategies in order: file named exactly like the title, title (plain
    /// or sanitised) anywhere in the path, ASIN in the path, then a
    /// significant title word together with a significant author word.
    pub fn resolve(&self, title: &str, author: Option<&str>, asin: Option<&str>) -> Option<PathBuf> {
        let title_lower = title.trim().to_lowercase();
        let safe_title = sanitize_filename(title).to_lowercase();

        if !title_lower.is_empty() {
            if let Some(path) = self.find(|key| {
                let stem = file_stem_of(key);
                stem == title_lower || stem == safe_title
            }) {
                return Some(path);
            }
            if let Some(path) = self.find(|key| key.contains(&title_lower) || key.contains(&safe_title)) {
                return Some(path);
            }
        }

        if let Some(asin) = asin.map(str::to_lowercase).filter(|a| !a.is_empty()) {
            if let Some(path) = self.find(|key| key.contains(&asin)) {
                return Some(path);
            }
        }

        let title_words = significant_words(&title_lower);
        let author_words = significant_words(&author.unwrap_or_default().to_lowercase());
        if title_words.is_empty() || author_words.is_empty() {
            return None;
        }

        self.find(|key| {
            title_words.iter().any(|w| key.contains(w.as_str()))
                && author_words.iter().any(|w| key.contains(w.as_str()))
        })
    }

    fn find(&self, predicate: impl Fn(&str) -> bool) -> Option<PathBuf> {
        let found = self
            .entries
            .iter()
            .find(|(key, _)| predicate(key))
            .map(|(_, path)| path.clone());
        if let Some(path) = &found {
            debug!("Resolved {}", path.display());
        }
        found
    }
}

fn file_stem_of(key: &str) -> &str {
    let name = key.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(key);
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

fn significant_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|w| w.chars().count() >= MIN_MATCH_WORD_LEN)
        .map(str::to_string)
        .collect()
}

/// Stable id of a file-only book: its path below the library root, without extension
pub fn book_id_for_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let without_ext = relative.with_extension("");
    without_ext
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Every audio file below a folder is a book, titled by its file name
#[derive(Debug, Clone)]
pub struct DirectoryLibrary {
    root: PathBuf,
    skip: Vec<PathBuf>,
}

impl DirectoryLibrary {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            skip: Vec::new(),
        }
    }

    /// Leave a folder below the root out of the scan
    pub fn skipping(mut self, dir: PathBuf) -> Self {
        self.skip.push(dir);
        self
    }
}

impl BookSource for DirectoryLibrary {
    async fn books(&self) -> Result<Vec<BookDescriptor>> {
        let files = scan_audio_files(&self.root, &self.skip).await?;
        info!("Found {} audio files in {}", files.len(), self.root.display());

        Ok(files
            .into_iter()
            .map(|path| {
                let title = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "Untitled".to_string());
                BookDescriptor {
                    id: book_id_for_path(&self.root, &path),
                    title,
                    author: None,
                    catalog_id: None,
                    source_path: Some(path),
                    length_hint: None,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn index(files: &[&str]) -> AudioIndex {
        let root = Path::new("/books");
        AudioIndex::from_files(root, files.iter().map(|f| root.join(f)).collect())
    }

    #[test]
    fn test_is_audio_file() {
        assert!(is_audio_file(Path::new("a/b.M4B")));
        assert!(is_audio_file(Path::new("a/b.mp3")));
        assert!(!is_audio_file(Path::new("a/b.jpg")));
        assert!(!is_audio_file(Path::new("a/b")));
    }

    #[test]
    fn test_resolve_by_title() {
        let index = index(&[
            "Frank Herbert/Dune Messiah [B002]/Dune Messiah.m4b",
            "Frank Herbert/Dune [B001]/Dune.m4b",
        ]);
        assert_eq!(
            index.resolve("Dune Messiah", Some("Frank Herbert"), Some("B002")),
            Some(PathBuf::from("/books/Frank Herbert/Dune Messiah [B002]/Dune Messiah.m4b"))
        );
    }

    #[test]
    fn test_exact_file_name_wins() {
        let index = index(&[
            "Frank Herbert/Dune Messiah.m4b",
            "Frank Herbert/Dune.m4b",
        ]);
        assert_eq!(
            index.resolve("Dune", None, None),
            Some(PathBuf::from("/books/Frank Herbert/Dune.m4b"))
        );
    }

    #[test]
    fn test_resolve_by_sanitized_title() {
        let index = index(&["Author/Dune_ Part One/Dune_ Part One.m4b"]);
        assert!(index.resolve("Dune: Part One", None, None).is_some());
    }

    #[test]
    fn test_resolve_by_asin() {
        let index = index(&["x/b07abc1234.m4b"]);
        assert!(index.resolve("Completely Different", None, Some("B07ABC1234")).is_some());
    }

    #[test]
    fn test_resolve_by_words() {
        let index = index(&["tolkien/fellowship ring (unabridged).m4b"]);
        let found = index.resolve("The Fellowship of the Ring", Some("J.R.R. Tolkien"), None);
        assert!(found.is_some());
        assert!(index.resolve("The Fellowship of the Ring", None, None).is_none());
    }

    #[test]
    fn test_book_id_for_path() {
        let root = Path::new("/books");
        assert_eq!(
            book_id_for_path(root, Path::new("/books/Author/Dune.m4b")),
            "Author/Dune"
        );
    }

    #[tokio::test]
    async fn test_directory_library_lists_audio_files() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("Author");
        fs::create_dir_all(&nested).await.unwrap();
        fs::create_dir_all(dir.path().join(".librisplit")).await.unwrap();
        fs::write(nested.join("Book One.m4b"), b"x").await.unwrap();
        fs::write(nested.join("cover.jpg"), b"x").await.unwrap();
        fs::write(dir.path().join("Book Two.mp3"), b"x").await.unwrap();
        fs::write(dir.path().join("Book Two - Part 1 of 2.partial.mp3"), b"x").await.unwrap();
        fs::write(dir.path().join(".librisplit").join("hidden.m4b"), b"x").await.unwrap();

        let books = DirectoryLibrary::new(dir.path().to_path_buf()).books().await.unwrap();

        let ids: Vec<&str> = books.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["Author/Book One", "Book Two"]);
        assert_eq!(books[0].title, "Book One");
        assert!(books[0].source_path.is_some());
    }

    #[tokio::test]
    async fn test_missing_folder_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(scan_audio_files(&dir.path().join("missing"), &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_output_folder_inside_library_is_not_scanned() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("iPod_Ready_Parts");
        fs::create_dir_all(&out).await.unwrap();
        fs::write(dir.path().join("Dune.m4b"), b"x").await.unwrap();
        fs::write(out.join("Dune - Part 1 of 2.m4b"), b"x").await.unwrap();
        fs::write(out.join("Dune - Part 2 of 2.m4b"), b"x").await.unwrap();

        let books = DirectoryLibrary::new(dir.path().to_path_buf())
            .skipping(dir.path().join(".").join("iPod_Ready_Parts"))
            .books()
            .await
            .unwrap();

        let ids: Vec<&str> = books.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["Dune"]);
        assert_eq!(
            scan_audio_files(dir.path(), &[]).await.unwrap().len(),
            3
        );
    }
}
