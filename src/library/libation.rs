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


//! Libation command line provider
//!
//! Drives an installed Libation through its CLI: `scan` and `liberate` sync
//! and download the catalog, `export` lists it as JSON, and
//! `get-setting Books` tells where the decrypted files are. The export has
//! no file paths, so each entry is matched against the books folder with
//! [`AudioIndex`].

use crate::error::{Result, SplitError};
use crate::file::paths::sanitize_filename;
use crate::library::scanner::AudioIndex;
use crate::library::{filter_by_author, BookDescriptor, BookSource, Downloader};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

lazy_static! {
    static ref BOOKS_SETTING: Regex = Regex::new(r#"Books="(.*)""#).unwrap();
}

/// Export file name inside the work directory
const EXPORT_FILE_NAME: &str = "library_data.json";

/// Only entries in this state have a decrypted file on disk
const LIBERATED: &str = "Liberated";

/// Longest stdout/stderr excerpt kept in logs and errors
const OUTPUT_EXCERPT: usize = 500;

/// One book of `libation export --json`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LibraryEntry {
    #[serde(rename = "Title", default)]
    pub title: String,

    /// Comma separated, or a list in some Libation versions
    #[serde(rename = "AuthorNames", default, deserialize_with = "author_names")]
    pub author_names: Option<String>,

    #[serde(rename = "AudibleProductId", default)]
    pub asin: Option<String>,

    #[serde(rename = "BookStatus", default)]
    pub book_status: Option<String>,

    #[serde(rename = "LengthInMinutes", default)]
    pub length_in_minutes: Option<f64>,
}

impl LibraryEntry {
    pub fn is_liberated(&self) -> bool {
        self.book_status.as_deref() == Some(LIBERATED)
    }

    pub fn length(&self) -> Option<Duration> {
        self.length_in_minutes
            .filter(|m| m.is_finite() && *m > 0.0)
            .map(|m| Duration::from_secs_f64(m * 60.0))
    }

    /// Book id: the ASIN, or the sanitised title when the entry has none
    pub fn book_id(&self) -> String {
        match self.asin.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(asin) => asin.to_string(),
            None => sanitize_filename(&self.title),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AuthorNames {
    One(String),
    Many(Vec<String>),
}

fn author_names<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let names = Option::<AuthorNames>::deserialize(deserializer)?.map(|names| match names {
        AuthorNames::One(name) => name,
        AuthorNames::Many(names) => names.join(", "),
    });
    Ok(names.filter(|n| !n.trim().is_empty()))
}

/// Parse the JSON written by `libation export`
pub fn parse_export(json: &str) -> Result<Vec<LibraryEntry>> {
    Ok(serde_json::from_str(json.trim_start_matches('\u{feff}'))?)
}

/// Turn liberated export entries into descriptors
///
/// Entries whose file can't be found in `index` get no `source_path`; the
/// orchestrator asks the downloader for them.
pub fn descriptors_from_entries(
    entries: Vec<LibraryEntry>,
    index: &AudioIndex,
    author_filter: Option<&str>,
) -> Vec<BookDescriptor> {
    let descriptors = entries
        .into_iter()
        .filter(LibraryEntry::is_liberated)
        .map(|entry| {
            let source_path = index.resolve(
                &entry.title,
                entry.author_names.as_deref(),
                entry.asin.as_deref(),
            );
            if source_path.is_none() {
                debug!("No file found for '{}'", entry.title);
            }
            BookDescriptor {
                id: entry.book_id(),
                length_hint: entry.length(),
                catalog_id: entry.asin.filter(|a| !a.trim().is_empty()),
                author: entry.author_names,
                title: entry.title,
                source_path,
            }
        })
        .collect();

    filter_by_author(descriptors, author_filter)
}

/// Extract the books folder from `get-setting Books -b` output
pub fn parse_books_setting(raw: &str) -> Option<PathBuf> {
    let captures = BOOKS_SETTING.captures(raw)?;
    let path = strip_long_path_prefix(&captures[1]);
    let path = path.trim_end_matches('\\');
    (!path.is_empty()).then(|| PathBuf::from(path))
}

fn strip_long_path_prefix(path: &str) -> String {
    path.replace("\\\\?\\", "").replace("\\?\\", "")
}

/// `export` argument variants; the syntax differs between Libation versions
fn export_attempts(path: &str) -> Vec<Vec<&str>> {
    vec![
        vec!["export", "--json", "-p", path],
        vec!["export", "--json", "-f", "--include-files", "--include-chapters", "-p", path],
        vec!["export", "Audible", "--json", "-p", path],
        vec!["export", "--json", "--include-files", "--include-chapters", path],
        vec!["export", "-p", path],
    ]
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().nth(OUTPUT_EXCERPT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// A Libation installation
#[derive(Debug, Clone)]
pub struct LibationCli {
    exe: PathBuf,
    work_dir: PathBuf,
    author_filter: Option<String>,
    books_folder: Option<PathBuf>,
    /// Folders inside the books folder that hold our own output
    skip: Vec<PathBuf>,
    keep_export: bool,
}

impl LibationCli {
    /// `work_dir` receives the temporary export file
    pub fn new(exe: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            exe,
            work_dir,
            author_filter: None,
            books_folder: None,
            skip: Vec::new(),
            keep_export: false,
        }
    }

    pub fn with_author_filter(mut self, filter: Option<String>) -> Self {
        self.author_filter = filter;
        self
    }

    /// Use this folder instead of asking Libation
    pub fn with_books_folder(mut self, folder: PathBuf) -> Self {
        self.books_folder = Some(folder);
        self
    }

    /// Leave a folder out when looking for book files
    pub fn skipping(mut self, dir: PathBuf) -> Self {
        self.skip.push(dir);
        self
    }

    /// Leave the export file behind for inspection
    pub fn keep_export(mut self, keep: bool) -> Self {
        self.keep_export = keep;
        self
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<Output> {
        debug!("Running {} {}", self.exe.display(), args.join(" "));

        let child = Command::new(&self.exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SplitError::ToolNotFound {
                        tool: "Libation".to_string(),
                        path: self.exe.clone(),
                    }
                } else {
                    SplitError::LibraryError(format!("Failed to start Libation: {}", e))
                }
            })?;

        // Dropping the child on cancellation kills it
        tokio::select! {
            output = child.wait_with_output() => Ok(output?),
            _ = cancel.cancelled() => Err(SplitError::Cancelled),
        }
    }

    async fn run_checked(&self, args: &[&str], cancel: &CancellationToken) -> Result<Output> {
        let output = self.run(args, cancel).await?;
        if !output.status.success() {
            return Err(SplitError::LibraryError(format!(
                "libation {} exited with {:?}: {}",
                args.join(" "),
                output.status.code(),
                excerpt(&output.stderr)
            )));
        }
        Ok(output)
    }

    /// Sync the local catalog with the store
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Scanning Libation library");
        self.run_checked(&["scan"], cancel).await.map(|_| ())
    }

    /// Download and decrypt one book, or everything pending when `asin` is `None`
    pub async fn liberate(&self, asin: Option<&str>, cancel: &CancellationToken) -> Result<()> {
        let mut args = vec!["liberate"];
        args.extend(asin);
        info!("Liberating {}", asin.unwrap_or("all pending books"));
        self.run_checked(&args, cancel).await.map(|_| ())
    }

    /// `scan` followed by `liberate` of everything pending
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<()> {
        self.scan(cancel).await?;
        self.liberate(None, cancel).await
    }

    /// Folder where Libation stores decrypted books
    pub async fn books_folder(&self, cancel: &CancellationToken) -> Result<PathBuf> {
        if let Some(folder) = &self.books_folder {
            return Ok(folder.clone());
        }

        let output = self.run(&["get-setting", "Books", "-b"], cancel).await?;
        let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("get-setting output: {}", raw);

        if let Some(folder) = parse_books_setting(&raw) {
            return Ok(folder);
        }

        // Some versions print the bare path
        let bare = PathBuf::from(strip_long_path_prefix(&raw));
        if !raw.is_empty() && bare.is_dir() {
            return Ok(bare);
        }

        Err(SplitError::LibraryError(format!(
            "Could not determine the Libation books folder from '{}'",
            excerpt(raw.as_bytes())
        )))
    }

    /// Export the catalog to `path`, trying each known syntax in turn
    pub async fn export_library(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        // A stale export would look like success
        if fs::metadata(path).await.is_ok() {
            fs::remove_file(path).await?;
        }
        let path_arg = path.to_string_lossy();

        for (attempt, args) in export_attempts(&path_arg).iter().enumerate() {
            let output = self.run(args, cancel).await?;
            debug!(
                "Export syntax #{} ({}) exited with {:?}; stderr: {}",
                attempt + 1,
                args.join(" "),
                output.status.code(),
                excerpt(&output.stderr)
            );

            let size = fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
            if size > 0 {
                info!("Exported library with syntax #{}", attempt + 1);
                return Ok(());
            }
        }

        Err(SplitError::LibraryError(
            "Libation export produced no file with any known syntax".to_string(),
        ))
    }

    /// Read the catalog through a temporary export file
    pub async fn library_entries(&self, cancel: &CancellationToken) -> Result<Vec<LibraryEntry>> {
        fs::create_dir_all(&self.work_dir).await?;
        let export_path = self.work_dir.join(EXPORT_FILE_NAME);

        self.export_library(&export_path, cancel).await?;
        let json = fs::read_to_string(&export_path).await?;

        if self.keep_export {
            info!("Keeping {} for inspection", export_path.display());
        } else if let Err(e) = fs::remove_file(&export_path).await {
            warn!("Failed to remove {}: {}", export_path.display(), e);
        }

        parse_export(&json).map_err(|e| {
            SplitError::LibraryError(format!("Libation export is not valid JSON: {}", e))
        })
    }
}

impl BookSource for LibationCli {
    async fn books(&self) -> Result<Vec<BookDescriptor>> {
        let cancel = CancellationToken::new();
        let folder = self.books_folder(&cancel).await?;
        info!("Libation books folder: {}", folder.display());

        let entries = self.library_entries(&cancel).await?;
        let index = AudioIndex::build(&folder, &self.skip).await?;

        let books = descriptors_from_entries(entries, &index, self.author_filter.as_deref());
        let missing = books.iter().filter(|b| b.source_path.is_none()).count();
        info!(
            "{} liberated books ({} without a local file)",
            books.len(),
            missing
        );
        Ok(books)
    }
}

impl Downloader for LibationCli {
    async fn download(&self, book: &BookDescriptor, cancel: &CancellationToken) -> Result<PathBuf> {
        let Some(asin) = book.catalog_id.as_deref() else {
            return Err(SplitError::download_failed(
                &book.title,
                "no catalog id to download with",
            ));
        };

        let scoped = |e: SplitError| {
            if e.is_cancellation() || e.is_fatal() {
                e
            } else {
                SplitError::download_failed(&book.title, e.to_string())
            }
        };

        self.liberate(Some(asin), cancel).await.map_err(scoped)?;
        let folder = self.books_folder(cancel).await.map_err(scoped)?;
        let index = AudioIndex::build(&folder, &self.skip).await.map_err(scoped)?;

        index
            .resolve(&book.title, book.author.as_deref(), Some(asin))
            .ok_or_else(|| {
                SplitError::download_failed(
                    &book.title,
                    format!("liberate finished but no file was found in {}", folder.display()),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"[
        {
            "Title": "Dune",
            "AuthorNames": "Frank Herbert",
            "AudibleProductId": "B002V1OF70",
            "BookStatus": "Liberated",
            "LengthInMinutes": 1262
        },
        {
            "Title": "The Expanse",
            "AuthorNames": ["James S. A. Corey", "Jefferson Mays"],
            "AudibleProductId": "B073H9PF2D",
            "BookStatus": "Liberated",
            "LengthInMinutes": 1234.5
        },
        {
            "Title": "Not Yet",
            "AuthorNames": "Frank Herbert",
            "AudibleProductId": "B000000000",
            "BookStatus": "NotLiberated"
        }
    ]"#;

    #[test]
    fn test_parse_export() {
        let entries = parse_export(EXPORT).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].author_names.as_deref(), Some("Frank Herbert"));
        assert_eq!(
            entries[1].author_names.as_deref(),
            Some("James S. A. Corey, Jefferson Mays")
        );
        assert_eq!(entries[0].length(), Some(Duration::from_secs(1262 * 60)));
        assert!(!entries[2].is_liberated());
        assert_eq!(entries[2].length(), None);
    }

    #[test]
    fn test_parse_export_with_bom_and_nulls() {
        let json = "\u{feff}[{\"Title\": \"X\", \"AuthorNames\": null, \"AudibleProductId\": \"\"}]";
        let entries = parse_export(json).unwrap();
        assert_eq!(entries[0].author_names, None);
        assert_eq!(entries[0].book_id(), "X");
    }

    #[test]
    fn test_descriptors_from_entries() {
        let root = Path::new("/books");
        let index = AudioIndex::from_files(
            root,
            vec![root.join("Frank Herbert/Dune [B002V1OF70]/Dune.m4b")],
        );

        let books = descriptors_from_entries(parse_export(EXPORT).unwrap(), &index, None);
        assert_eq!(books.len(), 2);

        assert_eq!(books[0].id, "B002V1OF70");
        assert_eq!(books[0].catalog_id.as_deref(), Some("B002V1OF70"));
        assert_eq!(
            books[0].source_path,
            Some(root.join("Frank Herbert/Dune [B002V1OF70]/Dune.m4b"))
        );
        assert_eq!(books[1].source_path, None);

        let herbert = descriptors_from_entries(parse_export(EXPORT).unwrap(), &index, Some("HERBERT"));
        assert_eq!(herbert.len(), 1);
        assert_eq!(herbert[0].title, "Dune");
    }

    #[test]
    fn test_parse_books_setting() {
        assert_eq!(
            parse_books_setting(r#"Books="\\?\C:\Users\me\Libation\Books\""#),
            Some(PathBuf::from(r"C:\Users\me\Libation\Books"))
        );
        assert_eq!(
            parse_books_setting(r#"Books="/home/me/Libation/Books""#),
            Some(PathBuf::from("/home/me/Libation/Books"))
        );
        assert_eq!(parse_books_setting("/home/me/Libation/Books"), None);
        assert_eq!(parse_books_setting(r#"Books="""#), None);
    }

    #[test]
    fn test_export_attempts_all_target_the_path() {
        let attempts = export_attempts("/tmp/out.json");
        assert_eq!(attempts.len(), 5);
        assert_eq!(attempts[0], vec!["export", "--json", "-p", "/tmp/out.json"]);
        assert!(attempts.iter().all(|a| a.contains(&"/tmp/out.json")));
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let long = "x".repeat(2_000);
        assert_eq!(excerpt(long.as_bytes()).chars().count(), OUTPUT_EXCERPT + 3);
        assert_eq!(excerpt(b"  short \n"), "short");
    }

    #[tokio::test]
    async fn test_missing_executable_is_tool_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cli = LibationCli::new(dir.path().join("no-libation"), dir.path().to_path_buf());

        let err = cli.scan(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SplitError::ToolNotFound { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_download_without_catalog_id_fails_the_book() {
        let dir = tempfile::tempdir().unwrap();
        let cli = LibationCli::new(dir.path().join("no-libation"), dir.path().to_path_buf());
        let book = BookDescriptor {
            id: "x".to_string(),
            title: "X".to_string(),
            author: None,
            catalog_id: None,
            source_path: None,
            length_hint: None,
        };

        let err = cli.download(&book, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SplitError::DownloadFailed { .. }));
    }
}
