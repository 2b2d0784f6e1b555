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


//! Output naming and directory layout
//!
//! Every part of a book has three possible files in the destination
//! directory:
//!
//! - `"{title} - Part {i} of {n}.{ext}"` - the committed part
//! - `"{title} - Part {i} of {n}.partial.{ext}"` - the cut in flight
//! - `"{title} - Part {i} of {n}.ffmetadata.txt"` - the metadata sidecar
//!
//! A book that needs no split keeps its plain title (`"{title}.{ext}"`).
//! Only committed files ever carry the final name, so a crash can never
//! leave something that looks finished but isn't.

use std::path::{Path, PathBuf};

/// Default container extension when the source has none
pub const DEFAULT_EXTENSION: &str = "m4b";

const PARTIAL_MARKER: &str = "partial";
const SIDECAR_SUFFIX: &str = "ffmetadata.txt";

#[cfg(target_os = "windows")]
const MAX_COMPONENT_LENGTH: usize = 255;
#[cfg(not(target_os = "windows"))]
const MAX_COMPONENT_LENGTH: usize = 255; // bytes

/// Room kept free after the title for " - Part 999 of 999.partial.m4b"
const NAME_SUFFIX_RESERVE: usize = 48;

/// Files belonging to one part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPaths {
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
    pub sidecar_path: PathBuf,
}

impl PartPaths {
    /// All three paths, temp first
    pub fn all(&self) -> [&Path; 3] {
        [&self.temp_path, &self.sidecar_path, &self.final_path]
    }
}

/// Where a book's parts are written
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    per_book_subdirectory: bool,
}

impl OutputLayout {
    pub fn new(root: PathBuf, per_book_subdirectory: bool) -> Self {
        Self {
            root,
            per_book_subdirectory,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination directory for a book (flat, or one folder per book)
    pub fn book_dir(&self, title: &str) -> PathBuf {
        if self.per_book_subdirectory {
            self.root.join(safe_title(title))
        } else {
            self.root.clone()
        }
    }

    /// Final, temporary and sidecar paths of one part
    pub fn part_paths(&self, title: &str, part_index: u32, total_parts: u32, extension: &str) -> PartPaths {
        let dir = self.book_dir(title);
        let stem = part_file_stem(title, part_index, total_parts);
        let ext = normalize_extension(extension);

        PartPaths {
            final_path: dir.join(format!("{}.{}", stem, ext)),
            temp_path: dir.join(format!("{}.{}.{}", stem, PARTIAL_MARKER, ext)),
            sidecar_path: dir.join(format!("{}.{}", stem, SIDECAR_SUFFIX)),
        }
    }
}

/// Stem of a part's file name, without extension
pub fn part_file_stem(title: &str, part_index: u32, total_parts: u32) -> String {
    let title = safe_title(title);
    if total_parts <= 1 {
        title
    } else {
        format!("{} - Part {} of {}", title, part_index, total_parts)
    }
}

/// Final file name of a part, e.g. `"Dune - Part 1 of 3.m4b"`
pub fn part_file_name(title: &str, part_index: u32, total_parts: u32, extension: &str) -> String {
    format!(
        "{}.{}",
        part_file_stem(title, part_index, total_parts),
        normalize_extension(extension)
    )
}

/// Source extension without the dot, falling back to m4b
pub fn source_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

fn normalize_extension(extension: &str) -> &str {
    let ext = extension.trim_start_matches('.');
    if ext.is_empty() {
        DEFAULT_EXTENSION
    } else {
        ext
    }
}

/// Sanitised title, short enough to leave room for the part suffix
pub fn safe_title(title: &str) -> String {
    truncate_component(
        &sanitize_filename(title),
        MAX_COMPONENT_LENGTH - NAME_SUFFIX_RESERVE,
    )
}

/// Output name of a book whose plain title is taken by another book
///
/// `"{title} [{book_id}]"`, with the title shortened so the id survives
/// the length limit.
pub fn disambiguated_name(title: &str, book_id: &str) -> String {
    let suffix = format!(" [{}]", sanitize_filename(book_id));
    let room = (MAX_COMPONENT_LENGTH - NAME_SUFFIX_RESERVE).saturating_sub(suffix.len());
    format!("{}{}", truncate_component(&sanitize_filename(title), room), suffix)
}

/// Sanitize filename (replaces characters that are invalid on common filesystems)
pub fn sanitize_filename(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut result = String::with_capacity(name.len());

    for (i, &c) in chars.iter().enumerate() {
        let prev_char = if i > 0 { chars.get(i - 1).copied() } else { None };
        let next_char = chars.get(i + 1).copied();
        result.push(replace_char(c, prev_char, next_char));
    }

    // Trim leading/trailing whitespace and dots
    let mut result = result.trim().trim_end_matches('.').trim_end().to_string();

    if cfg!(target_os = "windows") {
        result = handle_windows_reserved_names(&result);
    }

    if result.is_empty() {
        result = "file".to_string();
    }

    result
}

/// Replace an invalid character with a look-alike
fn replace_char(c: char, prev_char: Option<char>, next_char: Option<char>) -> char {
    if c == '"' {
        let opens = prev_char.map_or(true, |p| !p.is_alphanumeric())
            && next_char.map_or(false, |n| n.is_alphanumeric());
        let closes = next_char.map_or(true, |n| !n.is_alphanumeric())
            && prev_char.map_or(false, |p| p.is_alphanumeric());
        return if opens {
            '\u{201C}'
        } else if closes {
            '\u{201D}'
        } else {
            '\u{FF02}'
        };
    }

    match c {
        '<' => '＜',
        '>' => '＞',
        ':' => '_',
        '|' => '⏐',
        '?' => '？',
        '*' => '✱',
        '/' => '∕',
        '\\' => '_',
        c if c.is_control() => '_',
        c => c,
    }
}

fn handle_windows_reserved_names(name: &str) -> String {
    let upper = name.to_uppercase();
    let reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    for reserved_name in &reserved {
        if upper == *reserved_name || upper.starts_with(&format!("{}.", reserved_name)) {
            return format!("_{}", name);
        }
    }

    name.to_string()
}

/// Truncate text to at most `max_bytes`, on a char boundary
pub fn truncate_component(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut index = max_bytes;
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }

    text[..index].trim_end().to_string()
}
