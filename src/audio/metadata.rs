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


//! Metadata rebasing for parts
//!
//! Each part carries its own chapter table starting at zero, plus tags that
//! let a player order the parts of a book (`track = i/n`). The result is
//! written as an FFmetadata file that ffmpeg maps onto the cut.
//!
//! # FFmetadata format
//! ```text
//! ;FFMETADATA1
//! title=Dune - Part 1 of 2
//! album=Dune
//! artist=Frank Herbert
//! track=1/2
//!
//! [CHAPTER]
//! TIMEBASE=1/1000
//! START=0
//! END=3600000
//! title=Chapter 1
//! ```

use crate::audio::chapters::Chapter;
use crate::error::{Result, SplitError};
use crate::file::paths::part_file_name;
use crate::split::PartPlan;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Artist tag used when the catalog has no author
pub const UNKNOWN_ARTIST: &str = "Unknown";

/// Everything embedded into one part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedMetadata {
    pub title: String,
    pub album: String,
    pub artist: String,
    /// `"{i}/{n}"`
    pub track: String,
    /// Part-relative chapters, first one starts at zero
    pub chapters: Vec<Chapter>,
    /// Final output file name, e.g. `"Dune - Part 1 of 2.m4b"`
    pub file_name: String,
}

impl EmbedMetadata {
    /// Render as an FFmetadata document
    pub fn to_ffmetadata(&self) -> String {
        let mut content = String::from(";FFMETADATA1\n");
        content.push_str(&format!("title={}\n", escape_value(&self.title)));
        content.push_str(&format!("album={}\n", escape_value(&self.album)));
        content.push_str(&format!("artist={}\n", escape_value(&self.artist)));
        content.push_str(&format!("track={}\n", escape_value(&self.track)));

        for chapter in &self.chapters {
            content.push_str("\n[CHAPTER]\n");
            content.push_str("TIMEBASE=1/1000\n");
            content.push_str(&format!("START={}\n", chapter.start.as_millis()));
            content.push_str(&format!("END={}\n", chapter.end.as_millis()));
            content.push_str(&format!("title={}\n", escape_value(&chapter.title)));
        }

        content
    }
}

/// Compute the embed metadata of one part
///
/// Chapter titles are copied verbatim and offsets shifted by the part's
/// start. A chapter reaching outside the part is a planner bug and is
/// reported, never truncated.
pub fn rebase(part: &PartPlan, title: &str, author: Option<&str>, extension: &str) -> Result<EmbedMetadata> {
    let mut chapters = Vec::with_capacity(part.chapters.len());

    for (i, chapter) in part.chapters.iter().enumerate() {
        if chapter.start < part.start || chapter.end > part.end || chapter.end < chapter.start {
            return Err(SplitError::RebaseInvariant {
                part: part.part_index,
                chapter: chapter.title.clone(),
            });
        }

        chapters.push(Chapter {
            index: i as u32,
            title: chapter.title.clone(),
            start: chapter.start - part.start,
            end: chapter.end - part.start,
        });
    }

    let part_title = if part.is_whole_book() {
        title.to_string()
    } else {
        format!("{} - Part {} of {}", title, part.part_index, part.total_parts)
    };

    let artist = author
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or(UNKNOWN_ARTIST)
        .to_string();

    Ok(EmbedMetadata {
        title: part_title,
        album: title.to_string(),
        artist,
        track: format!("{}/{}", part.part_index, part.total_parts),
        chapters,
        file_name: part_file_name(title, part.part_index, part.total_parts, extension),
    })
}

/// Escape special characters of an FFmetadata value
fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '=' | ';' | '#' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' => escaped.push_str("\\\n"),
            '\r' => {}
            c => escaped.push(c),
        }
    }
    escaped
}

/// Format an offset for ffmpeg (HH:MM:SS.mmm)
pub fn format_ffmpeg_timestamp(offset: Duration) -> String {
    let ms = offset.as_millis();
    let total_seconds = ms / 1000;
    let milliseconds = ms % 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        hours, minutes, seconds, milliseconds
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chapters::{ChapterTable, RawChapter};
    use crate::split::plan;

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    fn hourly_table(count: u64) -> ChapterTable {
        let raw: Vec<RawChapter> = (0..count)
            .map(|h| RawChapter {
                title: Some(format!("Hour {}", h + 1)),
                start: hours(h),
                end: hours(h + 1),
            })
            .collect();
        ChapterTable::from_raw(&raw, hours(count), "Book")
    }

    #[test]
    fn test_rebase_second_part() {
        let split = plan(&hourly_table(11), hours(10)).unwrap();
        let meta = rebase(&split.parts[1], "Dune", Some("Frank Herbert"), "m4b").unwrap();

        assert_eq!(meta.title, "Dune - Part 2 of 2");
        assert_eq!(meta.album, "Dune");
        assert_eq!(meta.artist, "Frank Herbert");
        assert_eq!(meta.track, "2/2");
        assert_eq!(meta.file_name, "Dune - Part 2 of 2.m4b");
        assert_eq!(meta.chapters.len(), 1);
        assert_eq!(meta.chapters[0].title, "Hour 11");
        assert_eq!(meta.chapters[0].start, Duration::ZERO);
        assert_eq!(meta.chapters[0].end, hours(1));
        assert_eq!(meta.chapters[0].index, 0);
    }

    #[test]
    fn test_rebased_chapters_start_at_zero_and_fill_the_part() {
        let split = plan(&hourly_table(23), hours(7)).unwrap();
        for part in &split.parts {
            let meta = rebase(part, "Book", None, "m4b").unwrap();
            assert_eq!(meta.chapters[0].start, Duration::ZERO);
            for pair in meta.chapters.windows(2) {
                assert!(pair[0].start < pair[1].start);
                assert_eq!(pair[0].end, pair[1].start);
            }
            assert_eq!(meta.chapters.last().unwrap().end, part.duration());
        }
    }

    #[test]
    fn test_single_part_keeps_plain_title() {
        let split = plan(&hourly_table(3), hours(10)).unwrap();
        let meta = rebase(&split.parts[0], "Short Book", None, "mp3").unwrap();

        assert_eq!(meta.title, "Short Book");
        assert_eq!(meta.artist, UNKNOWN_ARTIST);
        assert_eq!(meta.track, "1/1");
        assert_eq!(meta.file_name, "Short Book.mp3");
    }

    #[test]
    fn test_chapter_outside_part_is_reported() {
        let split = plan(&hourly_table(11), hours(10)).unwrap();
        let mut part = split.parts[1].clone();
        part.chapters.insert(0, split.parts[0].chapters[9].clone());

        let err = rebase(&part, "Book", None, "m4b").unwrap_err();
        assert!(matches!(err, SplitError::RebaseInvariant { part: 2, .. }));
    }

    #[test]
    fn test_generate_ffmetadata() {
        let split = plan(&hourly_table(2), hours(10)).unwrap();
        let meta = rebase(&split.parts[0], "A=B; #1", Some("Auth\\or"), "m4b").unwrap();
        let content = meta.to_ffmetadata();

        assert!(content.starts_with(";FFMETADATA1\n"));
        assert!(content.contains("title=A\\=B\\; \\#1\n"));
        assert!(content.contains("artist=Auth\\\\or\n"));
        assert!(content.contains("track=1/1\n"));
        assert!(content.contains("[CHAPTER]\nTIMEBASE=1/1000\nSTART=0\nEND=3600000\ntitle=Hour 1\n"));
        assert!(content.contains("START=3600000\nEND=7200000\ntitle=Hour 2\n"));
    }

    #[test]
    fn test_format_ffmpeg_timestamp() {
        assert_eq!(format_ffmpeg_timestamp(Duration::ZERO), "00:00:00.000");
        assert_eq!(
            format_ffmpeg_timestamp(Duration::from_millis(36_061_250)),
            "10:01:01.250"
        );
    }
}
