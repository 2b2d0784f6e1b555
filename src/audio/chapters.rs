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


//! Chapter table model
//!
//! A book's chapter table is read once from the source file (via ffprobe)
//! and never mutated afterwards. Parts only ever receive rebased copies.
//!
//! # Invariants
//! - Chapters are ordered and contiguous: `chapters[i].end == chapters[i + 1].start`
//! - The first chapter starts at zero, the last ends at the total duration
//! - Indexes are 0-based and contiguous
//!
//! A table that is missing, empty, or violates contiguity by more than
//! [`SNAP_TOLERANCE`] is replaced by a single synthetic chapter spanning the
//! whole book, so splitting degrades to duration-only instead of failing.

use crate::error::{Result, SplitError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Largest container rounding error that is silently snapped away
pub const SNAP_TOLERANCE: Duration = Duration::from_millis(1500);

/// A named time range of a book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// 0-based position in the book's table
    pub index: u32,
    pub title: String,
    pub start: Duration,
    pub end: Duration,
}

impl Chapter {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Chapter entry as reported by the probe, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct RawChapter {
    pub title: Option<String>,
    pub start: Duration,
    pub end: Duration,
}

/// Validated chapter table of one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterTable {
    pub total_duration: Duration,
    pub chapters: Vec<Chapter>,
    /// True when the embedded table was unusable and replaced by one chapter
    pub synthetic: bool,
}

impl ChapterTable {
    /// Table with one chapter covering the whole book
    pub fn single(total_duration: Duration, title: &str) -> Self {
        Self {
            total_duration,
            chapters: vec![Chapter {
                index: 0,
                title: title.to_string(),
                start: Duration::ZERO,
                end: total_duration,
            }],
            synthetic: true,
        }
    }

    /// Build a table from probed chapters, snapping container rounding and
    /// falling back to a single chapter when the table is unusable
    pub fn from_raw(raw: &[RawChapter], total_duration: Duration, book_title: &str) -> Self {
        if raw.is_empty() {
            debug!("No embedded chapters for '{}', using one chapter", book_title);
            return Self::single(total_duration, book_title);
        }

        match Self::normalize(raw, total_duration) {
            Ok(chapters) => Self {
                total_duration,
                chapters,
                synthetic: false,
            },
            Err(reason) => {
                warn!(
                    "Chapter table of '{}' is not contiguous ({}), splitting by duration only",
                    book_title, reason
                );
                Self::single(total_duration, book_title)
            }
        }
    }

    fn normalize(raw: &[RawChapter], total_duration: Duration) -> std::result::Result<Vec<Chapter>, String> {
        let mut chapters = Vec::with_capacity(raw.len());
        let mut cursor = Duration::ZERO;

        for (i, entry) in raw.iter().enumerate() {
            if entry.end < entry.start {
                return Err(format!("chapter {} ends before it starts", i + 1));
            }
            if abs_diff(entry.start, cursor) > SNAP_TOLERANCE {
                return Err(format!(
                    "chapter {} starts at {:.3}s, expected {:.3}s",
                    i + 1,
                    entry.start.as_secs_f64(),
                    cursor.as_secs_f64()
                ));
            }

            let end = match raw.get(i + 1) {
                Some(next) => {
                    if abs_diff(entry.end, next.start) > SNAP_TOLERANCE {
                        return Err(format!(
                            "gap or overlap between chapters {} and {}",
                            i + 1,
                            i + 2
                        ));
                    }
                    next.start
                }
                None => {
                    if abs_diff(entry.end, total_duration) > SNAP_TOLERANCE {
                        return Err(format!(
                            "last chapter ends at {:.3}s but the book lasts {:.3}s",
                            entry.end.as_secs_f64(),
                            total_duration.as_secs_f64()
                        ));
                    }
                    total_duration
                }
            };

            if end < cursor {
                return Err(format!("chapter {} is out of order", i + 1));
            }

            let title = entry
                .title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Chapter {}", i + 1));

            chapters.push(Chapter {
                index: i as u32,
                title,
                start: cursor,
                end,
            });
            cursor = end;
        }

        Ok(chapters)
    }

    /// Check the ordering/contiguity invariant
    pub fn validate(&self) -> Result<()> {
        let first = self
            .chapters
            .first()
            .ok_or_else(|| SplitError::InvalidPlan("chapter table is empty".to_string()))?;
        if first.start != Duration::ZERO {
            return Err(SplitError::InvalidPlan("first chapter does not start at zero".to_string()));
        }

        for (i, pair) in self.chapters.windows(2).enumerate() {
            if pair[0].end != pair[1].start || pair[0].index as usize != i {
                return Err(SplitError::InvalidPlan(format!(
                    "chapters {} and {} are not contiguous",
                    pair[0].index, pair[1].index
                )));
            }
        }

        if self.chapters.last().map(|c| c.end) != Some(self.total_duration) {
            return Err(SplitError::InvalidPlan(
                "last chapter does not end at the total duration".to_string(),
            ));
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Parse an ffprobe seconds string ("3600.123000") at millisecond precision
pub fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_millis((seconds * 1000.0).round() as u64))
}

/// What a probe learned about a source file
#[derive(Debug, Clone, Default)]
pub struct ProbedMedia {
    pub duration: Option<Duration>,
    pub chapters: Vec<RawChapter>,
    /// Container-level tags (title, artist, ...)
    pub tags: HashMap<String, String>,
}

/// Capability: read duration and embedded chapters of a source file
pub trait ChapterProbe: Send + Sync {
    fn probe(&self, path: &Path) -> impl Future<Output = Result<ProbedMedia>> + Send;
}

/// Load a book's chapter table, degrading instead of failing where possible
///
/// The probe's duration wins; `length_hint` (e.g. catalog runtime) is used
/// when the file's duration cannot be read. Without any duration there is
/// nothing to plan and `MetadataUnreadable` is returned.
pub async fn load_chapter_table<P: ChapterProbe>(
    probe: &P,
    path: &Path,
    book_title: &str,
    length_hint: Option<Duration>,
) -> Result<ChapterTable> {
    let media = match probe.probe(path).await {
        Ok(media) => media,
        Err(e) if e.is_fatal() || e.is_cancellation() => return Err(e),
        Err(e) => {
            warn!("Could not probe '{}': {}", path.display(), e);
            ProbedMedia::default()
        }
    };

    let total = media
        .duration
        .filter(|d| !d.is_zero())
        .or_else(|| length_hint.filter(|d| !d.is_zero()))
        .ok_or_else(|| SplitError::metadata_unreadable(path, "no duration in file or catalog"))?;

    if media.duration.is_none() {
        // A catalog runtime is only minute-accurate, embedded chapters would not line up
        warn!(
            "Using catalog runtime for '{}' ({:.1}h), chapters ignored",
            book_title,
            total.as_secs_f64() / 3600.0
        );
        return Ok(ChapterTable::single(total, book_title));
    }

    Ok(ChapterTable::from_raw(&media.chapters, total, book_title))
}

/// Production probe running ffprobe
#[derive(Debug, Clone)]
pub struct FfprobeChapterProbe {
    ffprobe: PathBuf,
}

impl FfprobeChapterProbe {
    pub fn new(ffprobe: PathBuf) -> Self {
        Self { ffprobe }
    }
}

impl ChapterProbe for FfprobeChapterProbe {
    async fn probe(&self, path: &Path) -> Result<ProbedMedia> {
        debug!("[ffprobe] {} -show_format -show_chapters {}", self.ffprobe.display(), path.display());

        let output = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_chapters")
            .arg(path.as_os_str())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SplitError::ToolNotFound {
                        tool: "ffprobe".to_string(),
                        path: self.ffprobe.clone(),
                    }
                } else {
                    SplitError::metadata_unreadable(path, format!("failed to execute ffprobe: {}", e))
                }
            })?;

        if !output.status.success() {
            return Err(SplitError::metadata_unreadable(
                path,
                format!("ffprobe exited with {}", output.status),
            ));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
            .map_err(|e| SplitError::metadata_unreadable(path, e.to_string()))
    }
}

/// Parse `ffprobe -print_format json -show_format -show_chapters` output
pub fn parse_probe_output(json: &str) -> Result<ProbedMedia> {
    let probe: FfprobeOutput = serde_json::from_str(json)?;

    let (duration, tags) = match probe.format {
        Some(format) => (
            format.duration.as_deref().and_then(parse_seconds),
            format.tags.unwrap_or_default(),
        ),
        None => (None, HashMap::new()),
    };

    let chapters = probe
        .chapters
        .unwrap_or_default()
        .into_iter()
        .filter_map(|c| {
            let start = parse_seconds(&c.start_time)?;
            let end = parse_seconds(&c.end_time).unwrap_or(start);
            Some(RawChapter {
                title: c.tags.and_then(|t| t.get("title").cloned()),
                start,
                end,
            })
        })
        .collect();

    Ok(ProbedMedia {
        duration,
        chapters,
        tags,
    })
}

/// FFprobe output structures
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    chapters: Option<Vec<FfprobeChapter>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeChapter {
    start_time: String,
    end_time: String,
    tags: Option<HashMap<String, String>>,
}
