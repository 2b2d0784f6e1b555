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



//! Audio inspection and cutting
//!
//! All heavy lifting is done by FFmpeg/FFprobe as subprocesses; nothing in
//! this crate decodes or re-encodes audio.
//!
//! # Module Organization
//!
//! ## chapters
//! - `ChapterTable` - validated, contiguous chapter table of a book
//! - `ChapterProbe` - capability to read duration and chapters (ffprobe)
//!
//! ## metadata
//! - `EmbedMetadata` - rebased chapters and tags of one part
//! - `rebase` - shift a part's chapters to start at zero
//!
//! ## cutter
//! - `Cutter` - capability to write one part (ffmpeg)
//! - `PartCutter` - temp-then-rename wrapper with output verification
//!
//! FFmpeg 4.0 or higher is recommended (`-to` as an input option).

pub mod chapters;
pub mod cutter;
pub mod metadata;

pub use chapters::{load_chapter_table, Chapter, ChapterProbe, ChapterTable, FfprobeChapterProbe};
pub use cutter::{CutProgress, CutRequest, Cutter, FfmpegCutter, OutputCheck, PartCutter, SourceFile};
pub use metadata::{rebase, EmbedMetadata};
