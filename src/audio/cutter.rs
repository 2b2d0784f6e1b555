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


//! Cutting parts with an external engine
//!
//! [`Cutter`] is the engine capability: write one part to a given path.
//! [`PartCutter`] wraps any engine with the temp-then-rename discipline:
//!
//! 1. Write the FFmetadata sidecar next to the output
//! 2. Let the engine write `"<name>.partial.<ext>"`
//! 3. Verify exit status and output size
//! 4. Rename onto the final name
//!
//! Anything that fails before step 4 removes the temp file and sidecar, so a
//! file with the final name is always a finished part.
//!
//! # FFmpeg command
//! `ffmpeg -y -ss <start> -to <end> -i <source> -i <ffmetadata> -map 0:a -map 0:v?
//!  -map_metadata 1 -map_chapters 1 -c copy -movflags +faststart <temp>`
//!
//! Streams are copied, never re-encoded. A single-part book drops `-ss/-to`.

use crate::audio::metadata::{format_ffmpeg_timestamp, EmbedMetadata};
use crate::error::{Result, SplitError};
use crate::file::manager::FileManager;
use crate::file::paths::PartPaths;
use crate::split::PartPlan;
use log::{debug, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Per-part progress callback, fraction in `0.0..=1.0`
pub type CutProgress = Arc<dyn Fn(f32) + Send + Sync>;

/// Number of stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// One engine invocation
#[derive(Debug, Clone, Copy)]
pub struct CutRequest<'a> {
    pub source: &'a Path,
    pub part: &'a PartPlan,
    pub metadata: &'a EmbedMetadata,
    /// FFmetadata file holding `metadata`
    pub metadata_file: &'a Path,
    /// Where the engine must write (the temp path)
    pub output: &'a Path,
}

/// Capability: produce one part file
///
/// Implementations stop promptly and return `Cancelled` when the token fires.
pub trait Cutter: Send + Sync {
    fn cut(
        &self,
        request: CutRequest<'_>,
        cancel: &CancellationToken,
        progress: Option<CutProgress>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Production engine running ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegCutter {
    ffmpeg: PathBuf,
}

impl FfmpegCutter {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }

    /// Arguments for one part
    pub fn build_args(request: &CutRequest<'_>) -> Vec<String> {
        let mut args = vec!["-hide_banner".to_string(), "-y".to_string()];

        if !request.part.is_whole_book() {
            args.push("-ss".to_string());
            args.push(format_ffmpeg_timestamp(request.part.start));
            args.push("-to".to_string());
            args.push(format_ffmpeg_timestamp(request.part.end));
        }

        args.push("-i".to_string());
        args.push(request.source.to_string_lossy().to_string());
        args.push("-i".to_string());
        args.push(request.metadata_file.to_string_lossy().to_string());

        for arg in [
            "-map", "0:a", "-map", "0:v?", "-map_metadata", "1", "-map_chapters", "1", "-c", "copy",
            "-movflags", "+faststart",
        ] {
            args.push(arg.to_string());
        }

        args.push(request.output.to_string_lossy().to_string());
        args
    }
}

impl Cutter for FfmpegCutter {
    async fn cut(
        &self,
        request: CutRequest<'_>,
        cancel: &CancellationToken,
        progress: Option<CutProgress>,
    ) -> Result<()> {
        let args = Self::build_args(&request);
        let part = request.part.part_index;
        debug!("[ffmpeg] {} {}", self.ffmpeg.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SplitError::ToolNotFound {
                        tool: "ffmpeg".to_string(),
                        path: self.ffmpeg.clone(),
                    }
                } else {
                    SplitError::CutFailed {
                        part,
                        exit_code: None,
                        stderr: format!("failed to execute ffmpeg: {}", e),
                    }
                }
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SplitError::internal("ffmpeg stderr was not captured"))?;

        let part_duration = request.part.duration().as_secs_f64();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut last = 0.0f32;

            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(fraction) = parse_ffmpeg_progress(&line, part_duration) {
                    if fraction - last > 0.01 {
                        last = fraction;
                        if let Some(progress) = &progress {
                            progress(fraction);
                        }
                    }
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }

            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| SplitError::CutFailed {
                part,
                exit_code: None,
                stderr: format!("ffmpeg process failed: {}", e),
            })?,
            _ = cancel.cancelled() => {
                debug!("Stopping ffmpeg for part {}", part);
                if let Err(e) = child.kill().await {
                    warn!("Failed to stop ffmpeg: {}", e);
                }
                stderr_task.abort();
                return Err(SplitError::Cancelled);
            }
        };

        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!("ffmpeg failed on part {} ({}):\n{}", part, status, stderr_tail);
            return Err(SplitError::CutFailed {
                part,
                exit_code: status.code(),
                stderr: stderr_tail,
            });
        }

        Ok(())
    }
}

/// Parse ffmpeg progress from a stderr line
///
/// ffmpeg prints `time=00:01:23.45 bitrate=64.0kbits/s`; the time is
/// relative to the output, so it is compared with the part's duration.
pub fn parse_ffmpeg_progress(line: &str, total_seconds: f64) -> Option<f32> {
    let time_start = line.find("time=")?;
    let time_str = &line[time_start + 5..];
    let time_end = time_str.find(' ').unwrap_or(time_str.len());
    let elapsed = parse_timestamp(&time_str[..time_end])?;

    if total_seconds > 0.0 {
        Some((elapsed / total_seconds).clamp(0.0, 1.0) as f32)
    } else {
        None
    }
}

/// Parse HH:MM:SS.ss into seconds
fn parse_timestamp(timestamp: &str) -> Option<f64> {
    let parts: Vec<&str> = timestamp.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Limits a finished part must meet before it is committed
#[derive(Debug, Clone, Copy)]
pub struct OutputCheck {
    /// Absolute floor in bytes
    pub min_bytes: u64,
    /// Fraction of the source bytes proportional to the part's duration
    pub min_size_ratio: f64,
}

impl Default for OutputCheck {
    fn default() -> Self {
        Self {
            min_bytes: 1024,
            min_size_ratio: 0.5,
        }
    }
}

impl OutputCheck {
    /// Smallest acceptable size of a part
    pub fn expected_minimum(&self, source_bytes: u64, part: Duration, total: Duration) -> u64 {
        if source_bytes == 0 || total.is_zero() {
            return self.min_bytes;
        }
        let share = part.as_secs_f64() / total.as_secs_f64();
        let proportional = (source_bytes as f64 * share * self.min_size_ratio) as u64;
        proportional.max(self.min_bytes)
    }
}

/// Source file facts the cutter needs for verification
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration: Duration,
}

/// Runs an engine under the temp-then-rename discipline
#[derive(Debug, Clone)]
pub struct PartCutter<C> {
    engine: C,
    files: FileManager,
    check: OutputCheck,
}

impl<C: Cutter> PartCutter<C> {
    pub fn new(engine: C, files: FileManager, check: OutputCheck) -> Self {
        Self {
            engine,
            files,
            check,
        }
    }

    pub fn engine(&self) -> &C {
        &self.engine
    }

    /// Cut, verify and commit one part; returns the committed size in bytes
    ///
    /// On any error the temp file and sidecar are gone and the final path is
    /// untouched.
    pub async fn cut_part(
        &self,
        source: &SourceFile,
        part: &PartPlan,
        metadata: &EmbedMetadata,
        paths: &PartPaths,
        cancel: &CancellationToken,
        progress: Option<CutProgress>,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(SplitError::Cancelled);
        }

        match self.try_cut(source, part, metadata, paths, cancel, progress).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.discard_attempt(paths).await;
                Err(e)
            }
        }
    }

    async fn try_cut(
        &self,
        source: &SourceFile,
        part: &PartPlan,
        metadata: &EmbedMetadata,
        paths: &PartPaths,
        cancel: &CancellationToken,
        progress: Option<CutProgress>,
    ) -> Result<u64> {
        if let Some(parent) = paths.final_path.parent() {
            self.files.ensure_directory_exists(parent).await?;
        }
        self.files.safe_delete(&paths.temp_path).await?;

        fs::write(&paths.sidecar_path, metadata.to_ffmetadata())
            .await
            .map_err(|e| {
                SplitError::FileIoError(format!(
                    "Failed to write metadata file {}: {}",
                    paths.sidecar_path.display(),
                    e
                ))
            })?;

        let request = CutRequest {
            source: &source.path,
            part,
            metadata,
            metadata_file: &paths.sidecar_path,
            output: &paths.temp_path,
        };
        self.engine.cut(request, cancel, progress).await?;

        self.verify(source, part, &paths.temp_path).await?;
        self.files.commit_part(paths).await
    }

    async fn verify(&self, source: &SourceFile, part: &PartPlan, temp: &Path) -> Result<()> {
        if !FileManager::file_exists(temp).await {
            return Err(SplitError::OutputRejected {
                part: part.part_index,
                reason: "engine reported success but wrote no file".to_string(),
            });
        }

        let size = FileManager::get_file_size(temp).await?;
        let minimum = self
            .check
            .expected_minimum(source.size_bytes, part.duration(), source.duration);

        if size < minimum {
            return Err(SplitError::OutputRejected {
                part: part.part_index,
                reason: format!("{} bytes written, expected at least {}", size, minimum),
            });
        }

        Ok(())
    }

    async fn discard_attempt(&self, paths: &PartPaths) {
        for path in [&paths.temp_path, &paths.sidecar_path] {
            if let Err(e) = self.files.safe_delete(path).await {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chapters::ChapterTable;
    use crate::audio::metadata::rebase;
    use crate::file::paths::OutputLayout;
    use crate::split::plan;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    /// Writes a fixed number of bytes, optionally failing first
    struct FakeEngine {
        bytes: usize,
        failures_left: AtomicU32,
    }

    impl Cutter for FakeEngine {
        async fn cut(
            &self,
            request: CutRequest<'_>,
            _cancel: &CancellationToken,
            progress: Option<CutProgress>,
        ) -> Result<()> {
            assert!(request.metadata_file.exists());
            fs::write(request.output, vec![1u8; self.bytes]).await?;
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SplitError::CutFailed {
                    part: request.part.part_index,
                    exit_code: Some(1),
                    stderr: "boom".to_string(),
                });
            }
            if let Some(progress) = progress {
                progress(1.0);
            }
            Ok(())
        }
    }

    fn setup(bytes: usize, failures: u32) -> (tempfile::TempDir, PartCutter<FakeEngine>, OutputLayout) {
        let dir = tempdir().unwrap();
        let files = FileManager::new(dir.path().to_path_buf());
        let cutter = PartCutter::new(
            FakeEngine {
                bytes,
                failures_left: AtomicU32::new(failures),
            },
            files,
            OutputCheck::default(),
        );
        let layout = OutputLayout::new(dir.path().to_path_buf(), false);
        (dir, cutter, layout)
    }

    fn source() -> SourceFile {
        SourceFile {
            path: PathBuf::from("/library/Book.m4b"),
            size_bytes: 10_000,
            duration: hours(20),
        }
    }

    #[tokio::test]
    async fn test_cut_part_commits_verified_output() {
        let (_dir, cutter, layout) = setup(8_000, 0);
        let split = plan(&ChapterTable::single(hours(20), "Book"), hours(30)).unwrap();
        let part = &split.parts[0];
        let meta = rebase(part, "Book", None, "m4b").unwrap();
        let paths = layout.part_paths("Book", 1, 1, "m4b");

        let bytes = cutter
            .cut_part(&source(), part, &meta, &paths, &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(bytes, 8_000);
        assert!(paths.final_path.exists());
        assert!(!paths.temp_path.exists());
        assert!(!paths.sidecar_path.exists());
    }

    #[tokio::test]
    async fn test_undersized_output_is_rejected_and_removed() {
        let (_dir, cutter, layout) = setup(2_000, 0);
        let split = plan(&ChapterTable::single(hours(20), "Book"), hours(30)).unwrap();
        let part = &split.parts[0];
        let meta = rebase(part, "Book", None, "m4b").unwrap();
        let paths = layout.part_paths("Book", 1, 1, "m4b");

        let err = cutter
            .cut_part(&source(), part, &meta, &paths, &CancellationToken::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, SplitError::OutputRejected { part: 1, .. }));
        assert!(!paths.final_path.exists());
        assert!(!paths.temp_path.exists());
        assert!(!paths.sidecar_path.exists());
    }

    #[tokio::test]
    async fn test_failed_engine_leaves_no_temp() {
        let (_dir, cutter, layout) = setup(8_000, 1);
        let split = plan(&ChapterTable::single(hours(20), "Book"), hours(30)).unwrap();
        let part = &split.parts[0];
        let meta = rebase(part, "Book", None, "m4b").unwrap();
        let paths = layout.part_paths("Book", 1, 1, "m4b");

        let err = cutter
            .cut_part(&source(), part, &meta, &paths, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!paths.temp_path.exists());

        // Second attempt succeeds
        cutter
            .cut_part(&source(), part, &meta, &paths, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(paths.final_path.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_dir, cutter, layout) = setup(8_000, 0);
        let split = plan(&ChapterTable::single(hours(20), "Book"), hours(30)).unwrap();
        let part = &split.parts[0];
        let meta = rebase(part, "Book", None, "m4b").unwrap();
        let paths = layout.part_paths("Book", 1, 1, "m4b");
        let token = CancellationToken::new();
        token.cancel();

        let err = cutter
            .cut_part(&source(), part, &meta, &paths, &token, None)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(!paths.final_path.exists());
    }

    #[test]
    fn test_expected_minimum() {
        let check = OutputCheck::default();
        assert_eq!(check.expected_minimum(0, hours(1), hours(2)), 1024);
        assert_eq!(
            check.expected_minimum(100_000_000, hours(5), hours(10)),
            25_000_000
        );
        assert_eq!(check.expected_minimum(1_000, hours(1), hours(2)), 1024);
    }

    #[test]
    fn test_build_args_for_split_part() {
        let table = ChapterTable::single(hours(12), "Book");
        let mut split = plan(&table, hours(20)).unwrap();
        let mut part = split.parts.remove(0);
        part.total_parts = 2;
        part.start = hours(10);
        let meta = EmbedMetadata {
            title: "Book - Part 2 of 2".to_string(),
            album: "Book".to_string(),
            artist: "Unknown".to_string(),
            track: "2/2".to_string(),
            chapters: Vec::new(),
            file_name: "Book - Part 2 of 2.m4b".to_string(),
        };
        let request = CutRequest {
            source: Path::new("/in/Book.m4b"),
            part: &part,
            metadata: &meta,
            metadata_file: Path::new("/out/meta.txt"),
            output: Path::new("/out/Book - Part 2 of 2.partial.m4b"),
        };

        let args = FfmpegCutter::build_args(&request);
        let joined = args.join(" ");
        assert!(joined.contains("-ss 10:00:00.000 -to 12:00:00.000 -i /in/Book.m4b -i /out/meta.txt"));
        assert!(joined.contains("-map_chapters 1 -c copy -movflags +faststart"));
        assert_eq!(args.last().unwrap(), "/out/Book - Part 2 of 2.partial.m4b");
    }

    #[test]
    fn test_build_args_for_whole_book_has_no_offsets() {
        let split = plan(&ChapterTable::single(hours(2), "Book"), hours(10)).unwrap();
        let meta = rebase(&split.parts[0], "Book", None, "m4b").unwrap();
        let request = CutRequest {
            source: Path::new("/in/Book.m4b"),
            part: &split.parts[0],
            metadata: &meta,
            metadata_file: Path::new("/out/meta.txt"),
            output: Path::new("/out/Book.partial.m4b"),
        };

        let args = FfmpegCutter::build_args(&request);
        assert!(!args.contains(&"-ss".to_string()));
        assert!(!args.contains(&"-to".to_string()));
    }

    #[test]
    fn test_parse_ffmpeg_progress() {
        let line = "size=  1024kB time=00:30:00.00 bitrate=  64.0kbits/s speed=512x";
        assert_eq!(parse_ffmpeg_progress(line, 3600.0), Some(0.5));
        assert_eq!(parse_ffmpeg_progress("no progress", 3600.0), None);
        assert_eq!(parse_ffmpeg_progress("time=02:00:00.00", 3600.0), Some(1.0));
    }
}
