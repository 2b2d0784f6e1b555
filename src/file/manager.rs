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


//! File operations for part output
//!
//! # Key Operations
//! - Commit: rename a verified temp file onto its final name (with retry)
//! - Cleanup: delete temp/sidecar/final files of parts that must be re-cut
//! - Copy-in: copy a finished book's parts to a playback folder

use crate::error::{Result, SplitError};
use crate::file::paths::PartPaths;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// File manager for safe file operations below an output root
#[derive(Debug, Clone)]
pub struct FileManager {
    output_root: PathBuf,
}

impl FileManager {
    pub fn new(output_root: PathBuf) -> Self {
        Self { output_root }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Safe move operation with retry
    ///
    /// 1. Check source exists
    /// 2. Delete destination if it exists
    /// 3. Create destination directory
    /// 4. Rename (atomic on the same filesystem)
    /// 5. Retry up to 3 times on failure
    pub async fn safe_move(&self, source: &Path, destination: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.try_move(source, destination).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(SplitError::FileIoError(format!(
                        "Failed to move file after {} attempts: {} -> {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        source.display(),
                        destination.display(),
                        e
                    )));
                }
                Err(_) => {
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }
        }
    }

    async fn try_move(&self, source: &Path, destination: &Path) -> Result<()> {
        if !Self::file_exists(source).await {
            return Err(SplitError::FileNotFound(source.display().to_string()));
        }

        if Self::file_exists(destination).await {
            Self::safe_delete_once(destination).await?;
        }

        if let Some(parent) = destination.parent() {
            self.ensure_directory_exists(parent).await?;
        }

        fs::rename(source, destination).await.map_err(|e| {
            SplitError::FileIoError(format!(
                "Move failed: {} -> {}: {}",
                source.display(),
                destination.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Safe copy operation with retry
    pub async fn safe_copy(&self, source: &Path, destination: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.try_copy(source, destination).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(SplitError::FileIoError(format!(
                        "Failed to copy file after {} attempts: {} -> {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        source.display(),
                        destination.display(),
                        e
                    )));
                }
                Err(_) => {
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }
        }
    }

    async fn try_copy(&self, source: &Path, destination: &Path) -> Result<()> {
        if !Self::file_exists(source).await {
            return Err(SplitError::FileNotFound(source.display().to_string()));
        }

        if let Some(parent) = destination.parent() {
            self.ensure_directory_exists(parent).await?;
        }

        fs::copy(source, destination).await.map_err(|e| {
            SplitError::FileIoError(format!(
                "Copy failed: {} -> {}: {}",
                source.display(),
                destination.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Safe delete operation with retry; a missing file is not an error
    pub async fn safe_delete(&self, path: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match Self::safe_delete_once(path).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(SplitError::FileIoError(format!(
                        "Failed to delete file after {} attempts: {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        path.display(),
                        e
                    )));
                }
                Err(_) => {
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }
        }
    }

    async fn safe_delete_once(path: &Path) -> Result<()> {
        if !Self::file_exists(path).await {
            return Ok(());
        }

        fs::remove_file(path).await.map_err(|e| {
            SplitError::FileIoError(format!("Delete failed: {}: {}", path.display(), e))
        })?;

        Ok(())
    }

    /// Ensure directory exists, creating parent directories as needed
    pub async fn ensure_directory_exists(&self, path: &Path) -> Result<()> {
        if Self::file_exists(path).await {
            return Ok(());
        }

        fs::create_dir_all(path).await.map_err(|e| {
            SplitError::FileIoError(format!(
                "Failed to create directory {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Check if file exists
    pub async fn file_exists(path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Get file size in bytes
    pub async fn get_file_size(path: &Path) -> Result<u64> {
        let metadata = fs::metadata(path).await.map_err(|e| {
            SplitError::FileIoError(format!("Failed to get file size {}: {}", path.display(), e))
        })?;

        Ok(metadata.len())
    }

    /// Promote a verified temp file to its final name
    pub async fn commit_part(&self, paths: &PartPaths) -> Result<u64> {
        self.safe_move(&paths.temp_path, &paths.final_path).await?;
        self.safe_delete(&paths.sidecar_path).await?;
        Self::get_file_size(&paths.final_path).await
    }

    /// Delete every file a part may have left behind
    ///
    /// Returns how many files were actually removed. Nothing outside the
    /// output root is ever deleted.
    pub async fn discard_part(&self, paths: &PartPaths) -> Result<usize> {
        if let Some(outside) = paths.all().into_iter().find(|p| !p.starts_with(&self.output_root)) {
            return Err(SplitError::InvalidPath(format!(
                "Refusing to delete {} outside the output folder {}",
                outside.display(),
                self.output_root.display()
            )));
        }

        let mut removed = 0;
        for path in paths.all() {
            if Self::file_exists(path).await {
                self.safe_delete(path).await?;
                debug!("Deleted stale output {}", path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Absolute form of a path whose parent exists, resolving symlinks
    ///
    /// Paths that can't be resolved are returned as given.
    pub async fn canonical_path(path: &Path) -> PathBuf {
        if let Ok(resolved) = fs::canonicalize(path).await {
            return resolved;
        }

        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return path.to_path_buf();
        };
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        match fs::canonicalize(parent).await {
            Ok(dir) => dir.join(name),
            Err(_) => path.to_path_buf(),
        }
    }
}

/// Copies a finished book's parts into a playback application's folder
#[derive(Debug, Clone)]
pub struct DirectoryCopyIn {
    destination: PathBuf,
    files: FileManager,
}

impl DirectoryCopyIn {
    pub fn new(destination: PathBuf, files: FileManager) -> Self {
        Self { destination, files }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Copy each part next to the others in the destination
    ///
    /// Returns the copied destination paths.
    pub async fn copy_in(&self, parts: &[PathBuf]) -> Result<Vec<PathBuf>> {
        self.files.ensure_directory_exists(&self.destination).await?;

        let mut copied = Vec::with_capacity(parts.len());
        for part in parts {
            let name = part
                .file_name()
                .ok_or_else(|| SplitError::InvalidPath(part.display().to_string()))?;
            let target = self.destination.join(name);
            self.files.safe_copy(part, &target).await?;
            copied.push(target);
        }

        info!(
            "Copied {} file(s) to {}",
            copied.len(),
            self.destination.display()
        );
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::paths::OutputLayout;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_commit_part_renames_and_drops_sidecar() {
        let dir = tempdir().unwrap();
        let layout = OutputLayout::new(dir.path().to_path_buf(), false);
        let paths = layout.part_paths("Book", 1, 2, "m4b");
        let files = FileManager::new(dir.path().to_path_buf());

        fs::write(&paths.temp_path, vec![0u8; 4096]).await.unwrap();
        fs::write(&paths.sidecar_path, ";FFMETADATA1\n").await.unwrap();

        let size = files.commit_part(&paths).await.unwrap();

        assert_eq!(size, 4096);
        assert!(paths.final_path.exists());
        assert!(!paths.temp_path.exists());
        assert!(!paths.sidecar_path.exists());
    }

    #[tokio::test]
    async fn test_commit_without_temp_fails() {
        let dir = tempdir().unwrap();
        let layout = OutputLayout::new(dir.path().to_path_buf(), false);
        let paths = layout.part_paths("Book", 1, 2, "m4b");
        let files = FileManager::new(dir.path().to_path_buf());

        assert!(files.commit_part(&paths).await.is_err());
        assert!(!paths.final_path.exists());
    }

    #[tokio::test]
    async fn test_discard_part_removes_everything() {
        let dir = tempdir().unwrap();
        let layout = OutputLayout::new(dir.path().to_path_buf(), false);
        let paths = layout.part_paths("Book", 2, 2, "m4b");
        let files = FileManager::new(dir.path().to_path_buf());

        fs::write(&paths.temp_path, b"half").await.unwrap();
        fs::write(&paths.final_path, b"stale").await.unwrap();

        assert_eq!(files.discard_part(&paths).await.unwrap(), 2);
        assert_eq!(files.discard_part(&paths).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discard_part_stays_inside_output_root() {
        let dir = tempdir().unwrap();
        let layout = OutputLayout::new(dir.path().join("library"), false);
        let paths = layout.part_paths("Book", 1, 1, "m4b");
        fs::create_dir_all(dir.path().join("library")).await.unwrap();
        fs::write(&paths.final_path, b"source").await.unwrap();

        let files = FileManager::new(dir.path().join("out"));
        assert!(files.discard_part(&paths).await.is_err());
        assert!(paths.final_path.exists());
    }

    #[tokio::test]
    async fn test_canonical_path_of_missing_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("Novella.m4b");
        fs::write(&source, b"audio").await.unwrap();

        let via_dot = dir.path().join(".").join("Novella.m4b");
        assert_eq!(
            FileManager::canonical_path(&via_dot).await,
            FileManager::canonical_path(&source).await
        );

        let missing = dir.path().join(".").join("Novella - Part 1 of 2.m4b");
        assert_eq!(
            FileManager::canonical_path(&missing).await,
            fs::canonicalize(dir.path()).await.unwrap().join("Novella - Part 1 of 2.m4b")
        );
    }

    #[tokio::test]
    async fn test_copy_in() {
        let dir = tempdir().unwrap();
        let part = dir.path().join("Book - Part 1 of 2.m4b");
        fs::write(&part, b"audio").await.unwrap();
        let dest = dir.path().join("iTunes");

        let copy_in = DirectoryCopyIn::new(dest.clone(), FileManager::new(dir.path().to_path_buf()));
        let copied = copy_in.copy_in(&[part.clone()]).await.unwrap();

        assert_eq!(copied, vec![dest.join("Book - Part 1 of 2.m4b")]);
        assert!(part.exists());
        assert_eq!(fs::read(&copied[0]).await.unwrap(), b"audio");
    }
}
