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


//! Operator configuration
//!
//! Settings come from, in increasing precedence: built-in defaults, a TOML
//! file (`<config dir>/librisplit/config.toml` unless given), environment
//! variables, and command line flags applied by the binary.
//!
//! # Environment variables
//! - `LIBATION_EXE` - Libation CLI executable
//! - `SPLIT_LIMIT_HRS` - maximum part length in hours
//! - `OUTPUT_FOLDER` - where parts are written
//! - `FILTER_BY_AUTHOR` - only process books whose author contains this
//! - `DEBUG` - `true`, `1` or `yes` for debug logging
//! - `FFMPEG_PATH`, `FFPROBE_PATH` - tool locations

use crate::audio::cutter::OutputCheck;
use crate::error::{Result, SplitError};
use crate::pipeline::RunSettings;
use directories::ProjectDirs;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Default config file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Folder below the output directory holding the job database
pub const STATE_DIR_NAME: &str = ".librisplit";

const MAX_PART_HOURS_LIMIT: f64 = 1000.0;
const MAX_CONCURRENT_BOOKS_LIMIT: usize = 16;
const MAX_CUT_ATTEMPTS_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Libation CLI; books come from its library
    pub libation_exe: Option<PathBuf>,
    /// Plain folder of audio files; takes precedence over `libation_exe`
    pub library_dir: Option<PathBuf>,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub output_dir: PathBuf,
    pub max_part_hours: f64,
    /// Job database; defaults to `<output_dir>/.librisplit/jobs.db`
    pub state_db: Option<PathBuf>,
    pub filter_by_author: Option<String>,
    pub max_concurrent_books: usize,
    /// Attempts per part, the first included
    pub max_cut_attempts: u32,
    pub min_output_bytes: u64,
    pub min_size_ratio: f64,
    /// One folder per book instead of a flat output directory
    pub per_book_subdirectory: bool,
    /// Copy finished books into this folder
    pub copy_to: Option<PathBuf>,
    /// Run Libation `scan` and `liberate` before processing
    pub sync_library: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            libation_exe: None,
            library_dir: None,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            output_dir: PathBuf::from("iPod_Ready_Parts"),
            max_part_hours: 10.0,
            state_db: None,
            filter_by_author: None,
            max_concurrent_books: 1,
            max_cut_attempts: 3,
            min_output_bytes: 1024,
            min_size_ratio: 0.5,
            per_book_subdirectory: false,
            copy_to: None,
            sync_library: true,
            debug: false,
        }
    }
}

/// Where the books of a run come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibrarySource {
    Libation(PathBuf),
    Directory(PathBuf),
}

impl Config {
    /// Platform config file location, e.g. `~/.config/librisplit/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "librisplit").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load the file at `path` (or the default location); missing means defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => {
                    debug!("No config directory on this platform, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            info!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            SplitError::config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&contents)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (an environment)
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(exe) = get("LIBATION_EXE") {
            self.libation_exe = Some(PathBuf::from(exe));
        }
        if let Some(hours) = get("SPLIT_LIMIT_HRS") {
            self.max_part_hours = hours
                .parse()
                .map_err(|_| SplitError::config(format!("SPLIT_LIMIT_HRS is not a number: '{}'", hours)))?;
        }
        if let Some(folder) = get("OUTPUT_FOLDER") {
            self.output_dir = PathBuf::from(folder);
        }
        if let Some(author) = lookup("FILTER_BY_AUTHOR") {
            let author = author.trim();
            self.filter_by_author = (!author.is_empty()).then(|| author.to_string());
        }
        if let Some(flag) = get("DEBUG") {
            self.debug = parse_flag(&flag);
        }
        if let Some(ffmpeg) = get("FFMPEG_PATH") {
            self.ffmpeg_path = PathBuf::from(ffmpeg);
        }
        if let Some(ffprobe) = get("FFPROBE_PATH") {
            self.ffprobe_path = PathBuf::from(ffprobe);
        }
        Ok(())
    }

    /// Check every value; all problems are reported together
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if !self.max_part_hours.is_finite()
            || self.max_part_hours <= 0.0
            || self.max_part_hours > MAX_PART_HOURS_LIMIT
        {
            problems.push(format!(
                "max_part_hours must be above 0 and at most {} (got {})",
                MAX_PART_HOURS_LIMIT, self.max_part_hours
            ));
        }
        if self.max_concurrent_books == 0 || self.max_concurrent_books > MAX_CONCURRENT_BOOKS_LIMIT {
            problems.push(format!(
                "max_concurrent_books must be between 1 and {} (got {})",
                MAX_CONCURRENT_BOOKS_LIMIT, self.max_concurrent_books
            ));
        }
        if self.max_cut_attempts == 0 || self.max_cut_attempts > MAX_CUT_ATTEMPTS_LIMIT {
            problems.push(format!(
                "max_cut_attempts must be between 1 and {} (got {})",
                MAX_CUT_ATTEMPTS_LIMIT, self.max_cut_attempts
            ));
        }
        if !(0.0..=1.0).contains(&self.min_size_ratio) {
            problems.push(format!(
                "min_size_ratio must be between 0 and 1 (got {})",
                self.min_size_ratio
            ));
        }
        if self.output_dir.as_os_str().is_empty() {
            problems.push("output_dir must not be empty".to_string());
        }
        if self.ffmpeg_path.as_os_str().is_empty() {
            problems.push("ffmpeg_path must not be empty".to_string());
        }
        if self.ffprobe_path.as_os_str().is_empty() {
            problems.push("ffprobe_path must not be empty".to_string());
        }
        if let (Some(copy_to), Some(root)) = (&self.copy_to, self.output_dir.canonicalize().ok()) {
            if copy_to.canonicalize().ok().as_deref() == Some(root.as_path()) {
                problems.push("copy_to must differ from output_dir".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SplitError::config(problems.join("; ")))
        }
    }

    /// Books source of a run
    pub fn library_source(&self) -> Result<LibrarySource> {
        match (&self.library_dir, &self.libation_exe) {
            (Some(dir), _) => Ok(LibrarySource::Directory(dir.clone())),
            (None, Some(exe)) => Ok(LibrarySource::Libation(exe.clone())),
            (None, None) => Err(SplitError::config(
                "no library configured: set libation_exe (or LIBATION_EXE) or library_dir",
            )),
        }
    }

    pub fn max_part_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_part_hours.max(0.0) * 3600.0)
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_db
            .clone()
            .unwrap_or_else(|| self.state_dir().join("jobs.db"))
    }

    /// Scratch folder for the job database and library exports
    pub fn state_dir(&self) -> PathBuf {
        self.output_dir.join(STATE_DIR_NAME)
    }

    pub fn output_check(&self) -> OutputCheck {
        OutputCheck {
            min_bytes: self.min_output_bytes,
            min_size_ratio: self.min_size_ratio,
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            max_part_duration: self.max_part_duration(),
            max_concurrent_books: self.max_concurrent_books,
            max_cut_attempts: self.max_cut_attempts,
            output_check: self.output_check(),
            copy_to: self.copy_to.clone(),
        }
    }

    /// Make sure the external tools start before any book is touched
    pub async fn verify_tools(&self) -> Result<()> {
        verify_runs("ffmpeg", &self.ffmpeg_path).await?;
        verify_runs("ffprobe", &self.ffprobe_path).await?;

        if let Ok(LibrarySource::Libation(exe)) = self.library_source() {
            // Bare names are looked up on PATH when run
            let is_bare_name = exe.components().count() == 1;
            if !is_bare_name && !exe.exists() {
                return Err(SplitError::ToolNotFound {
                    tool: "Libation".to_string(),
                    path: exe,
                });
            }
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SplitError::internal(e.to_string()))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

async fn verify_runs(tool: &str, path: &Path) -> Result<()> {
    let not_found = || SplitError::ToolNotFound {
        tool: tool.to_string(),
        path: path.to_path_buf(),
    };

    let status = Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|_| not_found())?;

    if !status.success() {
        return Err(not_found());
    }
    debug!("{} found at {}", tool, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.max_part_duration(), Duration::from_secs(36_000));
        assert_eq!(
            config.state_db_path(),
            PathBuf::from("iPod_Ready_Parts/.librisplit/jobs.db")
        );
        assert!(config.library_source().is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("none.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "max_part_hours = 8.5\nlibrary_dir = \"/audio\"\nper_book_subdirectory = true\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.max_part_hours, 8.5);
        assert!(config.per_book_subdirectory);
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(
            config.library_source().unwrap(),
            LibrarySource::Directory(PathBuf::from("/audio"))
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_part_hourz = 8\n").unwrap();
        assert!(matches!(
            Config::load(Some(&path)).unwrap_err(),
            SplitError::TomlError(_)
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_with(env(&[
                ("LIBATION_EXE", "/opt/libation/LibationCli"),
                ("SPLIT_LIMIT_HRS", "12"),
                ("OUTPUT_FOLDER", "/out"),
                ("DEBUG", "Yes"),
                ("FILTER_BY_AUTHOR", "  "),
            ]))
            .unwrap();

        assert_eq!(config.max_part_hours, 12.0);
        assert_eq!(config.output_dir, PathBuf::from("/out"));
        assert!(config.debug);
        assert_eq!(config.filter_by_author, None);
        assert_eq!(
            config.library_source().unwrap(),
            LibrarySource::Libation(PathBuf::from("/opt/libation/LibationCli"))
        );
    }

    #[test]
    fn test_bad_env_number_is_a_config_error() {
        let mut config = Config::default();
        let err = config
            .apply_env_with(env(&[("SPLIT_LIMIT_HRS", "ten")]))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config = Config {
            max_part_hours: 0.0,
            max_concurrent_books: 0,
            min_size_ratio: 2.0,
            ..Config::default()
        };

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("max_part_hours"));
        assert!(message.contains("max_concurrent_books"));
        assert!(message.contains("min_size_ratio"));
    }

    #[test]
    fn test_run_settings_follow_config() {
        let config = Config {
            max_part_hours: 2.0,
            max_cut_attempts: 5,
            min_output_bytes: 10,
            ..Config::default()
        };
        let settings = config.run_settings();
        assert_eq!(settings.max_part_duration, Duration::from_secs(7200));
        assert_eq!(settings.max_cut_attempts, 5);
        assert_eq!(settings.output_check.min_bytes, 10);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config {
            copy_to: Some(PathBuf::from("/music/Automatically Add")),
            ..Config::default()
        };
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_fatal() {
        let dir = tempdir().unwrap();
        let config = Config {
            ffmpeg_path: dir.path().join("no-ffmpeg"),
            ..Config::default()
        };
        let err = config.verify_tools().await.unwrap_err();
        assert!(matches!(err, SplitError::ToolNotFound { .. }));
    }
}
