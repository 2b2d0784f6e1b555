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


//! LibriSplit
//!
//! Splits long audiobooks into parts no longer than a configured limit,
//! never cutting inside a chapter. Every part carries its own chapter table
//! and part numbering, and a run interrupted at any point resumes where it
//! stopped.
//!
//! # Modules
//! - [`audio`] - chapter tables, metadata rebasing, the ffmpeg cutter
//! - [`split`] - the split planner
//! - [`jobs`] - per-book state machine and its tracker
//! - [`storage`] - SQLite job store
//! - [`pipeline`] - the orchestrator and progress events
//! - [`library`] - book sources (Libation, plain folders)
//! - [`file`] - output naming and file operations
//! - [`config`] - operator configuration

pub mod audio;
pub mod config;
pub mod error;
pub mod file;
pub mod jobs;
pub mod library;
pub mod pipeline;
pub mod split;
pub mod storage;

pub use config::Config;
pub use error::{Result, SplitError};
pub use pipeline::{BookOutcome, Orchestrator, RunSettings, RunSummary};
