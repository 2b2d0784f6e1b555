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



//! Output files: naming, layout, and safe file operations
//!
//! Parts are written under a temporary name and only renamed onto their
//! final name once verified, see [`paths`] for the naming scheme.

pub mod manager;
pub mod paths;

pub use manager::{DirectoryCopyIn, FileManager};
pub use paths::{OutputLayout, PartPaths};
