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


//! Split planner
//!
//! Maps a chapter table and a maximum part duration onto an ordered list of
//! parts. Pure and deterministic: no I/O, no clock, no randomness, so the
//! plan of a book can be recomputed on every resume and will always match.
//!
//! # Algorithm
//! 1. A book no longer than the budget becomes a single part
//! 2. Otherwise chapters are accumulated greedily; a part is closed at the
//!    start of the first chapter that would push it past the budget
//! 3. A chapter longer than the budget is never cut; it becomes a part of
//!    its own, flagged as oversized

use crate::audio::chapters::{Chapter, ChapterTable};
use crate::error::{Result, SplitError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One planned output part
///
/// `chapters` keep their book-relative offsets; the rebaser shifts them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartPlan {
    /// 1-based
    pub part_index: u32,
    pub total_parts: u32,
    pub start: Duration,
    pub end: Duration,
    pub chapters: Vec<Chapter>,
    /// A single chapter longer than the budget
    pub oversized: bool,
}

impl PartPlan {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    pub fn is_whole_book(&self) -> bool {
        self.total_parts == 1
    }
}

/// Ordered parts of one book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPlan {
    pub max_part: Duration,
    pub total_duration: Duration,
    pub parts: Vec<PartPlan>,
}

impl SplitPlan {
    pub fn total_parts(&self) -> u32 {
        self.parts.len() as u32
    }

    /// True when the book is cut into more than one file
    pub fn is_split(&self) -> bool {
        self.parts.len() > 1
    }

    pub fn oversized_parts(&self) -> impl Iterator<Item = &PartPlan> {
        self.parts.iter().filter(|p| p.oversized)
    }

    pub fn part(&self, part_index: u32) -> Option<&PartPlan> {
        part_index
            .checked_sub(1)
            .and_then(|i| self.parts.get(i as usize))
    }
}

/// Plan the parts of a book
pub fn plan(table: &ChapterTable, max_part: Duration) -> Result<SplitPlan> {
    if max_part.is_zero() {
        return Err(SplitError::InvalidPlan(
            "maximum part duration must be greater than zero".to_string(),
        ));
    }
    table.validate()?;

    let total = table.total_duration;

    if total <= max_part {
        return Ok(SplitPlan {
            max_part,
            total_duration: total,
            parts: vec![PartPlan {
                part_index: 1,
                total_parts: 1,
                start: Duration::ZERO,
                end: total,
                chapters: table.chapters.clone(),
                oversized: false,
            }],
        });
    }

    let mut groups: Vec<Vec<Chapter>> = Vec::new();
    let mut current: Vec<Chapter> = Vec::new();
    let mut current_start = Duration::ZERO;

    for chapter in &table.chapters {
        if !current.is_empty() && chapter.end - current_start > max_part {
            groups.push(std::mem::take(&mut current));
            current_start = chapter.start;
        }
        current.push(chapter.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let total_parts = groups.len() as u32;
    let parts = groups
        .into_iter()
        .enumerate()
        .map(|(i, chapters)| {
            let start = chapters.first().map(|c| c.start).unwrap_or_default();
            let end = chapters.last().map(|c| c.end).unwrap_or_default();
            PartPlan {
                part_index: i as u32 + 1,
                total_parts,
                start,
                end,
                oversized: end - start > max_part,
                chapters,
            }
        })
        .collect();

    Ok(SplitPlan {
        max_part,
        total_duration: total,
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chapters::RawChapter;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    fn table_from_lengths(lengths: &[Duration]) -> ChapterTable {
        let mut raw = Vec::new();
        let mut cursor = Duration::ZERO;
        for (i, len) in lengths.iter().enumerate() {
            raw.push(RawChapter {
                title: Some(format!("Chapter {}", i + 1)),
                start: cursor,
                end: cursor + *len,
            });
            cursor += *len;
        }
        let table = ChapterTable::from_raw(&raw, cursor, "Book");
        assert!(!table.synthetic);
        table
    }

    /// Seeded chapter lengths between 1 minute and 5 hours
    fn random_lengths(seed: u64, count: usize) -> Vec<Duration> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| Duration::from_secs(rng.gen_range(60..=5 * 3600)))
            .collect()
    }

    fn assert_tiles(plan: &SplitPlan) {
        let mut cursor = Duration::ZERO;
        for (i, part) in plan.parts.iter().enumerate() {
            assert_eq!(part.part_index, i as u32 + 1);
            assert_eq!(part.total_parts, plan.total_parts());
            assert_eq!(part.start, cursor, "gap or overlap before part {}", part.part_index);
            assert!(part.end > part.start || plan.total_duration.is_zero());
            cursor = part.end;
        }
        assert_eq!(cursor, plan.total_duration);
    }

    fn assert_chapters_whole(table: &ChapterTable, plan: &SplitPlan) {
        for part in &plan.parts {
            for chapter in &table.chapters {
                let starts_inside = chapter.start > part.start && chapter.start < part.end;
                let ends_inside = chapter.end > part.start && chapter.end < part.end;
                if starts_inside || ends_inside {
                    assert!(
                        part.chapters.contains(chapter),
                        "chapter {} is cut by part {}",
                        chapter.index,
                        part.part_index
                    );
                }
            }
            if part.duration() > plan.max_part {
                assert!(part.oversized);
                assert_eq!(part.chapters.len(), 1);
            }
        }
    }

    #[test]
    fn test_eleven_hour_book_splits_in_two() {
        let table = table_from_lengths(&[hours(1); 11]);
        let plan = plan(&table, hours(10)).unwrap();

        assert_eq!(plan.total_parts(), 2);
        assert_eq!(plan.parts[0].start, hours(0));
        assert_eq!(plan.parts[0].end, hours(10));
        assert_eq!(plan.parts[0].chapters.len(), 10);
        assert_eq!(plan.parts[1].start, hours(10));
        assert_eq!(plan.parts[1].end, hours(11));
        assert_eq!(plan.parts[1].chapters.len(), 1);
        assert!(plan.oversized_parts().next().is_none());
    }

    #[test]
    fn test_short_book_is_single_part() {
        let table = table_from_lengths(&[hours(2); 4]);
        let plan = plan(&table, hours(10)).unwrap();

        assert!(!plan.is_split());
        assert_eq!(plan.parts[0].start, Duration::ZERO);
        assert_eq!(plan.parts[0].end, hours(8));
        assert_eq!(plan.parts[0].chapters.len(), 4);
        assert!(plan.parts[0].is_whole_book());
    }

    #[test]
    fn test_single_long_chapter_is_oversized() {
        let table = ChapterTable::single(hours(12), "Epic");
        let plan = plan(&table, hours(10)).unwrap();

        assert_eq!(plan.total_parts(), 1);
        assert_eq!(plan.parts[0].end, hours(12));
        assert!(plan.parts[0].oversized);
    }

    #[test]
    fn test_oversized_chapter_between_normal_ones() {
        let table = table_from_lengths(&[hours(3), hours(14), hours(2)]);
        let plan = plan(&table, hours(10)).unwrap();

        assert_eq!(plan.total_parts(), 3);
        assert!(!plan.parts[0].oversized);
        assert!(plan.parts[1].oversized);
        assert_eq!(plan.parts[1].duration(), hours(14));
        assert!(!plan.parts[2].oversized);
        assert_tiles(&plan);
    }

    #[test]
    fn test_exact_fit_stays_in_one_part() {
        let table = table_from_lengths(&[hours(5), hours(5), hours(5)]);
        let plan = plan(&table, hours(10)).unwrap();

        assert_eq!(plan.total_parts(), 2);
        assert_eq!(plan.parts[0].end, hours(10));
    }

    #[test]
    fn test_zero_budget_is_rejected() {
        let table = table_from_lengths(&[hours(1)]);
        assert!(matches!(
            plan(&table, Duration::ZERO),
            Err(SplitError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_plans_tile_and_keep_chapters_whole() {
        for seed in 0..200u64 {
            let lengths = random_lengths(seed, 1 + (seed as usize % 40));
            let table = table_from_lengths(&lengths);
            for max_hours in [1, 3, 10] {
                let plan = plan(&table, hours(max_hours)).unwrap();
                assert_tiles(&plan);
                assert_chapters_whole(&table, &plan);

                let planned: usize = plan.parts.iter().map(|p| p.chapters.len()).sum();
                assert_eq!(planned, table.len());
            }
        }
    }

    #[test]
    fn test_planner_is_idempotent() {
        let table = table_from_lengths(&random_lengths(7, 30));
        let first = plan(&table, hours(10)).unwrap();
        let second = plan(&table, hours(10)).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }
}
