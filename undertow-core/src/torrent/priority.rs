//! Reader-driven piece prioritization.
//!
//! One full priority vector is built per pass and handed to the library in
//! a single call.

use std::collections::BTreeSet;

use tracing::debug;

use super::{Torrent, TorrentError};
use crate::backend::StorageMode;

pub const PRIORITY_HIGHEST: u8 = 7;
pub const PRIORITY_DOWNLOAD_ALL: u8 = 4;
pub const PRIORITY_NORMAL: u8 = 1;
pub const PRIORITY_OFF: u8 = 0;

/// Deadline spacing between consecutive reader pieces, memory storage only.
const READER_DEADLINE_STEP_MS: u32 = 100;

/// Priority for a piece `distance` pieces ahead of a reader.
pub fn distance_priority(distance: u32) -> u8 {
    match distance {
        0 => 6,
        1..=2 => 5,
        3..=5 => 4,
        6..=9 => 3,
        _ => 2,
    }
}

/// Inputs of one prioritization pass.
#[derive(Debug, Clone, Default)]
pub struct PriorityPlan<'a> {
    pub piece_count: u32,
    pub storage: StorageMode,
    /// Inclusive `[begin, end]` per reader.
    pub reader_ranges: &'a [(u32, u32)],
    pub awaiting: Option<&'a BTreeSet<u32>>,
    /// Inclusive piece ranges of chosen files.
    pub chosen_ranges: &'a [(u32, u32)],
}

impl PriorityPlan<'_> {
    /// Builds the full vector. Stronger assignments win over weaker ones
    /// for the same piece.
    pub fn build(&self) -> Vec<u8> {
        let mut priorities: Vec<Option<u8>> = vec![None; self.piece_count as usize];
        for &(begin, end) in self.reader_ranges {
            for piece in begin..=end.min(self.piece_count.saturating_sub(1)) {
                let slot = &mut priorities[piece as usize];
                let priority = distance_priority(piece - begin);
                *slot = Some(slot.map_or(priority, |current| current.max(priority)));
            }
        }
        if let Some(awaiting) = self.awaiting {
            for piece in awaiting.range(..self.piece_count) {
                priorities[*piece as usize] = Some(PRIORITY_HIGHEST);
            }
        }
        if self.storage == StorageMode::File {
            for &(start, end) in self.chosen_ranges {
                for piece in start..=end.min(self.piece_count.saturating_sub(1)) {
                    priorities[piece as usize].get_or_insert(PRIORITY_NORMAL);
                }
            }
        }
        priorities
            .into_iter()
            .map(|priority| priority.unwrap_or(PRIORITY_OFF))
            .collect()
    }
}

impl Torrent {
    /// Recomputes and applies piece priorities from the current readers.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - no metadata yet, or the torrent was dropped
    /// - `TorrentError::Backend` - the library rejected the vector
    pub fn prioritize_pieces(&self) -> Result<(), TorrentError> {
        if self.is_removed() {
            return Err(TorrentError::InvalidState {
                reason: "torrent was removed".to_string(),
            });
        }
        let layout = self.layout().ok_or_else(|| TorrentError::InvalidState {
            reason: "metadata not received".to_string(),
        })?;

        let readers = self.reader_snapshot();
        let reader_ranges: Vec<(u32, u32)> = readers
            .iter()
            .map(|reader| self.reader_pieces_range(reader))
            .collect();
        let awaiting = self.awaiting.lock().clone();
        let chosen_ranges: Vec<(u32, u32)> = self
            .chosen_files()
            .iter()
            .map(|file| (file.piece_start, file.piece_end))
            .collect();

        let priorities = PriorityPlan {
            piece_count: layout.piece_count,
            storage: self.storage,
            reader_ranges: &reader_ranges,
            awaiting: Some(&awaiting),
            chosen_ranges: &chosen_ranges,
        }
        .build();
        self.handle.prioritize_pieces(&priorities)?;

        if let Some(memory) = self.handle.memory_storage() {
            let mut reader_pieces = BTreeSet::new();
            for &(begin, end) in &reader_ranges {
                for piece in begin..=end {
                    self.handle
                        .set_piece_deadline(piece, (piece - begin) * READER_DEADLINE_STEP_MS)?;
                    reader_pieces.insert(piece);
                }
            }
            for piece in &awaiting {
                self.handle.set_piece_deadline(*piece, 0)?;
            }
            memory.set_reader_pieces(reader_pieces.into_iter().collect());
            memory.set_reserved_pieces(self.reserved.read().iter().copied().collect());
        }
        debug!(
            "Prioritized {} with {} readers, {} awaiting",
            self.info_hash,
            reader_ranges.len(),
            awaiting.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_distance_bands() {
        let bands: Vec<u8> = (0..12).map(distance_priority).collect();
        assert_eq!(bands, vec![6, 5, 5, 4, 4, 4, 3, 3, 3, 3, 2, 2]);
    }

    #[test]
    fn test_two_readers() {
        let plan = PriorityPlan {
            piece_count: 300,
            storage: StorageMode::File,
            reader_ranges: &[(10, 29), (200, 219)],
            awaiting: None,
            chosen_ranges: &[(0, 299)],
        };
        let priorities = plan.build();
        for begin in [10usize, 200] {
            assert_eq!(priorities[begin], 6);
            assert_eq!(&priorities[begin + 1..=begin + 2], &[5, 5]);
            assert_eq!(&priorities[begin + 3..=begin + 5], &[4, 4, 4]);
            assert_eq!(&priorities[begin + 6..=begin + 9], &[3, 3, 3, 3]);
            assert!(priorities[begin + 10..=begin + 19].iter().all(|p| *p == 2));
        }
        assert_eq!(priorities[0], PRIORITY_NORMAL);
        assert_eq!(priorities[299], PRIORITY_NORMAL);
    }

    #[test]
    fn test_overlap_keeps_stronger() {
        let plan = PriorityPlan {
            piece_count: 40,
            storage: StorageMode::Memory,
            reader_ranges: &[(0, 20), (15, 25)],
            ..PriorityPlan::default()
        };
        let priorities = plan.build();
        assert_eq!(priorities[15], 6);
        assert_eq!(priorities[20], 3);
        assert_eq!(priorities[30], PRIORITY_OFF);
    }

    proptest! {
        #[test]
        fn test_awaiting_pieces_always_highest(
            ranges in prop::collection::vec((0u32..200, 0u32..60), 0..4),
            awaiting in prop::collection::btree_set(0u32..200, 0..10),
            memory in any::<bool>(),
        ) {
            let ranges: Vec<(u32, u32)> = ranges.into_iter().map(|(b, len)| (b, b + len)).collect();
            let plan = PriorityPlan {
                piece_count: 200,
                storage: if memory { StorageMode::Memory } else { StorageMode::File },
                reader_ranges: &ranges,
                awaiting: Some(&awaiting),
                chosen_ranges: &[(0, 199)],
            };
            let priorities = plan.build();
            prop_assert_eq!(priorities.len(), 200);
            for piece in &awaiting {
                prop_assert_eq!(priorities[*piece as usize], PRIORITY_HIGHEST);
            }
        }
    }
}
