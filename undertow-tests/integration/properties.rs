//! Property checks over layout, queue, readahead and priority math.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use proptest::prelude::*;
use undertow_core::backend::{FileEntry, StorageMode};
use undertow_core::service::testing::TestService;
use undertow_core::torrent::parsing::BencodeParser;
use undertow_core::torrent::{
    File, InfoHash, MagnetLink, PriorityPlan, Queue, QueueItem, TorrentBuilder, distance_priority,
    readahead_split,
};

use super::fixtures::{add_built, single_file};

struct Item(InfoHash);

impl QueueItem for Item {
    fn info_hash(&self) -> InfoHash {
        self.0
    }
}

fn layout(sizes: &[u64], piece_length: u64) -> (Vec<File>, u32) {
    let total: u64 = sizes.iter().sum();
    let piece_count = total.div_ceil(piece_length).max(1) as u32;
    let mut offset = 0;
    let files = sizes
        .iter()
        .enumerate()
        .map(|(index, size)| {
            let entry = FileEntry {
                path: PathBuf::from(format!("f{index}.bin")),
                offset,
                size: *size,
            };
            offset += size;
            File::new(index, &entry, piece_length, piece_count)
        })
        .collect();
    (files, piece_count)
}

proptest! {
    #[test]
    fn test_files_cover_every_piece(
        sizes in prop::collection::vec(1u64..200_000, 1..8),
        piece_length in prop::sample::select(vec![1024u64, 16 * 1024, 64 * 1024]),
    ) {
        let (files, piece_count) = layout(&sizes, piece_length);
        let mut covered = BTreeSet::new();
        for file in &files {
            prop_assert!(file.piece_start <= file.piece_end);
            prop_assert!(file.piece_end < piece_count);
            prop_assert_eq!(file.piece_from_offset(0).0, file.piece_start);
            prop_assert_eq!(file.piece_from_offset(file.size - 1).0, file.piece_end);
            covered.extend(file.piece_start..=file.piece_end);
        }
        prop_assert_eq!(covered, (0..piece_count).collect::<BTreeSet<_>>());
    }

    #[test]
    fn test_queue_keeps_one_item_per_hash(ids in prop::collection::vec(0u8..12, 0..40)) {
        let queue = Queue::new();
        let mut seen = HashSet::new();
        for id in &ids {
            let added = queue.add(Arc::new(Item(InfoHash::new([*id; 20]))));
            prop_assert_eq!(added, seen.insert(*id));
        }
        prop_assert_eq!(queue.len(), seen.len());
        if let Some(id) = ids.first() {
            let hash = InfoHash::new([*id; 20]);
            prop_assert!(queue.delete(&hash).is_some());
            prop_assert!(queue.find_by_hash(&hash).is_none());
            prop_assert_eq!(queue.len(), seen.len() - 1);
        }
    }

    #[test]
    fn test_readahead_split_within_budget(
        budget in 0u64..(1 << 34),
        active in 0usize..6,
        idle in 0usize..6,
    ) {
        let (per_active, per_idle) = readahead_split(budget, active, idle);
        prop_assert!(per_active * active as u64 + per_idle * idle as u64 <= budget);
        if active > 0 && idle > 0 && budget > 100 {
            prop_assert!(per_active * active as u64 >= per_idle * idle as u64);
        }
    }

    #[test]
    fn test_stronger_priority_wins(
        piece_count in 1u32..300,
        readers in prop::collection::vec((0u32..300, 0u32..40), 0..4),
        awaiting in prop::collection::btree_set(0u32..300, 0..5),
        memory in any::<bool>(),
    ) {
        let reader_ranges: Vec<(u32, u32)> = readers
            .iter()
            .filter(|(begin, _)| *begin < piece_count)
            .map(|(begin, len)| (*begin, (begin + len).min(piece_count - 1)))
            .collect();
        let chosen = [(0, piece_count - 1)];
        let storage = if memory { StorageMode::Memory } else { StorageMode::File };
        let plan = PriorityPlan {
            piece_count,
            storage,
            reader_ranges: &reader_ranges,
            awaiting: Some(&awaiting),
            chosen_ranges: &chosen,
        };
        let priorities = plan.build();
        prop_assert_eq!(priorities.len(), piece_count as usize);

        for piece in awaiting.range(..piece_count) {
            prop_assert_eq!(priorities[*piece as usize], 7);
        }
        let mut touched: BTreeSet<u32> = awaiting.range(..piece_count).copied().collect();
        for &(begin, end) in &reader_ranges {
            for piece in begin..=end {
                prop_assert!(priorities[piece as usize] >= distance_priority(piece - begin));
                touched.insert(piece);
            }
        }
        for piece in 0..piece_count {
            if touched.contains(&piece) {
                continue;
            }
            let expected = if memory { 0 } else { 1 };
            prop_assert_eq!(priorities[piece as usize], expected);
        }
    }

    #[test]
    fn test_magnet_round_trip(
        hash in any::<[u8; 20]>(),
        name in "[A-Za-z0-9][A-Za-z0-9._-]{0,20}",
        hosts in prop::collection::vec(1u16..500, 0..4),
    ) {
        let trackers: Vec<String> = hosts
            .iter()
            .map(|host| format!("udp://tracker{host}.example.org:1337/announce"))
            .collect();
        let magnet = MagnetLink {
            info_hash: InfoHash::new(hash),
            display_name: Some(name.clone()),
            trackers: trackers.clone(),
        };
        let parsed = MagnetLink::parse(&magnet.to_uri()).unwrap();
        prop_assert_eq!(parsed.info_hash, InfoHash::new(hash));
        prop_assert_eq!(parsed.display_name, Some(name));
        prop_assert_eq!(
            parsed.trackers.iter().collect::<BTreeSet<_>>(),
            trackers.iter().collect::<BTreeSet<_>>()
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_canonical_copy_keeps_info_hash(
        sizes in prop::collection::vec(1u64..20_000, 1..4),
        trackers in prop::collection::vec("http://[a-z]{3,8}\\.example\\.com/announce", 0..3),
    ) {
        let mut builder = TorrentBuilder::new("pack").piece_length(4096);
        for (index, size) in sizes.iter().enumerate() {
            let name = format!("part{index}.mkv");
            builder = builder.file(&[name.as_str()], *size);
        }
        let built = builder.build().unwrap();
        let canonical = BencodeParser::canonical_torrent(&built.bytes, &trackers).unwrap();
        prop_assert_eq!(
            BencodeParser::calculate_info_hash(&canonical).unwrap(),
            built.metadata.info_hash
        );
        let reparsed = BencodeParser::parse_bencode_data(&canonical).unwrap();
        prop_assert_eq!(reparsed.files.len(), sizes.len());
        prop_assert_eq!(reparsed.total_length, sizes.iter().sum::<u64>());
    }
}

#[tokio::test]
async fn test_saved_torrent_file_hashes_back() {
    let test = TestService::new(|_| {});
    let built = single_file("movie.mkv", 12);
    let (torrent, _sim) = add_built(&test, &built).await;

    let saved = std::fs::read(torrent.torrent_file_path()).unwrap();
    assert_eq!(
        BencodeParser::calculate_info_hash(&saved).unwrap(),
        built.metadata.info_hash
    );
    let metadata = BencodeParser::parse_bencode_data(&saved).unwrap();
    assert_eq!(metadata.piece_count(), 12);
}
