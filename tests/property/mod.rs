//! Property-based testing for Syncfold
//!
//! Uses proptest to verify invariants across randomly generated clocks,
//! payloads, chunk streams and version logs.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use syncfold::chunker::{Chunk, Chunker};
use syncfold::config::TransformerConfig;
use syncfold::model::{
    Checksum, DatabaseVersion, FileHistory, FileHistoryId, FileStatus, FileType, FileVersion,
};
use syncfold::multichunk::{MultiChunkReader, MultiChunker, SealedMultiChunk};
use syncfold::reconciler::{DatabaseReconciler, MergeResult};
use syncfold::transform::{MasterKey, TransformerChain};
use syncfold::vector_clock::{ClockOrdering, VectorClock};
use syncfold::MemoryDatabase;

/// Clocks over a small set of clients so that overlaps are common
fn clock_strategy() -> impl Strategy<Value = VectorClock> {
    prop::collection::btree_map(prop::sample::select(vec!["A", "B", "C", "D"]), 0u64..6, 0..4)
        .prop_map(|components| {
            let mut clock = VectorClock::new();
            for (client, value) in components {
                clock.set(client, value);
            }
            clock
        })
}

proptest! {
    #[test]
    fn prop_merge_is_commutative_associative_idempotent(
        a in clock_strategy(),
        b in clock_strategy(),
        c in clock_strategy(),
    ) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
        prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        prop_assert_eq!(a.merge(&a), a.clone());
    }

    #[test]
    fn prop_merge_dominates_both_sides(a in clock_strategy(), b in clock_strategy()) {
        let merged = a.merge(&b);
        prop_assert!(a.dominated_by(&merged));
        prop_assert!(b.dominated_by(&merged));
        prop_assert!(a.meet(&b).dominated_by(&a));
    }

    #[test]
    fn prop_compare_is_antisymmetric(a in clock_strategy(), b in clock_strategy()) {
        prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
        prop_assert_eq!(a.compare(&a), ClockOrdering::Equal);
    }

    #[test]
    fn prop_increment_happens_after(a in clock_strategy(), client in prop::sample::select(vec!["A", "B", "E"])) {
        let next = a.increment(client);
        prop_assert_eq!(next.compare(&a), ClockOrdering::After);
        prop_assert_eq!(next.get(client), a.get(client) + 1);
    }

    #[test]
    fn prop_display_parse_roundtrip(a in clock_strategy()) {
        let parsed: VectorClock = a.to_string().parse().unwrap();
        prop_assert_eq!(parsed.compare(&a), ClockOrdering::Equal);
    }
}

fn chains() -> Vec<(&'static str, TransformerChain)> {
    let key = MasterKey::new(vec![42u8; 32]).unwrap();
    [
        ("plain", TransformerConfig::plain()),
        ("lz4", TransformerConfig::compressed()),
        ("lz4+aes", TransformerConfig::compressed_and_encrypted()),
    ]
    .into_iter()
    .map(|(name, config)| (name, TransformerChain::from_config(&config, Some(&key)).unwrap()))
    .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_transformers_roundtrip(data in prop::collection::vec(any::<u8>(), 0..20_000)) {
        for (name, chain) in chains() {
            let encoded = chain.encode(&data).unwrap();
            let decoded = chain.decode(&encoded).unwrap();
            prop_assert_eq!(&decoded, &data, "chain {}", name);
        }
    }

    #[test]
    fn prop_fixed_chunks_reassemble(
        data in prop::collection::vec(any::<u8>(), 0..10_000),
        size in 1u32..3000,
    ) {
        let chunks: Vec<Chunk> = Chunker::fixed(size)
            .split(&data[..])
            .collect::<syncfold::Result<_>>()
            .unwrap();
        prop_assert!(chunks.iter().all(|c| c.size() <= size && c.size() > 0));
        prop_assert!(chunks.iter().all(|c| c.checksum == Checksum::of(&c.data)));
        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        prop_assert_eq!(joined, data);
    }

    #[test]
    fn prop_multichunks_respect_bound(
        sizes in prop::collection::vec(1usize..2000, 1..40),
        max_size in 1024u64..8192,
        seed in any::<u64>(),
    ) {
        let chain = TransformerChain::plain();
        let multi_chunker = MultiChunker::new(max_size);
        let chunks: Vec<Chunk> = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let mut data = super::random_bytes(seed.wrapping_add(i as u64), size);
                data.extend_from_slice(&(i as u64).to_le_bytes());
                Chunk::new(data)
            })
            .collect();

        let mut containers: Vec<(SealedMultiChunk, Vec<u8>)> = Vec::new();
        let mut index = 0;
        while index < chunks.len() {
            let mut buffer = Vec::new();
            let sealed = {
                let mut container = multi_chunker
                    .create(chunks[index].checksum, &mut buffer, &chain)
                    .unwrap();
                while index < chunks.len() && container.accepts(chunks[index].size()) {
                    container.write(&chunks[index]).unwrap();
                    index += 1;
                }
                container.seal().unwrap()
            };
            containers.push((sealed, buffer));
        }

        let mut seen = Vec::new();
        for (sealed, buffer) in &containers {
            prop_assert!(!sealed.chunks.is_empty());
            prop_assert!(sealed.packed_size <= max_size || sealed.chunks.len() == 1);
            prop_assert_eq!(sealed.id, sealed.chunks[0].checksum);

            let read: Vec<Checksum> = MultiChunkReader::new(&buffer[..], &chain)
                .unwrap()
                .map(|c| c.unwrap().checksum)
                .collect();
            let written: Vec<Checksum> = sealed.chunks.iter().map(|c| c.checksum).collect();
            prop_assert_eq!(&read, &written);
            seen.extend(read);
        }
        let expected: Vec<Checksum> = chunks.iter().map(|c| c.checksum).collect();
        prop_assert_eq!(seen, expected);
    }
}

fn edit(number: u64, modified_secs: i64, content: &str) -> FileVersion {
    let when = Utc.timestamp_opt(1_700_000_000 + modified_secs, 0).unwrap();
    FileVersion {
        version: number,
        path: "shared.txt".to_string(),
        file_type: FileType::File,
        status: if number == 1 { FileStatus::New } else { FileStatus::Changed },
        size: content.len() as u64,
        checksum: Some(Checksum::of(content.as_bytes())),
        link_target: None,
        last_modified: when,
        updated: when,
        permissions: None,
    }
}

fn commit(client: &str, clock: VectorClock, history: &FileHistoryId, version: FileVersion) -> DatabaseVersion {
    let mut dv = DatabaseVersion::new(client, clock);
    dv.file_histories.push(FileHistory {
        id: history.clone(),
        versions: vec![version],
    });
    dv
}

/// A1 creates the file, then B and C each edit it without seeing the other
fn divergent_logs(b_edits: &[i64], c_edits: &[i64]) -> (DatabaseVersion, Vec<DatabaseVersion>, Vec<DatabaseVersion>) {
    let history = FileHistoryId::from_string("shared");
    let base_clock = VectorClock::new().increment("A");
    let a1 = commit("A", base_clock.clone(), &history, edit(1, 0, "base"));

    let mut logs = Vec::new();
    for (client, edits) in [("B", b_edits), ("C", c_edits)] {
        let mut clock = base_clock.clone();
        let mut log = Vec::new();
        for (i, &secs) in edits.iter().enumerate() {
            clock = clock.increment(client);
            let content = format!("{} edit {}", client, i);
            log.push(commit(client, clock.clone(), &history, edit(i as u64 + 2, secs, &content)));
        }
        logs.push(log);
    }
    let c_log = logs.pop().unwrap_or_default();
    let b_log = logs.pop().unwrap_or_default();
    (a1, b_log, c_log)
}

fn summary(result: &MergeResult) -> (BTreeMap<FileHistoryId, FileVersion>, Vec<FileHistory>, BTreeSet<String>) {
    (
        result.winning_versions.clone(),
        result.conflicted_copies.clone(),
        result.accepted.iter().map(|id| id.to_string()).collect(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_reconciliation_ignores_fetch_order(
        b_edits in prop::collection::vec(0i64..100, 1..4),
        c_edits in prop::collection::vec(0i64..100, 1..4),
        seed in any::<u64>(),
    ) {
        let (a1, b_log, c_log) = divergent_logs(&b_edits, &c_edits);
        let reconciler = DatabaseReconciler::new();

        let mut ordered = BTreeMap::new();
        ordered.insert("A".to_string(), vec![a1.clone()]);
        ordered.insert("B".to_string(), b_log.clone());
        ordered.insert("C".to_string(), c_log.clone());
        let reference = reconciler.reconcile("D", &[], &ordered);

        // Same versions, shuffled into arbitrary groups
        let mut rng = StdRng::seed_from_u64(seed);
        let mut all: Vec<DatabaseVersion> = std::iter::once(a1)
            .chain(b_log)
            .chain(c_log)
            .collect();
        all.shuffle(&mut rng);
        let mut shuffled: BTreeMap<String, Vec<DatabaseVersion>> = BTreeMap::new();
        for (i, version) in all.into_iter().enumerate() {
            shuffled.entry(format!("fetch{}", i % 2)).or_default().push(version);
        }
        let result = reconciler.reconcile("D", &[], &shuffled);

        prop_assert_eq!(summary(&reference), summary(&result));
        prop_assert_eq!(reference.conflicts.len(), 1);
        prop_assert_eq!(&reference.conflicts, &result.conflicts);
        prop_assert_eq!(reference.merged_clock.compare(&result.merged_clock), ClockOrdering::Equal);
    }

    #[test]
    fn prop_every_client_picks_the_same_winner(
        b_edits in prop::collection::vec(0i64..100, 1..4),
        c_edits in prop::collection::vec(0i64..100, 1..4),
    ) {
        let (a1, b_log, c_log) = divergent_logs(&b_edits, &c_edits);
        let history = FileHistoryId::from_string("shared");
        let reconciler = DatabaseReconciler::new();

        let mut b_local = vec![a1.clone()];
        b_local.extend(b_log.clone());
        let mut from_c = BTreeMap::new();
        from_c.insert("C".to_string(), c_log.clone());
        let at_b = reconciler.reconcile("B", &b_local, &from_c);

        let mut c_local = vec![a1.clone()];
        c_local.extend(c_log.clone());
        let mut from_b = BTreeMap::new();
        from_b.insert("B".to_string(), b_log.clone());
        let at_c = reconciler.reconcile("C", &c_local, &from_b);

        let mut both = BTreeMap::new();
        both.insert("B".to_string(), b_log);
        both.insert("C".to_string(), c_log);
        let at_a = reconciler.reconcile("A", &[a1], &both);

        prop_assert_eq!(&at_b.winning_versions[&history], &at_c.winning_versions[&history]);
        prop_assert_eq!(&at_a.winning_versions[&history], &at_b.winning_versions[&history]);
        prop_assert_eq!(at_b.conflicts.len(), 1);
        prop_assert_eq!(&at_b.conflicts[0].winner, &at_c.conflicts[0].winner);
        prop_assert_eq!(&at_a.conflicts[0].winner, &at_b.conflicts[0].winner);
    }
}

fn rebuilt(merge: &MergeResult) -> MemoryDatabase {
    let mut view = MemoryDatabase::new();
    view.apply_merge(merge);
    view
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_clients_converge_after_edit_on_resolved_conflict(
        b_edits in prop::collection::vec(0i64..100, 1..4),
        c_edits in prop::collection::vec(0i64..100, 1..4),
        author_is_b in any::<bool>(),
    ) {
        let (a1, b_log, c_log) = divergent_logs(&b_edits, &c_edits);
        let history = FileHistoryId::from_string("shared");
        let reconciler = DatabaseReconciler::new();
        let (author, author_log, other, other_log) = if author_is_b {
            ("B", b_log, "C", c_log)
        } else {
            ("C", c_log, "B", b_log)
        };

        // The author resolves the conflict, then edits on top of the winner
        let mut author_local = vec![a1.clone()];
        author_local.extend(author_log.clone());
        let mut from_other = BTreeMap::new();
        from_other.insert(other.to_string(), other_log.clone());
        let resolved = reconciler.reconcile(author, &author_local, &from_other);
        prop_assert_eq!(resolved.conflicts.len(), 1);

        let mut author_view = rebuilt(&resolved);
        let next_number = author_view
            .file_history(&history)
            .and_then(|h| h.last_version())
            .map_or(1, |v| v.version + 1);
        let follow_up = commit(
            author,
            author_view.next_clock(author),
            &history,
            edit(next_number, 500, "follow-up"),
        );
        author_view.add_database_version(follow_up.clone()).unwrap();

        // The other side sees the conflict only after it was built upon
        let mut other_local = vec![a1.clone()];
        other_local.extend(other_log.clone());
        let mut published = author_log.clone();
        published.push(follow_up.clone());
        let mut from_author = BTreeMap::new();
        from_author.insert(author.to_string(), published);
        let at_other = reconciler.reconcile(other, &other_local, &from_author);
        let other_view = rebuilt(&at_other);

        let mut everything = BTreeMap::new();
        everything.insert("A".to_string(), vec![a1]);
        everything.insert(author.to_string(), author_log.into_iter().chain([follow_up]).collect());
        everything.insert(other.to_string(), other_log);
        let at_newcomer = reconciler.reconcile("D", &[], &everything);
        let newcomer_view = rebuilt(&at_newcomer);

        prop_assert!(!resolved.losing_deltas.is_empty());
        prop_assert_eq!(&at_other.losing_deltas, &resolved.losing_deltas);
        prop_assert_eq!(&at_newcomer.losing_deltas, &resolved.losing_deltas);
        prop_assert_eq!(author_view.superseded(), other_view.superseded());
        prop_assert_eq!(author_view.file_history(&history), other_view.file_history(&history));
        prop_assert_eq!(author_view.file_history(&history), newcomer_view.file_history(&history));
        prop_assert_eq!(
            other_view.file_history(&history).and_then(|h| h.last_version()).map(|v| v.version),
            Some(next_number)
        );
    }
}
