//! Integration tests for entry lookups, cursors and filters

mod common;

use common::{TestJournal, boot_field};
use journal_core::file::filter::FilterExpr;
use journal_core::{Direction, JournalCursor, JournalFile, JournalFilter, Location, Mmap};
use proptest::prelude::*;
use std::num::NonZeroU64;

fn seqnum_of(journal: &JournalFile<Mmap>, offset: Option<NonZeroU64>) -> Option<u64> {
    offset.map(|o| journal.entry_ref(o).unwrap().header.seqnum)
}

/// Seqnums visited by a cursor stepping in `direction` from `location`.
fn walk(
    journal: &JournalFile<Mmap>,
    filter: Option<FilterExpr>,
    location: Location,
    direction: Direction,
) -> Vec<u64> {
    let mut cursor = JournalCursor::new();
    cursor.set_filter(filter);
    cursor.set_location(location);

    let mut seqnums = Vec::new();
    while cursor.step(journal, direction).unwrap() {
        seqnums.push(seqnum_of(journal, Some(cursor.position().unwrap())).unwrap());
    }
    seqnums
}

/// Ten entries: PRIORITY cycles through 3, 4 and 6; _PID alternates 1, 2.
fn populated() -> (TestJournal, JournalFile<Mmap>) {
    let mut tj = TestJournal::new();
    let boot = boot_field(&tj.boot_id);
    for i in 0..10u64 {
        let message = format!("MESSAGE=entry {i}");
        let priority = format!("PRIORITY={}", [3, 4, 6][i as usize % 3]);
        let pid = format!("_PID={}", 1 + i % 2);
        tj.append(1_000_000 + i * 10, 100 + i, &[&message, &priority, &pid, &boot]);
    }
    let reader = tj.reader();
    (tj, reader)
}

#[test]
fn test_next_entry_walks_both_ways() {
    let (_tj, reader) = populated();

    let head = reader.next_entry(None, Direction::Forward).unwrap();
    let tail = reader.next_entry(None, Direction::Backward).unwrap();
    assert_eq!(seqnum_of(&reader, head), Some(1));
    assert_eq!(seqnum_of(&reader, tail), Some(10));

    let second = reader.next_entry(head, Direction::Forward).unwrap();
    assert_eq!(seqnum_of(&reader, second), Some(2));
    assert_eq!(reader.next_entry(head, Direction::Backward).unwrap(), None);
    assert_eq!(reader.next_entry(tail, Direction::Forward).unwrap(), None);

    assert_eq!(
        walk(&reader, None, Location::Head, Direction::Forward),
        (1..=10).collect::<Vec<_>>()
    );
    assert_eq!(
        walk(&reader, None, Location::Tail, Direction::Backward),
        (1..=10).rev().collect::<Vec<_>>()
    );
    assert!(walk(&reader, None, Location::Head, Direction::Backward).is_empty());
}

#[test]
fn test_empty_file_has_no_entries() {
    let tj = TestJournal::new();
    let reader = tj.reader();

    assert_eq!(reader.next_entry(None, Direction::Forward).unwrap(), None);
    assert_eq!(reader.move_to_entry_by_seqnum(1, Direction::Forward).unwrap(), None);
    assert_eq!(reader.cutoff_realtime(), None);
    assert!(walk(&reader, None, Location::Tail, Direction::Backward).is_empty());
}

#[test]
fn test_seek_by_seqnum_and_realtime() {
    let (_tj, reader) = populated();

    let found = |offset| seqnum_of(&reader, offset);

    assert_eq!(found(reader.move_to_entry_by_seqnum(4, Direction::Forward).unwrap()), Some(4));
    assert_eq!(found(reader.move_to_entry_by_seqnum(4, Direction::Backward).unwrap()), Some(4));
    assert_eq!(found(reader.move_to_entry_by_seqnum(0, Direction::Forward).unwrap()), Some(1));
    assert_eq!(reader.move_to_entry_by_seqnum(11, Direction::Forward).unwrap(), None);
    assert_eq!(reader.move_to_entry_by_seqnum(0, Direction::Backward).unwrap(), None);

    // Between two entries
    assert_eq!(
        found(reader.move_to_entry_by_realtime(1_000_035, Direction::Forward).unwrap()),
        Some(5)
    );
    assert_eq!(
        found(reader.move_to_entry_by_realtime(1_000_035, Direction::Backward).unwrap()),
        Some(4)
    );

    assert_eq!(
        walk(&reader, None, Location::Seqnum(8), Direction::Forward),
        [8, 9, 10]
    );
    assert_eq!(
        walk(&reader, None, Location::Realtime(1_000_015), Direction::Backward),
        [2, 1]
    );
}

#[test]
fn test_seek_by_monotonic_within_boot() {
    let mut tj = TestJournal::new();
    let first_boot = tj.boot_id;
    let second_boot = journal_common::id128::random();

    let boot = boot_field(&first_boot);
    for i in 0..4u64 {
        tj.append(1_000_000 + i, 500 + i * 100, &["MESSAGE=first", &boot]);
    }
    tj.boot_id = second_boot;
    let boot = boot_field(&second_boot);
    for i in 0..4u64 {
        tj.append(2_000_000 + i, 10 + i * 100, &["MESSAGE=second", &boot]);
    }

    let reader = tj.reader();
    let found = |offset| seqnum_of(&reader, offset);

    let forward = reader
        .move_to_entry_by_monotonic(second_boot, 150, Direction::Forward)
        .unwrap();
    assert_eq!(found(forward), Some(7));

    let backward = reader
        .move_to_entry_by_monotonic(first_boot, 650, Direction::Backward)
        .unwrap();
    assert_eq!(found(backward), Some(2));

    let unknown = journal_common::id128::random();
    assert_eq!(
        reader.move_to_entry_by_monotonic(unknown, 0, Direction::Forward).unwrap(),
        None
    );

    assert_eq!(reader.cutoff_monotonic(first_boot).unwrap(), Some((500, 800)));
    assert_eq!(reader.cutoff_monotonic(second_boot).unwrap(), Some((10, 310)));
    assert_eq!(reader.cutoff_realtime(), Some((1_000_000, 2_000_003)));

    assert_eq!(
        walk(&reader, None, Location::Monotonic(200, second_boot), Direction::Forward),
        [7, 8]
    );
}

#[test]
fn test_lookups_restricted_to_one_value() {
    let (tj, reader) = populated();
    let found = |offset| seqnum_of(&reader, offset);

    // PRIORITY=4 appears at seqnums 2, 5 and 8
    let data = reader.find_data(b"PRIORITY=4").unwrap().unwrap();

    assert_eq!(found(reader.next_entry_for_data(data, None, Direction::Forward).unwrap()), Some(2));
    assert_eq!(found(reader.next_entry_for_data(data, None, Direction::Backward).unwrap()), Some(8));

    let at_5 = reader.move_to_entry_by_seqnum(5, Direction::Forward).unwrap().unwrap();
    assert_eq!(
        found(reader.next_entry_for_data(data, Some(at_5), Direction::Forward).unwrap()),
        Some(8)
    );
    assert_eq!(
        found(reader.next_entry_for_data(data, Some(at_5), Direction::Backward).unwrap()),
        Some(2)
    );

    assert_eq!(
        found(reader.move_to_entry_by_seqnum_for_data(data, 3, Direction::Forward).unwrap()),
        Some(5)
    );
    assert_eq!(
        found(reader.move_to_entry_by_realtime_for_data(data, 1_000_065, Direction::Backward).unwrap()),
        Some(5)
    );
    assert_eq!(
        found(reader.move_to_entry_by_offset_for_data(data, at_5, Direction::Forward).unwrap()),
        Some(5)
    );
    assert_eq!(
        reader.move_to_entry_by_seqnum_for_data(data, 9, Direction::Forward).unwrap(),
        None
    );

    // Monotonic 100 + seqnum - 1
    let boot_id = tj.boot_id;
    assert_eq!(
        found(
            reader
                .move_to_entry_by_monotonic_for_data(data, boot_id, 103, Direction::Forward)
                .unwrap()
        ),
        Some(5)
    );
    assert_eq!(
        found(
            reader
                .move_to_entry_by_monotonic_for_data(data, boot_id, 106, Direction::Backward)
                .unwrap()
        ),
        Some(5)
    );
}

#[test]
fn test_filters_combine_matches() {
    let (_tj, reader) = populated();

    let build = |configure: &dyn Fn(&mut JournalFilter)| {
        let mut filter = JournalFilter::default();
        configure(&mut filter);
        filter.build(&reader).unwrap()
    };

    // Same field: OR
    let filter = build(&|f: &mut JournalFilter| {
        f.add_match(b"PRIORITY=3").unwrap();
        f.add_match(b"PRIORITY=4").unwrap();
    });
    assert_eq!(
        walk(&reader, filter, Location::Head, Direction::Forward),
        [1, 2, 4, 5, 7, 8, 10]
    );

    // Different fields: AND
    let filter = build(&|f: &mut JournalFilter| {
        f.add_match(b"PRIORITY=3").unwrap();
        f.add_match(b"_PID=2").unwrap();
    });
    assert_eq!(walk(&reader, filter, Location::Head, Direction::Forward), [4, 10]);

    // Disjunction between groups
    let filter = build(&|f: &mut JournalFilter| {
        f.add_match(b"PRIORITY=6").unwrap();
        f.add_match(b"_PID=1").unwrap();
        f.add_disjunction();
        f.add_match(b"MESSAGE=entry 1").unwrap();
    });
    assert_eq!(walk(&reader, filter, Location::Tail, Direction::Backward), [9, 3, 2]);

    // Conjunction of alternatives
    let filter = build(&|f: &mut JournalFilter| {
        f.add_match(b"PRIORITY=3").unwrap();
        f.add_disjunction();
        f.add_match(b"PRIORITY=6").unwrap();
        f.add_conjunction();
        f.add_match(b"_PID=1").unwrap();
    });
    assert_eq!(walk(&reader, filter, Location::Head, Direction::Forward), [1, 3, 7, 9]);

    // A value absent from the file matches nothing
    let filter = build(&|f: &mut JournalFilter| {
        f.add_match(b"PRIORITY=0").unwrap();
    });
    assert!(walk(&reader, filter, Location::Head, Direction::Forward).is_empty());

    assert!(build(&|_: &mut JournalFilter| {}).is_none());
}

#[test]
fn test_filtered_seek_is_inclusive() {
    let (_tj, reader) = populated();

    let mut filter = JournalFilter::default();
    filter.add_match(b"_PID=2").unwrap();

    let expr = filter.build(&reader).unwrap();
    assert_eq!(
        walk(&reader, expr.clone(), Location::Seqnum(4), Direction::Forward),
        [4, 6, 8, 10]
    );
    assert_eq!(
        walk(&reader, expr.clone(), Location::Seqnum(5), Direction::Backward),
        [4, 2]
    );
    assert_eq!(
        walk(&reader, expr, Location::Realtime(1_000_045), Direction::Forward),
        [6, 8, 10]
    );
}

#[test]
fn test_cursor_changes_direction() {
    let (_tj, reader) = populated();

    let mut cursor = JournalCursor::new();
    assert!(cursor.position().is_err());

    for _ in 0..3 {
        assert!(cursor.step(&reader, Direction::Forward).unwrap());
    }
    assert!(cursor.step(&reader, Direction::Backward).unwrap());
    assert_eq!(seqnum_of(&reader, Some(cursor.position().unwrap())), Some(2));

    let mut filter = JournalFilter::default();
    filter.add_match(b"PRIORITY=4").unwrap();
    cursor.set_filter(filter.build(&reader).unwrap());
    assert!(cursor.step(&reader, Direction::Forward).unwrap());
    assert_eq!(seqnum_of(&reader, Some(cursor.position().unwrap())), Some(5));
    assert!(cursor.step(&reader, Direction::Backward).unwrap());
    assert_eq!(seqnum_of(&reader, Some(cursor.position().unwrap())), Some(2));
    assert!(!cursor.step(&reader, Direction::Backward).unwrap());
    assert_eq!(seqnum_of(&reader, Some(cursor.position().unwrap())), Some(2));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn realtime_lookup_matches_linear_scan(
        deltas in prop::collection::vec(0u64..3, 1..40),
        target in 0u64..120,
    ) {
        let mut tj = TestJournal::new();
        let mut realtimes = Vec::with_capacity(deltas.len());
        let mut realtime = 1;
        for delta in deltas {
            realtime += delta;
            realtimes.push(realtime);
            tj.append(realtime, 0, &["MESSAGE=x"]);
        }
        let reader = tj.reader();

        let expected_forward = realtimes.iter().position(|&r| r >= target).map(|i| i as u64 + 1);
        let expected_backward = realtimes.iter().rposition(|&r| r <= target).map(|i| i as u64 + 1);

        let forward = reader.move_to_entry_by_realtime(target, Direction::Forward).unwrap();
        let backward = reader.move_to_entry_by_realtime(target, Direction::Backward).unwrap();

        prop_assert_eq!(seqnum_of(&reader, forward), expected_forward);
        prop_assert_eq!(seqnum_of(&reader, backward), expected_backward);
    }

    #[test]
    fn filtered_walk_matches_linear_scan(
        values in prop::collection::vec(0u8..4, 1..60),
        wanted in prop::collection::btree_set(0u8..4, 1..3),
    ) {
        let mut tj = TestJournal::new();
        for (i, value) in values.iter().enumerate() {
            let field = format!("V={value}");
            tj.append(1 + i as u64, 0, &["MESSAGE=x", &field]);
        }
        let reader = tj.reader();

        let mut filter = JournalFilter::default();
        for value in &wanted {
            filter.add_match(format!("V={value}").as_bytes()).unwrap();
        }
        let expr = filter.build(&reader).unwrap();

        let expected: Vec<u64> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| wanted.contains(*v))
            .map(|(i, _)| i as u64 + 1)
            .collect();

        prop_assert_eq!(
            walk(&reader, expr.clone(), Location::Head, Direction::Forward),
            expected.clone()
        );
        let mut reversed = expected;
        reversed.reverse();
        prop_assert_eq!(walk(&reader, expr, Location::Tail, Direction::Backward), reversed);
    }
}
