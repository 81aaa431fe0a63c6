//! Integration tests for appending entries
//!
//! Tests cover:
//! - Sequence numbers and header bookkeeping
//! - Data object deduplication across and within entries
//! - Input validation
//! - Compression of large payloads
//! - Copying entries between files

mod common;

use common::{TestJournal, entry_payloads, test_metrics};
use journal_core::file::ResolvedMetrics;
use journal_core::file::metrics::FILE_SIZE_MIN;
use journal_core::{Compression, JournalError};

#[test]
fn test_hello_world() {
    let mut tj = TestJournal::new();

    let (seqnum1, offset1) = tj.append(1_000_000, 10, &["MESSAGE=hello", "PRIORITY=6"]);
    let (seqnum2, offset2) = tj.append(2_000_000, 20, &["MESSAGE=world", "PRIORITY=6"]);

    assert_eq!((seqnum1, seqnum2), (1, 2));
    assert!(offset2 > offset1);
    assert_eq!(tj.seqnum, 2);

    let header = tj.journal.journal_header_ref();
    assert_eq!(header.n_entries, 2);
    assert_eq!(header.n_data, 3);
    assert_eq!(header.n_fields, 2);
    assert_eq!(header.head_entry_seqnum, 1);
    assert_eq!(header.tail_entry_seqnum, 2);
    assert_eq!(header.head_entry_realtime, 1_000_000);
    assert_eq!(header.tail_entry_realtime, 2_000_000);
    assert_eq!(header.tail_entry_monotonic, 20);
    assert_eq!(header.tail_entry_offset, offset2.get());

    let reader = tj.reader();
    let priority = reader.find_data(b"PRIORITY=6").unwrap().unwrap();
    assert_eq!(reader.data_ref(priority).unwrap().n_entries(), 2);

    assert_eq!(entry_payloads(&reader, offset1), ["MESSAGE=hello", "PRIORITY=6"]);
    assert_eq!(entry_payloads(&reader, offset2), ["MESSAGE=world", "PRIORITY=6"]);
}

#[test]
fn test_duplicate_fields_in_one_entry() {
    let mut tj = TestJournal::new();

    let (_, offset) = tj.append(1_000_000, 1, &["A=1", "B=2", "A=1"]);

    let reader = tj.reader();
    assert_eq!(entry_payloads(&reader, offset), ["A=1", "B=2"]);
    assert_eq!(reader.journal_header_ref().n_data, 2);

    let a = reader.find_data(b"A=1").unwrap().unwrap();
    assert_eq!(reader.data_ref(a).unwrap().n_entries(), 1);
}

#[test]
fn test_field_values_are_listed_per_field() {
    let mut tj = TestJournal::new();
    for priority in ["3", "4", "6", "4"] {
        let field = format!("PRIORITY={priority}");
        tj.append(1_000_000, 1, &["MESSAGE=x", &field]);
    }

    let reader = tj.reader();

    let mut names: Vec<Vec<u8>> = reader.fields().map(Result::unwrap).collect();
    names.sort();
    assert_eq!(names, [b"MESSAGE".to_vec(), b"PRIORITY".to_vec()]);

    let mut values: Vec<Vec<u8>> = reader
        .field_data_objects(b"PRIORITY")
        .unwrap()
        .map(|item| item.unwrap().1)
        .collect();
    values.sort();
    assert_eq!(
        values,
        [b"PRIORITY=3".to_vec(), b"PRIORITY=4".to_vec(), b"PRIORITY=6".to_vec()]
    );

    assert_eq!(reader.field_data_objects(b"MISSING").unwrap().count(), 0);
}

#[test]
fn test_invalid_entries_are_rejected() {
    let mut tj = TestJournal::new();

    assert!(matches!(tj.try_append(1, 1, &[]), Err(JournalError::InvalidField)));
    assert!(matches!(
        tj.try_append(1, 1, &["NOEQUALS"]),
        Err(JournalError::InvalidField)
    ));
    assert!(matches!(
        tj.try_append(1, 1, &["=value"]),
        Err(JournalError::InvalidField)
    ));
    assert!(matches!(
        tj.try_append(0, 1, &["MESSAGE=x"]),
        Err(JournalError::InvalidTimestamp)
    ));
    assert!(matches!(
        tj.try_append(1 << 60, 1, &["MESSAGE=x"]),
        Err(JournalError::InvalidTimestamp)
    ));

    assert_eq!(tj.journal.n_entries(), 0);
    assert_eq!(tj.seqnum, 0);

    // An empty value is fine
    let (seqnum, _) = tj.append(1, 1, &["MESSAGE="]);
    assert_eq!(seqnum, 1);
}

#[test]
fn test_sequence_numbers_follow_the_counter() {
    let mut tj = TestJournal::new();

    tj.seqnum = 41;
    let (seqnum, _) = tj.append(1_000_000, 1, &["MESSAGE=a"]);
    assert_eq!(seqnum, 42);

    // A counter behind the file never reuses a sequence number
    tj.seqnum = 5;
    let (seqnum, _) = tj.append(1_000_001, 2, &["MESSAGE=b"]);
    assert_eq!(seqnum, 43);
    assert_eq!(tj.seqnum, 43);
}

#[test]
fn test_entry_offsets_grow_across_arrays() {
    let mut tj = TestJournal::new();

    let mut appended = Vec::new();
    for i in 0..200u64 {
        let message = format!("MESSAGE=entry {i}");
        let (seqnum, offset) = tj.append(1_000_000 + i, i, &[&message, "PRIORITY=6"]);
        assert_eq!(seqnum, i + 1);
        appended.push(offset);
    }

    assert!(appended.windows(2).all(|w| w[0] < w[1]));

    let reader = tj.reader();
    let mut listed = Vec::new();
    reader.entry_offsets(&mut listed).unwrap();
    assert_eq!(listed, appended);

    // The shared value lists every entry, inline head included
    let priority = reader.find_data(b"PRIORITY=6").unwrap().unwrap();
    let cursor = reader.data_ref(priority).unwrap().inlined_cursor().unwrap();
    let mut per_data = Vec::new();
    cursor.collect_offsets(&reader, &mut per_data).unwrap();
    assert_eq!(per_data, appended);

    // 4 + 8 + 16 + 32 + 64 + 128 slots hold 200 entries in the global chain
    let header = reader.journal_header_ref();
    assert!(header.n_entry_arrays >= 6);
}

#[test]
fn test_large_payloads_are_compressed() {
    let mut tj = TestJournal::with_options(
        |options| options.with_compression(Compression::Zstd),
        test_metrics(),
    );
    assert_eq!(tj.writer.compression(), Compression::Zstd);

    let large = format!("MESSAGE={}", "abcd".repeat(1024));
    let (_, offset) = tj.append(1_000_000, 1, &[&large, "PRIORITY=6"]);

    let reader = tj.reader();
    let large_offset = reader.find_data(large.as_bytes()).unwrap().unwrap();
    let small_offset = reader.find_data(b"PRIORITY=6").unwrap().unwrap();

    {
        let large_object = reader.data_ref(large_offset).unwrap();
        assert!(large_object.is_compressed());
        assert!(large_object.raw_payload().len() < large.len());
    }
    assert!(!reader.data_ref(small_offset).unwrap().is_compressed());

    assert_eq!(entry_payloads(&reader, offset), [large.clone(), String::from("PRIORITY=6")]);

    // Appending the same value again finds the compressed object
    tj.append(1_000_001, 2, &[&large]);
    assert_eq!(tj.journal.journal_header_ref().n_data, 2);
}

#[test]
fn test_incompressible_payloads_stay_plain() {
    let mut tj = TestJournal::with_options(
        |options| options.with_compression(Compression::Lz4),
        test_metrics(),
    );

    // Pseudo-random bytes above the threshold do not shrink
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let noise: String = (0..2048)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            char::from(b'!' + (state % 90) as u8)
        })
        .collect();
    let field = format!("BLOB={noise}");
    tj.append(1_000_000, 1, &[&field]);

    let reader = tj.reader();
    let offset = reader.find_data(field.as_bytes()).unwrap().unwrap();
    assert!(!reader.data_ref(offset).unwrap().is_compressed());
}

#[test]
fn test_file_full_is_reported() {
    let metrics = ResolvedMetrics {
        max_size: FILE_SIZE_MIN,
        min_size: FILE_SIZE_MIN,
        ..test_metrics()
    };
    let mut tj = TestJournal::with_options(
        |options| {
            options
                .with_data_hash_table_buckets(64)
                .with_field_hash_table_buckets(16)
        },
        metrics,
    );

    let padding = "x".repeat(1000);
    let mut result = Ok((0, std::num::NonZeroU64::MIN));
    for i in 0..1000 {
        let message = format!("MESSAGE={i:04}{padding}");
        result = tj.try_append(1_000_000 + i, 1, &[&message]);
        if result.is_err() {
            break;
        }
    }

    let err = result.unwrap_err();
    assert!(matches!(err, JournalError::FileFull), "{err:?}");
    assert!(err.is_retryable_by_rotation());

    // What was appended before the failure is still intact
    let reader = tj.reader();
    let mut listed = Vec::new();
    reader.entry_offsets(&mut listed).unwrap();
    assert_eq!(listed.len() as u64, tj.seqnum);
    assert!(tj.seqnum > 10);
}

#[test]
fn test_copy_entry_into_empty_file_adopts_lineage() {
    let mut source = TestJournal::new();
    let (_, entry) = source.append(5_000_000, 7, &["MESSAGE=copied", "PRIORITY=3"]);
    let source_reader = source.reader();

    let mut target = TestJournal::new();
    target.seqnum = 99;
    let (seqnum, copied) = target
        .writer
        .copy_entry(&source_reader, entry, &mut target.journal, &mut target.seqnum)
        .unwrap();

    assert_eq!(seqnum, 1);
    assert_eq!(
        target.journal.journal_header_ref().seqnum_id(),
        source_reader.journal_header_ref().seqnum_id()
    );

    let target_reader = target.reader();
    assert_eq!(entry_payloads(&target_reader, copied), ["MESSAGE=copied", "PRIORITY=3"]);

    let entry = target_reader.entry_ref(copied).unwrap();
    assert_eq!(entry.header.realtime, 5_000_000);
    assert_eq!(entry.header.monotonic, 7);
    assert_eq!(entry.boot_id(), source.boot_id);
}

#[test]
fn test_copy_entry_across_lineages_is_refused() {
    let mut source = TestJournal::new();
    let (_, entry) = source.append(5_000_000, 7, &["MESSAGE=copied"]);
    let source_reader = source.reader();

    let mut target = TestJournal::new();
    target.append(1_000_000, 1, &["MESSAGE=local"]);

    let err = target
        .writer
        .copy_entry(&source_reader, entry, &mut target.journal, &mut target.seqnum)
        .unwrap_err();
    assert!(matches!(err, JournalError::ForeignLineage));
    assert_eq!(target.journal.n_entries(), 1);
}
