//! Integration tests for the life of a file: reopening, archiving,
//! rotation, damage detection and verification.

mod common;

use common::{TestJournal, test_cache, test_metrics};
use journal_core::file::JournalState;
use journal_core::repository::{File, Status};
use journal_core::{JournalError, JournalFile, JournalWriter, Mmap, MmapMut};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

fn close(mut tj: TestJournal) -> (tempfile::TempDir, File, u64) {
    tj.journal.set_offline().unwrap();
    let TestJournal { dir, file, seqnum, .. } = tj;
    (dir, file, seqnum)
}

#[test]
fn test_reopen_continues_appending() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=before", "PRIORITY=6"]);
    let machine_id = tj.machine_id;
    let boot_id = tj.boot_id;
    let (_dir, file, mut seqnum) = close(tj);

    let cache = test_cache();
    let mut journal = JournalFile::<MmapMut>::open_for_append(&file, Some(machine_id), &cache).unwrap();
    assert_eq!(journal.state().unwrap(), JournalState::Online);

    let mut writer = JournalWriter::new(&journal, test_metrics()).unwrap();
    let (next, _) = writer
        .append_entry(
            &mut journal,
            &journal_common::DualTimestamp::new(2_000_000, 2),
            &boot_id,
            &[b"MESSAGE=after" as &[u8], b"PRIORITY=6"],
            &mut seqnum,
        )
        .unwrap();
    assert_eq!(next, 2);

    let reader = JournalFile::<Mmap>::open(&file, &cache).unwrap();
    let report = journal_core::verify(&reader).unwrap();
    assert_eq!(report.n_entries, 2);
    assert_eq!(report.n_data, 3);
    assert_eq!(report.n_fields, 2);
}

#[test]
fn test_online_file_is_not_appended_to() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=x"]);
    let cache = test_cache();
    let file = tj.file.clone();
    let _dir = tj.dir;
    drop(tj.journal);

    let err = JournalFile::<MmapMut>::open_for_append(&file, None, &cache).unwrap_err();
    assert!(matches!(err, JournalError::UncleanShutdown));
    assert!(err.is_retryable_by_rotation());

    // Readers still get the entries
    let reader = JournalFile::<Mmap>::open(&file, &cache).unwrap();
    assert_eq!(reader.n_entries(), 1);
}

#[test]
fn test_foreign_machine_is_refused() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=x"]);
    let (_dir, file, _) = close(tj);

    let other = journal_common::id128::random();
    let err = JournalFile::<MmapMut>::open_for_append(&file, Some(other), &test_cache()).unwrap_err();
    assert!(matches!(err, JournalError::ForeignLineage));
}

#[test]
fn test_rotate_archives_and_continues_lineage() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=first"]);
    tj.append(1_000_001, 2, &["MESSAGE=second"]);

    let seqnum_id = tj.journal.journal_header_ref().seqnum_id();
    let active_path = tj.file.path().to_string();

    let mut rotated = tj.journal.rotate(tj.boot_id, &tj.cache).unwrap();
    assert_eq!(rotated.file().path(), active_path);
    assert_eq!(rotated.n_entries(), 0);
    assert_eq!(rotated.journal_header_ref().seqnum_id(), seqnum_id);

    let archived: Vec<File> = journal_core::repository::scan_journal_files(tj.dir.path())
        .unwrap()
        .into_iter()
        .filter(File::is_archived)
        .collect();
    assert_eq!(archived.len(), 1);
    assert_eq!(
        archived[0].status(),
        &Status::Archived {
            seqnum_id,
            head_seqnum: 1,
            head_realtime: 1_000_000,
        }
    );

    let old = JournalFile::<Mmap>::open(&archived[0], &tj.cache).unwrap();
    assert_eq!(old.state().unwrap(), JournalState::Archived);
    assert_eq!(old.n_entries(), 2);
    assert!(matches!(
        JournalFile::<MmapMut>::open_for_append(&archived[0], None, &tj.cache),
        Err(JournalError::FileArchived)
    ));

    // Sequence numbers continue in the successor
    let mut writer = JournalWriter::new(&rotated, test_metrics()).unwrap();
    let (seqnum, _) = writer
        .append_entry(
            &mut rotated,
            &journal_common::DualTimestamp::new(1_000_002, 3),
            &tj.boot_id,
            &[b"MESSAGE=third" as &[u8]],
            &mut tj.seqnum,
        )
        .unwrap();
    assert_eq!(seqnum, 3);
}

#[test]
fn test_truncated_file_is_rejected() {
    let mut tj = TestJournal::new();
    for i in 0..20 {
        let message = format!("MESSAGE=entry {i}");
        tj.append(1_000_000 + i, i, &[&message]);
    }
    let arena_end = tj.journal.journal_header_ref().arena_end();
    let (_dir, file, _) = close(tj);

    let fd = OpenOptions::new().write(true).open(file.path()).unwrap();
    fd.set_len(arena_end - 64).unwrap();
    drop(fd);

    let err = JournalFile::<Mmap>::open(&file, &test_cache()).unwrap_err();
    assert!(err.is_corruption(), "{err:?}");

    let fd = OpenOptions::new().write(true).open(file.path()).unwrap();
    fd.set_len(100).unwrap();
    drop(fd);
    assert!(JournalFile::<Mmap>::open(&file, &test_cache()).is_err());
}

#[test]
fn test_bad_signature_is_rejected() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=x"]);
    let (_dir, file, _) = close(tj);

    let fd = OpenOptions::new().write(true).open(file.path()).unwrap();
    fd.write_all_at(b"XXXXXXXX", 0).unwrap();
    drop(fd);

    assert!(matches!(
        JournalFile::<Mmap>::open(&file, &test_cache()),
        Err(JournalError::InvalidMagicNumber)
    ));
}

#[test]
fn test_verify_detects_stale_hash() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=x", "PRIORITY=6"]);
    let reader = tj.reader();
    let data_offset = reader.find_data(b"PRIORITY=6").unwrap().unwrap();
    drop(reader);
    let (_dir, file, _) = close(tj);

    // The hash follows the 16 byte object header
    let fd = OpenOptions::new().write(true).open(file.path()).unwrap();
    fd.write_all_at(&0xdead_beef_u64.to_le_bytes(), data_offset.get() + 16)
        .unwrap();
    drop(fd);

    let reader = JournalFile::<Mmap>::open(&file, &test_cache()).unwrap();
    assert!(matches!(
        journal_core::verify(&reader),
        Err(JournalError::HashMismatch)
    ));
}

#[test]
fn test_rotation_is_suggested_when_tables_fill() {
    let mut tj = TestJournal::with_options(
        |options| options.with_data_hash_table_buckets(4),
        test_metrics(),
    );
    assert!(!tj.journal.rotate_suggested(0, 0));

    tj.append(1_000_000, 1, &["A=1", "B=2"]);
    assert!(!tj.journal.rotate_suggested(0, 0));
    tj.append(1_000_000, 1, &["C=3", "D=4"]);
    assert!(tj.journal.rotate_suggested(0, 0));
}

#[test]
fn test_rotation_is_suggested_for_old_files() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=x"]);

    assert!(!tj.journal.rotate_suggested(10_000_000, 5_000_000));
    assert!(tj.journal.rotate_suggested(10_000_000, 20_000_000));
    assert!(!tj.journal.rotate_suggested(0, 20_000_000));
    assert!(!tj.writer.rotate_suggested(&tj.journal, 0, 0));
}

#[test]
fn test_dispose_sets_the_file_aside() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=x"]);
    let (_dir, file, _) = close(tj);

    let disposed = JournalFile::<MmapMut>::dispose(&file).unwrap();
    assert!(disposed.is_disposed());
    assert!(disposed.path().ends_with(".journal~"));
    assert!(!std::path::Path::new(file.path()).exists());
    assert!(std::path::Path::new(disposed.path()).exists());
}

#[test]
fn test_print_header_describes_the_file() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=x"]);

    let mut out = Vec::new();
    tj.reader().print_header(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.contains("Sequential number ID: "));
    assert!(text.contains("State: ONLINE"));
    assert!(text.contains(tj.file.path()));
}

#[test]
fn test_append_after_sync_goes_back_online() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=first"]);
    tj.journal.set_offline().unwrap();
    assert_eq!(tj.journal.state().unwrap(), JournalState::Offline);

    tj.append(1_000_001, 2, &["MESSAGE=second"]);
    assert_eq!(tj.journal.state().unwrap(), JournalState::Online);
    assert_eq!(tj.journal.n_entries(), 2);
}

#[test]
fn test_archived_handle_refuses_appends() {
    let mut tj = TestJournal::new();
    tj.append(1_000_000, 1, &["MESSAGE=first"]);
    tj.journal.archive().unwrap();

    assert!(matches!(
        tj.try_append(1_000_001, 2, &["MESSAGE=second"]),
        Err(JournalError::FileArchived)
    ));
}
