//! Helpers shared by the journal-core integration tests.

#![allow(dead_code)]

use journal_common::{DualTimestamp, id128};
use journal_core::file::{JournalFileOptions, MmapCache, ResolvedMetrics};
use journal_core::repository::{File, Source, Status};
use journal_core::{JournalFile, JournalWriter, Mmap, MmapMut};
use std::num::NonZeroU64;
use tempfile::TempDir;
use uuid::Uuid;

pub const MIB: u64 = 1024 * 1024;

/// Limits that never consult the filesystem.
pub fn test_metrics() -> ResolvedMetrics {
    ResolvedMetrics {
        max_use: 64 * MIB,
        min_use: MIB,
        max_size: 8 * MIB,
        min_size: 512 * 1024,
        keep_free: 0,
        n_max_files: 100,
    }
}

pub fn test_cache() -> MmapCache {
    MmapCache::new(MIB, 16)
}

pub fn boot_field(boot_id: &Uuid) -> String {
    format!("_BOOT_ID={}", id128::to_hex(boot_id))
}

/// A freshly created active file with a writer attached.
pub struct TestJournal {
    pub dir: TempDir,
    pub file: File,
    pub cache: MmapCache,
    pub machine_id: Uuid,
    pub boot_id: Uuid,
    pub journal: JournalFile<MmapMut>,
    pub writer: JournalWriter,
    pub seqnum: u64,
}

impl TestJournal {
    pub fn new() -> Self {
        Self::with_options(|options| options, test_metrics())
    }

    pub fn with_options(
        configure: impl FnOnce(JournalFileOptions) -> JournalFileOptions,
        metrics: ResolvedMetrics,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let file = File::new(dir.path(), &Source::System, Status::Active).unwrap();
        let cache = test_cache();
        let machine_id = id128::random();
        let boot_id = id128::random();

        let options = configure(JournalFileOptions::new(machine_id, boot_id));
        let journal = options.create(&file, &cache).unwrap();
        let writer = JournalWriter::new(&journal, metrics).unwrap();

        Self {
            dir,
            file,
            cache,
            machine_id,
            boot_id,
            journal,
            writer,
            seqnum: 0,
        }
    }

    pub fn try_append(
        &mut self,
        realtime: u64,
        monotonic: u64,
        fields: &[&str],
    ) -> journal_core::Result<(u64, NonZeroU64)> {
        let fields: Vec<&[u8]> = fields.iter().map(|f| f.as_bytes()).collect();
        self.writer.append_entry(
            &mut self.journal,
            &DualTimestamp::new(realtime, monotonic),
            &self.boot_id,
            &fields,
            &mut self.seqnum,
        )
    }

    pub fn append(&mut self, realtime: u64, monotonic: u64, fields: &[&str]) -> (u64, NonZeroU64) {
        self.try_append(realtime, monotonic, fields).unwrap()
    }

    /// A second, read-only handle on the same file.
    pub fn reader(&self) -> JournalFile<Mmap> {
        JournalFile::open(self.journal.file(), &self.cache).unwrap()
    }
}

/// Decompressed payloads of the entry at `entry_offset`, sorted.
pub fn entry_payloads<M: journal_core::file::mmap::MemoryMap>(
    journal: &JournalFile<M>,
    entry_offset: NonZeroU64,
) -> Vec<String> {
    let mut offsets = Vec::new();
    journal
        .entry_data_object_offsets(entry_offset, &mut offsets)
        .unwrap();

    let mut payloads: Vec<String> = offsets
        .into_iter()
        .map(|offset| {
            let mut buf = Vec::new();
            journal.data_payload(offset, &mut buf).unwrap();
            String::from_utf8(buf).unwrap()
        })
        .collect();
    payloads.sort();
    payloads
}
