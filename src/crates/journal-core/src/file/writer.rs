use super::mmap::{MemoryMap, MmapMut};
use crate::error::{JournalError, Result};
use crate::file::compress::{Compression, Compressor, DATA_SIZE_MAX, compressor_for};
use crate::file::file::JournalFile;
use crate::file::hash::jenkins_hash64;
use crate::file::header::JournalState;
use crate::file::metrics::{FilesystemSpace, ResolvedMetrics};
use crate::file::object::{
    DataObjectHeader, EntryObjectHeader, FieldObjectHeader,
    RegularEntryItem, align8,
};
use crate::file::offset_array;
use journal_common::DualTimestamp;
use journal_common::time::{valid_monotonic, valid_realtime};
use std::num::{NonZeroU64, NonZeroUsize};

/// Payloads shorter than this are stored as is.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 512;

// Upper bound on the number of fields in one entry
const ENTRY_FIELDS_MAX: usize = 1024 * 1024;

// Capacity of the first array of a chain. Every later array doubles it.
const FIRST_ARRAY_CAPACITY: NonZeroU64 = NonZeroU64::new(4).unwrap();

#[derive(Debug, Clone, Copy)]
struct EntryItem {
    offset: NonZeroU64,
    hash: u64,
}

/// Appends entries to one journal file.
///
/// The writer tracks where the next object goes and keeps the header's
/// object bookkeeping current after every object, so that a reader (or a
/// crash) never sees an arena that ends before a linked object.
pub struct JournalWriter {
    tail_object_offset: NonZeroU64,
    append_offset: NonZeroU64,
    entry_items: Vec<EntryItem>,
    compressor: Box<dyn Compressor>,
    compress_threshold: usize,
    metrics: ResolvedMetrics,
    payload_buf: Vec<u8>,
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("append_offset", &self.append_offset)
            .field("compression", &self.compressor.compression())
            .field("compress_threshold", &self.compress_threshold)
            .finish()
    }
}

impl JournalWriter {
    /// Prepares to append after the last object of `journal_file`. The
    /// codec is the one announced in the file header.
    pub fn new(journal_file: &JournalFile<MmapMut>, metrics: ResolvedMetrics) -> Result<Self> {
        let header = journal_file.journal_header_ref();

        let tail_object_offset = header
            .tail_object_offset
            .ok_or(JournalError::InvalidHeader)?;
        let tail_object = journal_file.object_header(tail_object_offset)?;
        let append_offset = tail_object_offset.saturating_add(tail_object.aligned_size());

        let compression = [Compression::Zstd, Compression::Lz4]
            .into_iter()
            .find(|c| {
                c.header_flag()
                    .is_some_and(|flag| header.has_incompatible_flag(flag))
            })
            .unwrap_or(Compression::None);

        Ok(Self {
            tail_object_offset,
            append_offset,
            entry_items: Vec::with_capacity(128),
            compressor: compressor_for(compression),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            metrics,
            payload_buf: Vec::new(),
        })
    }

    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    pub fn compression(&self) -> Compression {
        self.compressor.compression()
    }

    pub fn metrics(&self) -> &ResolvedMetrics {
        &self.metrics
    }

    pub fn tail_object_offset(&self) -> NonZeroU64 {
        self.tail_object_offset
    }

    /// Offset one past the last object written.
    pub fn current_file_size(&self) -> u64 {
        self.append_offset.get()
    }

    /// Whether the file should be rotated before the next append.
    pub fn rotate_suggested(
        &self,
        journal_file: &JournalFile<MmapMut>,
        max_file_usec: u64,
        now_usec: u64,
    ) -> bool {
        if self.append_offset.get() > self.metrics.max_size {
            tracing::debug!(
                "{} reached its size limit of {} bytes, suggesting rotation",
                journal_file.file().path(),
                self.metrics.max_size
            );
            return true;
        }

        journal_file.rotate_suggested(max_file_usec, now_usec)
    }

    /// Appends one entry made of `fields` (`NAME=value` byte strings).
    ///
    /// The sequence number is one past the larger of `*seqnum` and the
    /// file's tail sequence number; `*seqnum` is updated to it. Returns the
    /// sequence number and offset of the new entry.
    pub fn append_entry(
        &mut self,
        journal_file: &mut JournalFile<MmapMut>,
        ts: &DualTimestamp,
        boot_id: &uuid::Uuid,
        fields: &[&[u8]],
        seqnum: &mut u64,
    ) -> Result<(u64, NonZeroU64)> {
        if !valid_realtime(ts.realtime) || !valid_monotonic(ts.monotonic) {
            return Err(JournalError::InvalidTimestamp);
        }
        if fields.is_empty() {
            return Err(JournalError::InvalidField);
        }
        if fields.len() > ENTRY_FIELDS_MAX {
            return Err(JournalError::EntryTooLarge);
        }
        for field in fields {
            if field.len() as u64 > DATA_SIZE_MAX {
                return Err(JournalError::EntryTooLarge);
            }
            match field.iter().position(|&b| b == b'=') {
                Some(0) | None => return Err(JournalError::InvalidField),
                Some(_) => {}
            }
        }

        // A file taken offline by a sync goes back online before it changes
        if journal_file.state()? == JournalState::Archived {
            return Err(JournalError::FileArchived);
        }
        journal_file.set_online()?;

        let mut xor_hash = 0;
        self.entry_items.clear();
        for payload in fields {
            let (offset, hash) = self.add_data(journal_file, payload)?;
            self.entry_items.push(EntryItem { offset, hash });

            // Jenkins even when data objects use the keyed hash
            xor_hash ^= jenkins_hash64(payload);
        }

        self.entry_items.sort_unstable_by_key(|item| item.offset);
        self.entry_items.dedup_by_key(|item| item.offset);

        let next_seqnum = (*seqnum).max(journal_file.journal_header_ref().tail_entry_seqnum) + 1;

        let entry_offset = self.append_offset;
        let n_items = self.entry_items.len() as u64;
        self.allocate(
            journal_file,
            entry_offset,
            size_of::<EntryObjectHeader>() as u64
                + n_items * size_of::<RegularEntryItem>() as u64,
        )?;
        let entry_size = {
            let mut entry_guard = journal_file.entry_mut(entry_offset, Some(n_items))?;

            entry_guard.header.seqnum = next_seqnum;
            entry_guard.header.realtime = ts.realtime;
            entry_guard.header.monotonic = ts.monotonic;
            entry_guard.header.boot_id = *boot_id.as_bytes();
            entry_guard.header.xor_hash = xor_hash;

            for (index, item) in self.entry_items.iter().enumerate() {
                entry_guard.items.set(index, item.offset, item.hash)?;
            }

            entry_guard.header.object_header.aligned_size()
        };
        self.object_added(journal_file, entry_offset, entry_size);

        let n_entries = journal_file.journal_header_ref().n_entries;
        let head = journal_file.journal_header_ref().entry_array_offset;
        let new_head = self.append_to_chain(journal_file, head, n_entries, entry_offset)?;
        if head.is_none() {
            journal_file.journal_header_mut().entry_array_offset = new_head;
        }

        self.entry_added(journal_file, entry_offset, next_seqnum, ts, boot_id);

        // The entry is counted from here on, even if linking fails below
        *seqnum = next_seqnum;

        for index in 0..self.entry_items.len() {
            let data_offset = self.entry_items[index].offset;
            self.link_data_to_entry(journal_file, data_offset, entry_offset)?;
        }

        Ok((next_seqnum, entry_offset))
    }

    /// Copies the entry at `entry_offset` of `source` into `journal_file`.
    ///
    /// Fails with [`JournalError::ForeignLineage`] when the destination
    /// already holds entries of another sequence number lineage; an empty
    /// destination adopts the source's lineage.
    pub fn copy_entry<S: MemoryMap>(
        &mut self,
        source: &JournalFile<S>,
        entry_offset: NonZeroU64,
        journal_file: &mut JournalFile<MmapMut>,
        seqnum: &mut u64,
    ) -> Result<(u64, NonZeroU64)> {
        let source_seqnum_id = source.journal_header_ref().seqnum_id();
        let target = journal_file.journal_header_ref();
        if target.seqnum_id() != source_seqnum_id {
            if target.n_entries > 0 {
                return Err(JournalError::ForeignLineage);
            }
            journal_file.journal_header_mut().seqnum_id = *source_seqnum_id.as_bytes();
            *seqnum = 0;
        }

        let (ts, boot_id) = {
            let entry = source.entry_ref(entry_offset)?;
            (
                DualTimestamp::new(entry.header.realtime, entry.header.monotonic),
                entry.boot_id(),
            )
        };

        let mut data_offsets = Vec::new();
        source.entry_data_object_offsets(entry_offset, &mut data_offsets)?;

        let mut payloads = Vec::with_capacity(data_offsets.len());
        for data_offset in data_offsets {
            let mut payload = Vec::new();
            source.data_payload(data_offset, &mut payload)?;
            payloads.push(payload);
        }

        let fields: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
        self.append_entry(journal_file, &ts, &boot_id, &fields, seqnum)
    }

    /// Checks the size policy before an object of `size` bytes is written
    /// at `offset`.
    fn allocate(
        &self,
        journal_file: &JournalFile<MmapMut>,
        offset: NonZeroU64,
        size: u64,
    ) -> Result<()> {
        let new_end = offset.get().saturating_add(align8(size));
        let old_end = self.append_offset.get();

        if new_end > self.metrics.max_size && old_end > self.metrics.min_size {
            return Err(JournalError::FileFull);
        }

        // Space is only consumed when the file grows past its current length
        if new_end > journal_file.file_size()? && self.metrics.keep_free > 0 {
            let directory = journal_file.file().directory();
            let space = FilesystemSpace::of(directory)?;
            if space.available < self.metrics.keep_free {
                tracing::warn!(
                    "only {} bytes available in {directory}, need to keep {} free",
                    space.available,
                    self.metrics.keep_free
                );
                return Err(JournalError::OutOfSpace);
            }
        }

        Ok(())
    }

    fn object_added(
        &mut self,
        journal_file: &mut JournalFile<MmapMut>,
        object_offset: NonZeroU64,
        object_size: u64,
    ) {
        self.tail_object_offset = object_offset;
        self.append_offset = object_offset.saturating_add(object_size);

        let header = journal_file.journal_header_mut();
        header.n_objects += 1;
        header.tail_object_offset = Some(self.tail_object_offset);
        header.arena_size = self.append_offset.get() - header.header_size;
    }

    fn entry_added(
        &mut self,
        journal_file: &mut JournalFile<MmapMut>,
        entry_offset: NonZeroU64,
        seqnum: u64,
        ts: &DualTimestamp,
        boot_id: &uuid::Uuid,
    ) {
        let header = journal_file.journal_header_mut();

        header.n_entries += 1;
        if header.head_entry_seqnum == 0 {
            header.head_entry_seqnum = seqnum;
        }
        if header.head_entry_realtime == 0 {
            header.head_entry_realtime = ts.realtime;
        }

        header.tail_entry_seqnum = seqnum;
        header.tail_entry_realtime = ts.realtime;
        header.tail_entry_monotonic = ts.monotonic;
        header.tail_entry_boot_id = *boot_id.as_bytes();
        header.tail_entry_offset = entry_offset.get();
    }

    /// Finds or writes the DATA object for `payload`. Returns its offset and
    /// hash.
    fn add_data(
        &mut self,
        journal_file: &mut JournalFile<MmapMut>,
        payload: &[u8],
    ) -> Result<(NonZeroU64, u64)> {
        let hash = journal_file.hash(payload);

        let (existing, depth) = journal_file.find_data_offset_with_depth(hash, payload)?;
        if let Some(data_offset) = existing {
            return Ok((data_offset, hash));
        }

        let mut compression = Compression::None;
        self.payload_buf.clear();
        if payload.len() >= self.compress_threshold {
            if let Some(compressed) = self.compressor.compress(payload) {
                compression = self.compressor.compression();
                self.payload_buf = compressed;
            }
        }
        let stored: &[u8] = if compression == Compression::None {
            payload
        } else {
            &self.payload_buf
        };

        let data_offset = self.append_offset;
        let object_size =
            size_of::<DataObjectHeader>() as u64 + stored.len() as u64;
        self.allocate(journal_file, data_offset, object_size)?;

        let data_size = {
            let mut data_guard = journal_file.data_mut(data_offset, Some(stored.len() as u64))?;

            data_guard.header.hash = hash;
            data_guard.header.object_header.flags = compression.object_flag();
            data_guard.payload_mut().copy_from_slice(stored);
            data_guard.header.object_header.aligned_size()
        };
        self.object_added(journal_file, data_offset, data_size);

        journal_file.data_hash_table_link(hash, data_offset)?;
        {
            let header = journal_file.journal_header_mut();
            header.n_data += 1;
            header.data_hash_chain_depth = header.data_hash_chain_depth.max(depth + 1);
        }

        // Thread the new value into its field's list of values
        if let Some(equals) = payload.iter().position(|&b| b == b'=') {
            let field_offset = self.add_field(journal_file, &payload[..equals])?;

            let head_data_offset = journal_file.field_ref(field_offset)?.header.head_data_offset;
            journal_file.data_mut(data_offset, None)?.header.next_field_offset = head_data_offset;
            journal_file.field_mut(field_offset, None)?.header.head_data_offset =
                Some(data_offset);
        }

        Ok((data_offset, hash))
    }

    fn add_field(
        &mut self,
        journal_file: &mut JournalFile<MmapMut>,
        name: &[u8],
    ) -> Result<NonZeroU64> {
        let hash = journal_file.hash(name);

        let (existing, depth) = journal_file.find_field_offset_with_depth(hash, name)?;
        if let Some(field_offset) = existing {
            return Ok(field_offset);
        }

        let field_offset = self.append_offset;
        let object_size =
            size_of::<FieldObjectHeader>() as u64 + name.len() as u64;
        self.allocate(journal_file, field_offset, object_size)?;

        let field_size = {
            let mut field_guard = journal_file.field_mut(field_offset, Some(name.len() as u64))?;

            field_guard.header.hash = hash;
            field_guard.payload.copy_from_slice(name);
            field_guard.header.object_header.aligned_size()
        };
        self.object_added(journal_file, field_offset, field_size);

        journal_file.field_hash_table_link(hash, field_offset)?;
        let header = journal_file.journal_header_mut();
        header.n_fields += 1;
        header.field_hash_chain_depth = header.field_hash_chain_depth.max(depth + 1);

        Ok(field_offset)
    }

    fn allocate_new_array(
        &mut self,
        journal_file: &mut JournalFile<MmapMut>,
        capacity: NonZeroU64,
    ) -> Result<NonZeroU64> {
        let array_offset = self.append_offset;
        let object_size = journal_file.offset_array_size(capacity);
        self.allocate(journal_file, array_offset, object_size)?;

        let array_size = {
            let array_guard = journal_file.offset_array_mut(array_offset, Some(capacity))?;
            array_guard.header.object_header.aligned_size()
        };
        self.object_added(journal_file, array_offset, array_size);
        journal_file.journal_header_mut().n_entry_arrays += 1;

        Ok(array_offset)
    }

    /// Appends `entry_offset` to the chain starting at `head`, which holds
    /// `n_items` offsets. Returns the head of the chain, which is new when
    /// the chain was empty.
    fn append_to_chain(
        &mut self,
        journal_file: &mut JournalFile<MmapMut>,
        head: Option<NonZeroU64>,
        n_items: u64,
        entry_offset: NonZeroU64,
    ) -> Result<Option<NonZeroU64>> {
        let list = match (head, NonZeroUsize::new(n_items as usize)) {
            (Some(head), Some(total_items)) => offset_array::List::new(head, total_items),
            (Some(head), None) => {
                // An array was allocated but never filled, e.g. after a crash
                journal_file.offset_array_mut(head, None)?.set(0, entry_offset)?;
                return Ok(Some(head));
            }
            (None, _) => {
                let array_offset = self.allocate_new_array(journal_file, FIRST_ARRAY_CAPACITY)?;
                journal_file.offset_array_mut(array_offset, None)?.set(0, entry_offset)?;
                return Ok(Some(array_offset));
            }
        };

        let tail_node = list.tail(journal_file)?;
        if tail_node.len() < tail_node.capacity() {
            let mut array_guard = journal_file.offset_array_mut(tail_node.offset(), None)?;
            array_guard.set(tail_node.len().get(), entry_offset)?;
            return Ok(head);
        }

        let capacity = NonZeroU64::new(tail_node.capacity().get() as u64 * 2)
            .ok_or(JournalError::EmptyOffsetArrayNode)?;
        let new_array_offset = self.allocate_new_array(journal_file, capacity)?;
        journal_file
            .offset_array_mut(new_array_offset, None)?
            .set(0, entry_offset)?;
        journal_file
            .offset_array_mut(tail_node.offset(), None)?
            .header
            .next_offset_array = Some(new_array_offset);

        Ok(head)
    }

    /// Records that the entry at `entry_offset` references the DATA object
    /// at `data_offset`. The first entry is stored inline in the object,
    /// later ones go to its entry array chain.
    fn link_data_to_entry(
        &mut self,
        journal_file: &mut JournalFile<MmapMut>,
        data_offset: NonZeroU64,
        entry_offset: NonZeroU64,
    ) -> Result<()> {
        let (n_entries, head) = {
            let data_guard = journal_file.data_ref(data_offset)?;
            (data_guard.n_entries(), data_guard.header.entry_array_offset)
        };

        if n_entries == 0 {
            let mut data_guard = journal_file.data_mut(data_offset, None)?;
            data_guard.header.entry_offset = Some(entry_offset);
            data_guard.header.n_entries = NonZeroU64::new(1);
            return Ok(());
        }

        let new_head = self.append_to_chain(journal_file, head, n_entries - 1, entry_offset)?;

        let mut data_guard = journal_file.data_mut(data_offset, None)?;
        data_guard.header.entry_array_offset = new_head;
        data_guard.header.n_entries = NonZeroU64::new(n_entries + 1);
        Ok(())
    }
}
