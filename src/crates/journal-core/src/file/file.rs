use super::mmap::{MemoryMap, MemoryMapMut, MmapCache, WindowManager};
use crate::error::{JournalError, Result};
use crate::file::compress::Compression;
use crate::file::guard::{GuardedCell, ValueGuard};
use crate::file::hash::HashAlgorithm;
use crate::file::header::{
    CompatibleFlag, HEADER_SIZE, HEADER_SIZE_MIN, IncompatibleFlag, JournalHeader, JournalState,
    SIGNATURE, header_contains,
};
use crate::file::metrics::ResolvedMetrics;
use crate::file::object::*;
use crate::file::offset_array::{self, Direction};
use crate::repository;
use journal_common::id128;
use lru::LruCache;
use std::cell::RefCell;
use std::fs::OpenOptions;
use std::num::{NonZeroU64, NonZeroUsize};
use std::time::Duration;
use zerocopy::FromBytes;

const DEFAULT_DATA_HASH_TABLE_BUCKETS: usize = 2047;
const DEFAULT_FIELD_HASH_TABLE_BUCKETS: usize = 333;

// Chains longer than this make lookups slow enough to warrant a new file
const HASH_CHAIN_DEPTH_MAX: u64 = 100;

const CHAIN_CACHE_MAX: usize = 20;

/// Options for creating a new journal file.
#[derive(Debug, Clone)]
pub struct JournalFileOptions {
    machine_id: uuid::Uuid,
    boot_id: uuid::Uuid,
    seqnum_id: uuid::Uuid,
    file_id: uuid::Uuid,
    data_hash_table_buckets: usize,
    field_hash_table_buckets: usize,
    keyed_hash: bool,
    compression: Compression,
}

impl JournalFileOptions {
    pub fn new(machine_id: uuid::Uuid, boot_id: uuid::Uuid) -> Self {
        Self {
            machine_id,
            boot_id,
            seqnum_id: id128::random(),
            file_id: id128::random(),
            data_hash_table_buckets: DEFAULT_DATA_HASH_TABLE_BUCKETS,
            field_hash_table_buckets: DEFAULT_FIELD_HASH_TABLE_BUCKETS,
            keyed_hash: false,
            compression: Compression::None,
        }
    }

    /// Continues the sequence number lineage of `template`.
    pub fn with_template<M: MemoryMap>(mut self, template: &JournalFile<M>) -> Self {
        self.seqnum_id = template.journal_header_ref().seqnum_id();
        self
    }

    pub fn with_seqnum_id(mut self, seqnum_id: uuid::Uuid) -> Self {
        self.seqnum_id = seqnum_id;
        self
    }

    /// Sizes the data hash table for a file that may grow to
    /// `metrics.max_size` bytes.
    pub fn with_metrics(mut self, metrics: &ResolvedMetrics) -> Self {
        // Assume an average data object of 768 bytes and a fill level of 3/4
        let buckets = (metrics.max_size * 4 / 768 / 3) as usize;
        self.data_hash_table_buckets = buckets.max(DEFAULT_DATA_HASH_TABLE_BUCKETS);
        self
    }

    pub fn with_data_hash_table_buckets(mut self, buckets: usize) -> Self {
        self.data_hash_table_buckets = buckets.max(1);
        self
    }

    pub fn with_field_hash_table_buckets(mut self, buckets: usize) -> Self {
        self.field_hash_table_buckets = buckets.max(1);
        self
    }

    pub fn with_keyed_hash(mut self, enabled: bool) -> Self {
        self.keyed_hash = enabled;
        self
    }

    /// Codec new DATA objects may use. Xz can be read but not written.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = match compression {
            Compression::Xz => Compression::None,
            other => other,
        };
        self
    }

    pub fn seqnum_id(&self) -> uuid::Uuid {
        self.seqnum_id
    }

    pub fn create(self, file: &repository::File, cache: &MmapCache) -> Result<JournalFile<super::mmap::MmapMut>> {
        JournalFile::create(file, self, cache)
    }
}

/// Hash table bucket utilization statistics
#[derive(Debug, Clone, Copy)]
pub struct BucketUtilization {
    pub data_occupied: usize,
    pub data_total: usize,
    pub field_occupied: usize,
    pub field_total: usize,
}

impl BucketUtilization {
    pub fn data_utilization(&self) -> f64 {
        if self.data_total == 0 {
            0.0
        } else {
            self.data_occupied as f64 / self.data_total as f64
        }
    }

    pub fn field_utilization(&self) -> f64 {
        if self.field_total == 0 {
            0.0
        } else {
            self.field_occupied as f64 / self.field_total as f64
        }
    }
}

/// Where a search through an entry array chain last stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCacheItem {
    pub node_offset: NonZeroU64,
    pub items_before: usize,
}

/// A journal file mapped through a small set of windows.
///
/// The header and both hash tables have dedicated mappings; every other
/// object is reached through the window manager. Objects are handed out as
/// [`ValueGuard`]s and only one may be alive at a time, since looking up the
/// next object may unmap the window the previous one lives in.
pub struct JournalFile<M: MemoryMap> {
    file: repository::File,

    header_map: HeaderMap<M>,
    data_hash_table_map: Option<M>,
    field_hash_table_map: Option<M>,

    window_manager: GuardedCell<WindowManager<M>>,

    hash_algorithm: HashAlgorithm,
    chain_cache: RefCell<LruCache<NonZeroU64, ChainCacheItem>>,
}

impl<M: MemoryMap> std::fmt::Debug for JournalFile<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalFile")
            .field("file", &self.file)
            .field("hash_algorithm", &self.hash_algorithm)
            .finish_non_exhaustive()
    }
}

/// Mapping of the first `HEADER_SIZE` bytes of a file.
///
/// The mapping starts at a page boundary and its length is checked once on
/// construction, so it always holds a whole, aligned header.
struct HeaderMap<M>(M);

impl<M: MemoryMap> HeaderMap<M> {
    fn new(map: M) -> Result<Self> {
        JournalHeader::ref_from_prefix(&map).map_err(|_| JournalError::InvalidHeader)?;
        Ok(Self(map))
    }

    fn header(&self) -> &JournalHeader {
        // SAFETY: `new` checked size and alignment, a mapping never moves
        // while it is held, and `JournalHeader` is valid for any bytes.
        unsafe { &*self.0.as_ptr().cast::<JournalHeader>() }
    }
}

impl<M: MemoryMapMut> HeaderMap<M> {
    fn header_mut(&mut self) -> &mut JournalHeader {
        // SAFETY: as in `header`, with exclusive access through `&mut self`
        unsafe { &mut *self.0.as_mut_ptr().cast::<JournalHeader>() }
    }

    fn flush(&self) -> Result<()> {
        self.0.flush()
    }
}

fn map_hash_table<M: MemoryMap>(
    file: &std::fs::File,
    offset: Option<NonZeroU64>,
    size: Option<NonZeroU64>,
) -> Result<Option<M>> {
    let (Some(offset), Some(size)) = (offset, size) else {
        return Ok(None);
    };

    let object_header_size = size_of::<ObjectHeader>() as u64;
    if offset.get() < HEADER_SIZE_MIN + object_header_size {
        return Err(JournalError::InvalidObjectLocation);
    }
    if size.get() % size_of::<HashItem>() as u64 != 0 {
        return Err(JournalError::InvalidObjectSize);
    }

    let offset = offset.get() - object_header_size;
    let size = object_header_size + size.get();
    M::create(file, offset, size).map(Some)
}

fn new_chain_cache() -> RefCell<LruCache<NonZeroU64, ChainCacheItem>> {
    let capacity = NonZeroUsize::new(CHAIN_CACHE_MAX).unwrap_or(NonZeroUsize::MIN);
    RefCell::new(LruCache::new(capacity))
}

impl<M: MemoryMap> JournalFile<M> {
    /// Opens an existing file, validating its header before anything else
    /// is read from it.
    pub fn open(file: &repository::File, cache: &MmapCache) -> Result<Self> {
        let fd = OpenOptions::new()
            .read(true)
            .write(M::GROWS_FILE)
            .open(file.path())?;

        let file_size = fd.metadata()?.len();
        if file_size < HEADER_SIZE_MIN {
            return Err(JournalError::InvalidHeader);
        }

        // Files with a legacy header may be shorter than the mapping, but the
        // excess stays within the first page and reads back as zeros.
        let header_map = HeaderMap::new(M::create(&fd, 0, HEADER_SIZE)?)?;
        let header = header_map.header();
        header.validate(file_size)?;

        let data_hash_table_map =
            map_hash_table(&fd, header.data_hash_table_offset, header.data_hash_table_size)?;
        let field_hash_table_map =
            map_hash_table(&fd, header.field_hash_table_offset, header.field_hash_table_size)?;

        let hash_algorithm = HashAlgorithm::for_header(header);
        let window_manager = GuardedCell::new(WindowManager::new(fd, cache.clone())?);

        let journal_file = JournalFile {
            file: file.clone(),
            header_map,
            data_hash_table_map,
            field_hash_table_map,
            window_manager,
            hash_algorithm,
            chain_cache: new_chain_cache(),
        };

        // Both tables must carry the object type they are used as.
        journal_file.check_hash_table(journal_file.data_hash_table_map.as_ref(), ObjectType::DataHashTable)?;
        journal_file.check_hash_table(journal_file.field_hash_table_map.as_ref(), ObjectType::FieldHashTable)?;

        Ok(journal_file)
    }

    fn check_hash_table(&self, map: Option<&M>, expected: ObjectType) -> Result<()> {
        let Some(map) = map else {
            return Ok(());
        };

        let (object_header, _) =
            ObjectHeader::ref_from_prefix(map).map_err(|_| JournalError::InvalidObjectSize)?;
        if object_header.object_type()? != expected {
            return Err(JournalError::InvalidObjectType);
        }
        if object_header.size != map.len() as u64 {
            return Err(JournalError::InvalidObjectSize);
        }
        Ok(())
    }

    pub fn file(&self) -> &repository::File {
        &self.file
    }

    pub fn hash(&self, data: &[u8]) -> u64 {
        self.hash_algorithm.hash(data)
    }

    pub fn journal_header_ref(&self) -> &JournalHeader {
        self.header_map.header()
    }

    pub fn is_compact(&self) -> bool {
        self.journal_header_ref().is_compact()
    }

    pub fn state(&self) -> Result<JournalState> {
        self.journal_header_ref().state()
    }

    pub fn n_entries(&self) -> u64 {
        self.journal_header_ref().n_entries
    }

    /// Size of the file on disk as last observed.
    pub fn file_size(&self) -> Result<u64> {
        self.window_manager.with(|wm| wm.file_size())
    }

    pub(crate) fn chain_cache_get(&self, head_offset: NonZeroU64) -> Option<ChainCacheItem> {
        self.chain_cache.borrow_mut().get(&head_offset).copied()
    }

    pub(crate) fn chain_cache_put(
        &self,
        head_offset: NonZeroU64,
        node_offset: NonZeroU64,
        items_before: usize,
    ) {
        self.chain_cache.borrow_mut().put(
            head_offset,
            ChainCacheItem {
                node_offset,
                items_before,
            },
        );
    }

    pub fn entry_list(&self) -> Option<offset_array::List> {
        let header = self.journal_header_ref();

        header.entry_array_offset.and_then(|head_offset| {
            NonZeroUsize::new(header.n_entries as usize)
                .map(|total_items| offset_array::List::new(head_offset, total_items))
        })
    }

    pub fn entry_offsets(&self, offsets: &mut Vec<NonZeroU64>) -> Result<()> {
        if let Some(entry_list) = self.entry_list() {
            entry_list.collect_offsets(self, offsets)?;
        }

        Ok(())
    }

    /// Offsets of the DATA objects referenced by the entry at `entry_offset`.
    pub fn entry_data_object_offsets(
        &self,
        entry_offset: NonZeroU64,
        offsets: &mut Vec<NonZeroU64>,
    ) -> Result<()> {
        let entry_guard = self.entry_ref(entry_offset)?;
        entry_guard.collect_offsets(offsets)
    }

    pub fn data_hash_table_ref(&self) -> Option<DataHashTable<&[u8]>> {
        self.data_hash_table_map
            .as_ref()
            .and_then(|m| DataHashTable::<&[u8]>::from_data(&m[..], false))
    }

    pub fn field_hash_table_ref(&self) -> Option<FieldHashTable<&[u8]>> {
        self.field_hash_table_map
            .as_ref()
            .and_then(|m| FieldHashTable::<&[u8]>::from_data(&m[..], false))
    }

    /// Checks that an object of `size` bytes may start at `offset`.
    fn check_object_location(&self, offset: NonZeroU64, size: u64) -> Result<()> {
        let header = self.journal_header_ref();

        if offset.get() % OBJECT_ALIGNMENT != 0 || offset.get() < header.header_size {
            return Err(JournalError::InvalidObjectLocation);
        }
        if size < size_of::<ObjectHeader>() as u64 {
            return Err(JournalError::InvalidObjectSize);
        }
        match offset.get().checked_add(size) {
            Some(end) if end <= header.arena_end() => Ok(()),
            _ => Err(JournalError::ObjectExceedsFile),
        }
    }

    fn object_size(
        &self,
        wm: &mut WindowManager<M>,
        offset: NonZeroU64,
        expected: Option<ObjectType>,
    ) -> Result<u64> {
        let header_slice = wm.get_slice(offset.get(), size_of::<ObjectHeader>() as u64)?;
        let (object_header, _) =
            ObjectHeader::ref_from_prefix(header_slice).map_err(|_| JournalError::InvalidObjectSize)?;

        let object_type = object_header.object_type()?;
        if let Some(expected) = expected {
            if object_type != expected {
                return Err(JournalError::InvalidObjectType);
            }
        }
        if object_header.size < object_type.min_size(self.is_compact()) {
            return Err(JournalError::InvalidObjectSize);
        }
        Ok(object_header.size)
    }

    /// Copy of the header of the object at `offset`.
    pub fn object_header(&self, offset: NonZeroU64) -> Result<ObjectHeader> {
        self.check_object_location(offset, size_of::<ObjectHeader>() as u64)?;

        self.window_manager.with(|wm| {
            let slice = wm.get_slice(offset.get(), size_of::<ObjectHeader>() as u64)?;
            ObjectHeader::read_from_prefix(slice)
                .map(|(header, _)| header)
                .map_err(|_| JournalError::InvalidObjectSize)
        })?
    }

    /// Reads the object at `offset` whatever its type.
    pub fn get_object(&self, offset: NonZeroU64) -> Result<ValueGuard<'_, Object<&[u8]>>> {
        self.check_object_location(offset, size_of::<ObjectHeader>() as u64)?;
        let is_compact = self.is_compact();

        self.window_manager.with_guarded(offset, |wm| {
            let size = self.object_size(wm, offset, None)?;
            self.check_object_location(offset, size)?;
            Object::parse(wm.get_slice(offset.get(), size)?, is_compact)
        })
    }

    /// Reads the object at `offset`, failing unless it has type `T`.
    fn move_to<'a, T>(
        &'a self,
        object_type: ObjectType,
        offset: NonZeroU64,
    ) -> Result<ValueGuard<'a, T>>
    where
        T: JournalObject<&'a [u8]>,
    {
        self.check_object_location(offset, size_of::<ObjectHeader>() as u64)?;
        let is_compact = self.is_compact();

        self.window_manager.with_guarded(offset, |wm| {
            let size = self.object_size(wm, offset, Some(object_type))?;
            self.check_object_location(offset, size)?;

            let data = wm.get_slice(offset.get(), size)?;
            T::from_data(data, is_compact).ok_or(JournalError::InvalidZeroCopySize)
        })
    }

    pub fn offset_array_ref(
        &self,
        offset: NonZeroU64,
    ) -> Result<ValueGuard<'_, OffsetArrayObject<&[u8]>>> {
        self.move_to(ObjectType::EntryArray, offset)
    }

    pub fn field_ref(&self, offset: NonZeroU64) -> Result<ValueGuard<'_, FieldObject<&[u8]>>> {
        self.move_to(ObjectType::Field, offset)
    }

    pub fn entry_ref(&self, offset: NonZeroU64) -> Result<ValueGuard<'_, EntryObject<&[u8]>>> {
        self.move_to(ObjectType::Entry, offset)
    }

    pub fn data_ref(&self, offset: NonZeroU64) -> Result<ValueGuard<'_, DataObject<&[u8]>>> {
        self.move_to(ObjectType::Data, offset)
    }

    pub fn tag_ref(&self, offset: NonZeroU64) -> Result<ValueGuard<'_, TagObject<&[u8]>>> {
        self.move_to(ObjectType::Tag, offset)
    }

    /// Decompressed payload of the DATA object at `offset`.
    pub fn data_payload(&self, offset: NonZeroU64, buf: &mut Vec<u8>) -> Result<()> {
        let data_guard = self.data_ref(offset)?;
        data_guard.payload_into(buf)
    }

    /// Walks a hash chain looking for an object with `payload`. Returns the
    /// match, if any, and the number of objects visited.
    fn find_in_chain<'a, T>(
        &'a self,
        object_type: ObjectType,
        head: Option<NonZeroU64>,
        hash: u64,
        payload: &[u8],
    ) -> Result<(Option<NonZeroU64>, u64)>
    where
        T: JournalObject<&'a [u8]> + HashableObject,
    {
        let max_depth = self.journal_header_ref().n_objects;
        let mut buf = Vec::new();
        let mut depth = 0;
        let mut next = head;

        while let Some(offset) = next {
            depth += 1;
            if depth > max_depth {
                return Err(JournalError::HashChainCycle);
            }

            let object = self.move_to::<T>(object_type, offset)?;
            if object.hash() == hash {
                let matches = match object.compression()? {
                    Compression::None => object.raw_payload() == payload,
                    _ => {
                        object.payload_into(&mut buf)?;
                        buf == payload
                    }
                };
                if matches {
                    return Ok((Some(offset), depth));
                }
            }

            next = object.next_hash_offset();
        }

        Ok((None, depth))
    }

    pub(crate) fn find_data_offset_with_depth(
        &self,
        hash: u64,
        payload: &[u8],
    ) -> Result<(Option<NonZeroU64>, u64)> {
        let head = self
            .data_hash_table_ref()
            .ok_or(JournalError::MissingHashTable)?
            .hash_item_ref(hash)
            .head_hash_offset;
        self.find_in_chain::<DataObject<&[u8]>>(ObjectType::Data, head, hash, payload)
    }

    pub(crate) fn find_field_offset_with_depth(
        &self,
        hash: u64,
        payload: &[u8],
    ) -> Result<(Option<NonZeroU64>, u64)> {
        let head = self
            .field_hash_table_ref()
            .ok_or(JournalError::MissingHashTable)?
            .hash_item_ref(hash)
            .head_hash_offset;
        self.find_in_chain::<FieldObject<&[u8]>>(ObjectType::Field, head, hash, payload)
    }

    /// Offset of the DATA object holding exactly `payload`.
    pub fn find_data_offset(&self, hash: u64, payload: &[u8]) -> Result<Option<NonZeroU64>> {
        self.find_data_offset_with_depth(hash, payload).map(|(offset, _)| offset)
    }

    /// Offset of the FIELD object named exactly `payload`.
    pub fn find_field_offset(&self, hash: u64, payload: &[u8]) -> Result<Option<NonZeroU64>> {
        self.find_field_offset_with_depth(hash, payload).map(|(offset, _)| offset)
    }

    pub fn find_data(&self, payload: &[u8]) -> Result<Option<NonZeroU64>> {
        self.find_data_offset(self.hash(payload), payload)
    }

    pub fn find_field(&self, name: &[u8]) -> Result<Option<NonZeroU64>> {
        self.find_field_offset(self.hash(name), name)
    }

    /// Runs a directed partition point query over the entries referencing a
    /// DATA object and returns the matching entry offset.
    pub fn data_object_directed_partition_point<F>(
        &self,
        data_offset: NonZeroU64,
        predicate: F,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>>
    where
        F: Fn(NonZeroU64) -> Result<bool>,
    {
        let Some(cursor) = self.data_ref(data_offset)?.inlined_cursor() else {
            return Ok(None);
        };

        match cursor.directed_partition_point(self, predicate, direction)? {
            Some(best_match) => best_match.value(self).map(Some),
            None => Ok(None),
        }
    }

    /// Iterates every FIELD object in the field hash table.
    pub fn fields(&self) -> FieldIterator<'_, M> {
        let mut iterator = FieldIterator {
            journal: self,
            field_hash_table: self.field_hash_table_ref(),
            current_bucket_index: 0,
            next_field_offset: None,
        };
        iterator.advance_to_next_nonempty_bucket();
        iterator
    }

    /// Iterates the DATA objects of the field named `field_name`.
    pub fn field_data_objects(&self, field_name: &[u8]) -> Result<FieldDataIterator<'_, M>> {
        let head_data_offset = match self.find_field(field_name)? {
            Some(field_offset) => self.field_ref(field_offset)?.header.head_data_offset,
            None => None,
        };

        Ok(FieldDataIterator {
            journal: self,
            current_data_offset: head_data_offset,
            remaining: self.journal_header_ref().n_objects,
        })
    }

    pub fn bucket_utilization(&self) -> Option<BucketUtilization> {
        let data_hash_table = self.data_hash_table_ref()?;
        let field_hash_table = self.field_hash_table_ref()?;

        Some(BucketUtilization {
            data_occupied: data_hash_table.occupied(),
            data_total: data_hash_table.len(),
            field_occupied: field_hash_table.occupied(),
            field_total: field_hash_table.len(),
        })
    }

    /// Wall clock range covered by the file's entries.
    pub fn cutoff_realtime(&self) -> Option<(u64, u64)> {
        let header = self.journal_header_ref();
        if header.n_entries == 0 || header.head_entry_realtime == 0 {
            return None;
        }
        Some((header.head_entry_realtime, header.tail_entry_realtime))
    }

    /// Monotonic range covered by the file's entries of boot `boot_id`.
    pub fn cutoff_monotonic(&self, boot_id: uuid::Uuid) -> Result<Option<(u64, u64)>> {
        let payload = format!("_BOOT_ID={}", id128::to_hex(&boot_id));
        let Some(data_offset) = self.find_data(payload.as_bytes())? else {
            return Ok(None);
        };

        let Some(cursor) = self.data_ref(data_offset)?.inlined_cursor() else {
            return Ok(None);
        };

        let first = cursor.head().value(self)?;
        let last = cursor.tail(self)?.value(self)?;

        let from = self.entry_ref(first)?.header.monotonic;
        let to = self.entry_ref(last)?.header.monotonic;
        Ok(Some((from, to)))
    }

    /// Duration covered by the file's entries.
    pub fn duration(&self) -> Option<Duration> {
        let (head, tail) = self.cutoff_realtime()?;
        (tail > head).then(|| Duration::from_micros(tail - head))
    }

    /// Whether a writer should stop appending to this file and start a new
    /// one. `max_file_usec` of zero disables the age check.
    pub fn rotate_suggested(&self, max_file_usec: u64, now_usec: u64) -> bool {
        let header = self.journal_header_ref();
        let path = self.file.path();

        if header.header_size < HEADER_SIZE {
            tracing::debug!("{path} uses an old header layout, suggesting rotation");
            return true;
        }

        if let Some(size) = header.data_hash_table_size {
            let buckets = size.get() / size_of::<HashItem>() as u64;
            if header.n_data * 4 > buckets * 3 {
                tracing::debug!(
                    "data hash table of {path} is {}% full, suggesting rotation",
                    100 * header.n_data / buckets.max(1)
                );
                return true;
            }
        }

        if let Some(size) = header.field_hash_table_size {
            let buckets = size.get() / size_of::<HashItem>() as u64;
            if header.n_fields * 4 > buckets * 3 {
                tracing::debug!("field hash table of {path} is full, suggesting rotation");
                return true;
            }
        }

        if header.data_hash_chain_depth > HASH_CHAIN_DEPTH_MAX
            || header.field_hash_chain_depth > HASH_CHAIN_DEPTH_MAX
        {
            tracing::debug!("hash chains of {path} are too deep, suggesting rotation");
            return true;
        }

        if header.n_data > 0 && header.n_fields == 0 {
            tracing::debug!("{path} has data objects but no fields, suggesting rotation");
            return true;
        }

        if max_file_usec > 0 && header.head_entry_realtime != 0 {
            let age = now_usec.saturating_sub(header.head_entry_realtime);
            if age > max_file_usec {
                tracing::debug!("{path} is older than the configured file retention duration");
                return true;
            }
        }

        false
    }

    /// Writes a human readable summary of the header to `w`.
    pub fn print_header(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        let header = self.journal_header_ref();
        let state = header
            .state()
            .map_or_else(|_| String::from("UNKNOWN"), |s| s.to_string());

        writeln!(w, "File path: {}", self.file.path())?;
        writeln!(w, "File ID: {}", id128::to_hex(&header.file_id()))?;
        writeln!(w, "Machine ID: {}", id128::to_hex(&header.machine_id()))?;
        writeln!(w, "Boot ID: {}", id128::to_hex(&header.tail_entry_boot_id()))?;
        writeln!(w, "Sequential number ID: {}", id128::to_hex(&header.seqnum_id()))?;
        writeln!(w, "State: {state}")?;
        writeln!(
            w,
            "Compatible flags:{}{}",
            if header.has_compatible_flag(CompatibleFlag::Sealed) { " SEALED" } else { "" },
            if header.has_compatible_flag(CompatibleFlag::TailEntryBootId) { " TAIL_ENTRY_BOOT_ID" } else { "" },
        )?;
        writeln!(
            w,
            "Incompatible flags:{}{}{}{}{}",
            if header.has_incompatible_flag(IncompatibleFlag::CompressedXz) { " COMPRESSED-XZ" } else { "" },
            if header.has_incompatible_flag(IncompatibleFlag::CompressedLz4) { " COMPRESSED-LZ4" } else { "" },
            if header.has_incompatible_flag(IncompatibleFlag::CompressedZstd) { " COMPRESSED-ZSTD" } else { "" },
            if header.has_incompatible_flag(IncompatibleFlag::KeyedHash) { " KEYED-HASH" } else { "" },
            if header.is_compact() { " COMPACT" } else { "" },
        )?;
        writeln!(w, "Header size: {}", header.header_size)?;
        writeln!(w, "Arena size: {}", header.arena_size)?;
        if let Some(size) = header.data_hash_table_size {
            writeln!(w, "Data hash table size: {}", size.get() / size_of::<HashItem>() as u64)?;
        }
        if let Some(size) = header.field_hash_table_size {
            writeln!(w, "Field hash table size: {}", size.get() / size_of::<HashItem>() as u64)?;
        }
        writeln!(w, "Objects: {}", header.n_objects)?;
        writeln!(w, "Entry objects: {}", header.n_entries)?;
        writeln!(w, "Head sequential number: {}", header.head_entry_seqnum)?;
        writeln!(w, "Tail sequential number: {}", header.tail_entry_seqnum)?;
        writeln!(w, "Head realtime timestamp: {}", header.head_entry_realtime)?;
        writeln!(w, "Tail realtime timestamp: {}", header.tail_entry_realtime)?;
        writeln!(w, "Tail monotonic timestamp: {}", header.tail_entry_monotonic)?;

        if header_contains!(header, n_data) {
            writeln!(w, "Data objects: {}", header.n_data)?;
        }
        if header_contains!(header, n_fields) {
            writeln!(w, "Field objects: {}", header.n_fields)?;
        }
        if header_contains!(header, n_entry_arrays) {
            writeln!(w, "Entry array objects: {}", header.n_entry_arrays)?;
        }
        if header_contains!(header, data_hash_chain_depth) {
            writeln!(w, "Deepest data hash chain: {}", header.data_hash_chain_depth)?;
        }
        if header_contains!(header, field_hash_chain_depth) {
            writeln!(w, "Deepest field hash chain: {}", header.field_hash_chain_depth)?;
        }

        if let Some(utilization) = self.bucket_utilization() {
            writeln!(
                w,
                "Data hash table fill: {:.1}%",
                100.0 * utilization.data_utilization()
            )?;
            writeln!(
                w,
                "Field hash table fill: {:.1}%",
                100.0 * utilization.field_utilization()
            )?;
        }

        Ok(())
    }
}

impl<M: MemoryMapMut> JournalFile<M> {
    /// Creates a fresh file with both hash tables allocated and the state
    /// set to online.
    pub fn create(
        file: &repository::File,
        options: JournalFileOptions,
        cache: &MmapCache,
    ) -> Result<Self> {
        let fd = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(file.path())?;

        let object_header_size = size_of::<ObjectHeader>() as u64;
        let data_hash_table_size =
            (options.data_hash_table_buckets * size_of::<HashItem>()) as u64;
        let field_hash_table_size =
            (options.field_hash_table_buckets * size_of::<HashItem>()) as u64;

        let data_hash_table_offset = HEADER_SIZE + object_header_size;
        let field_hash_table_offset =
            data_hash_table_offset + data_hash_table_size + object_header_size;

        let mut header = JournalHeader {
            signature: SIGNATURE,
            header_size: HEADER_SIZE,
            file_id: *options.file_id.as_bytes(),
            machine_id: *options.machine_id.as_bytes(),
            tail_entry_boot_id: *options.boot_id.as_bytes(),
            seqnum_id: *options.seqnum_id.as_bytes(),
            compatible_flags: CompatibleFlag::TailEntryBootId as u32,
            ..Default::default()
        };

        if options.keyed_hash {
            header.incompatible_flags |= IncompatibleFlag::KeyedHash as u32;
        }
        if let Some(flag) = options.compression.header_flag() {
            header.incompatible_flags |= flag as u32;
        }

        header.data_hash_table_offset = NonZeroU64::new(data_hash_table_offset);
        header.data_hash_table_size = NonZeroU64::new(data_hash_table_size);
        header.field_hash_table_offset = NonZeroU64::new(field_hash_table_offset);
        header.field_hash_table_size = NonZeroU64::new(field_hash_table_size);

        header.tail_object_offset = NonZeroU64::new(field_hash_table_offset - object_header_size);
        header.n_objects = 2;
        header.arena_size = field_hash_table_offset + field_hash_table_size - HEADER_SIZE;
        header.state = JournalState::Online as u8;

        let mut header_map = HeaderMap::new(M::create(&fd, 0, HEADER_SIZE)?)?;

        let mut data_hash_table_map = map_hash_table::<M>(
            &fd,
            header.data_hash_table_offset,
            header.data_hash_table_size,
        )?;
        let mut field_hash_table_map = map_hash_table::<M>(
            &fd,
            header.field_hash_table_offset,
            header.field_hash_table_size,
        )?;

        for (map, object_type) in [
            (data_hash_table_map.as_mut(), ObjectType::DataHashTable),
            (field_hash_table_map.as_mut(), ObjectType::FieldHashTable),
        ] {
            let Some(map) = map else {
                return Err(JournalError::MissingHashTable);
            };
            let size = map.len() as u64;
            let (object_header, _) = ObjectHeader::mut_from_prefix(&mut map[..])
                .map_err(|_| JournalError::InvalidObjectSize)?;
            object_header.type_ = object_type as u8;
            object_header.size = size;
        }

        *header_map.header_mut() = header;

        let hash_algorithm = HashAlgorithm::for_header(&header);
        let window_manager = GuardedCell::new(WindowManager::new(fd, cache.clone())?);

        let mut journal_file = JournalFile {
            file: file.clone(),
            header_map,
            data_hash_table_map,
            field_hash_table_map,
            window_manager,
            hash_algorithm,
            chain_cache: new_chain_cache(),
        };

        journal_file.sync()?;

        tracing::debug!(
            "created journal file {} (seqnum id {})",
            file.path(),
            id128::to_hex(&options.seqnum_id)
        );

        Ok(journal_file)
    }

    /// Opens an existing file for appending. The file must be offline, use
    /// the current header layout and belong to `machine_id`.
    pub fn open_for_append(
        file: &repository::File,
        machine_id: Option<uuid::Uuid>,
        cache: &MmapCache,
    ) -> Result<Self> {
        let mut journal_file = Self::open(file, cache)?;
        journal_file
            .journal_header_ref()
            .validate_for_writing(machine_id)?;

        if journal_file.data_hash_table_map.is_none() || journal_file.field_hash_table_map.is_none()
        {
            return Err(JournalError::MissingHashTable);
        }

        journal_file.set_online()?;
        Ok(journal_file)
    }

    /// Flushes mapped data and syncs it to disk.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(map) = &self.data_hash_table_map {
            map.flush()?;
        }
        if let Some(map) = &self.field_hash_table_map {
            map.flush()?;
        }
        self.window_manager.get_mut().sync()?;
        self.header_map.flush()?;
        Ok(())
    }

    fn set_state(&mut self, state: JournalState) -> Result<()> {
        if self.journal_header_ref().state == state as u8 {
            return Ok(());
        }

        // Everything written so far reaches the disk before the state flips
        self.sync()?;
        self.journal_header_mut().state = state as u8;
        self.header_map.flush()?;
        self.window_manager.get_mut().file().sync_data()?;
        Ok(())
    }

    pub fn set_online(&mut self) -> Result<()> {
        self.set_state(JournalState::Online)
    }

    pub fn set_offline(&mut self) -> Result<()> {
        match self.state()? {
            JournalState::Archived => self.sync(),
            _ => self.set_state(JournalState::Offline),
        }
    }

    /// Renames the file to its archived name and marks it archived. The
    /// handle stays usable for reading.
    pub fn archive(&mut self) -> Result<repository::File> {
        let header = self.journal_header_ref();
        let status = repository::Status::Archived {
            seqnum_id: header.seqnum_id(),
            head_seqnum: header.head_entry_seqnum,
            head_realtime: header.head_entry_realtime,
        };

        let archived = self.file.with_status(status).map_err(std::io::Error::other)?;
        std::fs::rename(self.file.path(), archived.path())?;
        tracing::debug!("archived {} as {}", self.file.path(), archived.path());

        self.file = archived.clone();
        self.set_state(JournalState::Archived)?;
        Ok(archived)
    }

    /// Closes this file as archived and creates its successor at the active
    /// path, continuing the same sequence number lineage.
    pub fn rotate(mut self, boot_id: uuid::Uuid, cache: &MmapCache) -> Result<Self> {
        let active = self.file.active().map_err(std::io::Error::other)?;
        self.archive()?;

        let header = self.journal_header_ref();
        let compression = [
            Compression::Zstd,
            Compression::Lz4,
            Compression::Xz,
        ]
        .into_iter()
        .find(|c| c.header_flag().is_some_and(|f| header.has_incompatible_flag(f)))
        .unwrap_or(Compression::None);

        let bucket_count = |size: Option<NonZeroU64>, default: usize| {
            size.map_or(default, |s| (s.get() / size_of::<HashItem>() as u64) as usize)
        };

        let options = JournalFileOptions::new(header.machine_id(), boot_id)
            .with_template(&self)
            .with_data_hash_table_buckets(bucket_count(
                header.data_hash_table_size,
                DEFAULT_DATA_HASH_TABLE_BUCKETS,
            ))
            .with_field_hash_table_buckets(bucket_count(
                header.field_hash_table_size,
                DEFAULT_FIELD_HASH_TABLE_BUCKETS,
            ))
            .with_keyed_hash(header.has_incompatible_flag(IncompatibleFlag::KeyedHash))
            .with_compression(compression);

        drop(self);
        Self::create(&active, options, cache)
    }

    /// Sets a damaged or foreign file aside under a `.journal~` name so a
    /// fresh one can take its place.
    pub fn dispose(file: &repository::File) -> Result<repository::File> {
        let status = repository::Status::Disposed {
            timestamp: journal_common::Microseconds::now().get(),
            number: rand::random(),
        };
        let disposed = file.with_status(status).map_err(std::io::Error::other)?;
        std::fs::rename(file.path(), disposed.path())?;
        tracing::warn!("set aside {} as {}", file.path(), disposed.path());
        Ok(disposed)
    }

    /// Touches the file so that readers watching it notice new entries.
    pub fn post_change(&self) -> Result<()> {
        self.window_manager.with(|wm| {
            let file = wm.file();
            let len = file.metadata()?.len();
            file.set_len(len)
        })??;
        Ok(())
    }

    pub fn journal_header_mut(&mut self) -> &mut JournalHeader {
        self.header_map.header_mut()
    }

    pub fn data_hash_table_mut(&mut self) -> Option<DataHashTable<&mut [u8]>> {
        self.data_hash_table_map
            .as_mut()
            .and_then(|m| DataHashTable::<&mut [u8]>::from_data(&mut m[..], false))
    }

    pub fn field_hash_table_mut(&mut self) -> Option<FieldHashTable<&mut [u8]>> {
        self.field_hash_table_map
            .as_mut()
            .and_then(|m| FieldHashTable::<&mut [u8]>::from_data(&mut m[..], false))
    }

    /// Maps an object for writing. With `size` set, a new object of that
    /// size is initialized at `offset`; otherwise the existing object must
    /// have type `object_type`.
    fn journal_object_mut<'a, T>(
        &'a self,
        object_type: ObjectType,
        offset: NonZeroU64,
        size: Option<u64>,
    ) -> Result<ValueGuard<'a, T>>
    where
        T: JournalObject<&'a mut [u8]>,
    {
        if offset.get() % OBJECT_ALIGNMENT != 0 {
            return Err(JournalError::InvalidObjectLocation);
        }
        let is_compact = self.is_compact();

        self.window_manager.with_guarded(offset, |wm| {
            let size = match size {
                Some(size) => {
                    let data = wm.get_slice_mut(offset.get(), size)?;
                    data.fill(0);

                    let (object_header, _) = ObjectHeader::mut_from_prefix(data)
                        .map_err(|_| JournalError::InvalidObjectSize)?;
                    object_header.type_ = object_type as u8;
                    object_header.size = size;
                    size
                }
                None => {
                    let size = self.object_size(wm, offset, Some(object_type))?;
                    self.check_object_location(offset, size)?;
                    size
                }
            };

            let data = wm.get_slice_mut(offset.get(), size)?;
            T::from_data(data, is_compact).ok_or(JournalError::InvalidZeroCopySize)
        })
    }

    /// Size of an entry array object holding `capacity` offsets.
    pub(crate) fn offset_array_size(&self, capacity: NonZeroU64) -> u64 {
        let item_size = if self.is_compact() {
            size_of::<u32>()
        } else {
            size_of::<u64>()
        } as u64;
        size_of::<OffsetArrayObjectHeader>() as u64 + capacity.get() * item_size
    }

    pub fn offset_array_mut(
        &self,
        offset: NonZeroU64,
        capacity: Option<NonZeroU64>,
    ) -> Result<ValueGuard<'_, OffsetArrayObject<&mut [u8]>>> {
        let size = capacity.map(|c| self.offset_array_size(c));
        self.journal_object_mut(ObjectType::EntryArray, offset, size)
    }

    pub fn field_mut(
        &self,
        offset: NonZeroU64,
        payload_size: Option<u64>,
    ) -> Result<ValueGuard<'_, FieldObject<&mut [u8]>>> {
        let size = payload_size.map(|n| size_of::<FieldObjectHeader>() as u64 + n);
        self.journal_object_mut(ObjectType::Field, offset, size)
    }

    pub fn entry_mut(
        &self,
        offset: NonZeroU64,
        n_items: Option<u64>,
    ) -> Result<ValueGuard<'_, EntryObject<&mut [u8]>>> {
        let size = n_items
            .map(|n| size_of::<EntryObjectHeader>() as u64 + n * size_of::<RegularEntryItem>() as u64);
        self.journal_object_mut(ObjectType::Entry, offset, size)
    }

    pub fn data_mut(
        &self,
        offset: NonZeroU64,
        payload_size: Option<u64>,
    ) -> Result<ValueGuard<'_, DataObject<&mut [u8]>>> {
        let size = payload_size.map(|n| size_of::<DataObjectHeader>() as u64 + n);
        self.journal_object_mut(ObjectType::Data, offset, size)
    }
}

macro_rules! impl_hash_table_link_head {
    (
        $method_name:ident,
        $hash_table_ref:ident,
        $hash_table_mut:ident,
        $object_mut:ident
    ) => {
        /// Links a new object at the head of its bucket's collision chain.
        pub fn $method_name(&mut self, hash: u64, object_offset: NonZeroU64) -> Result<()> {
            let previous_head = {
                let Some(ht) = self.$hash_table_ref() else {
                    return Err(JournalError::MissingHashTable);
                };
                ht.hash_item_ref(hash).head_hash_offset
            };

            if let Some(previous_head) = previous_head {
                let mut object = self.$object_mut(object_offset, None)?;
                object.set_next_hash_offset(previous_head);
            }

            let Some(mut ht) = self.$hash_table_mut() else {
                return Err(JournalError::MissingHashTable);
            };

            let hash_item = ht.hash_item_mut(hash);
            if hash_item.tail_hash_offset.is_none() {
                hash_item.tail_hash_offset = Some(object_offset);
            }
            hash_item.head_hash_offset = Some(object_offset);

            Ok(())
        }
    };
}

impl<M: MemoryMapMut> JournalFile<M> {
    impl_hash_table_link_head!(
        data_hash_table_link,
        data_hash_table_ref,
        data_hash_table_mut,
        data_mut
    );

    impl_hash_table_link_head!(
        field_hash_table_link,
        field_hash_table_ref,
        field_hash_table_mut,
        field_mut
    );
}

/// Iterator that walks through all field objects in the field hash table
pub struct FieldIterator<'a, M: MemoryMap> {
    journal: &'a JournalFile<M>,
    field_hash_table: Option<FieldHashTable<&'a [u8]>>,
    current_bucket_index: usize,
    next_field_offset: Option<NonZeroU64>,
}

impl<M: MemoryMap> FieldIterator<'_, M> {
    fn advance_to_next_nonempty_bucket(&mut self) {
        self.next_field_offset = None;

        let Some(hash_table) = &self.field_hash_table else {
            return;
        };

        while let Some(bucket) = hash_table.items().get(self.current_bucket_index) {
            if bucket.head_hash_offset.is_some() {
                self.next_field_offset = bucket.head_hash_offset;
                return;
            }
            self.current_bucket_index += 1;
        }
    }
}

impl<M: MemoryMap> Iterator for FieldIterator<'_, M> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next_field_offset?;

        match self.journal.field_ref(offset) {
            Ok(field_guard) => {
                self.next_field_offset = field_guard.header.next_hash_offset;
                let name = field_guard.payload.to_vec();
                drop(field_guard);

                if self.next_field_offset.is_none() {
                    self.current_bucket_index += 1;
                    self.advance_to_next_nonempty_bucket();
                }

                Some(Ok(name))
            }
            Err(e) => {
                self.next_field_offset = None;
                self.field_hash_table = None;
                Some(Err(e))
            }
        }
    }
}

/// Iterator over the DATA objects of one field, yielding decompressed
/// payloads.
pub struct FieldDataIterator<'a, M: MemoryMap> {
    journal: &'a JournalFile<M>,
    current_data_offset: Option<NonZeroU64>,
    // Bounds the walk on files with a cyclic chain
    remaining: u64,
}

impl<M: MemoryMap> Iterator for FieldDataIterator<'_, M> {
    type Item = Result<(NonZeroU64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let data_offset = self.current_data_offset?;

        if self.remaining == 0 {
            self.current_data_offset = None;
            return Some(Err(JournalError::HashChainCycle));
        }
        self.remaining -= 1;

        let result = self.journal.data_ref(data_offset).and_then(|data_guard| {
            self.current_data_offset = data_guard.header.next_field_offset;
            let mut payload = Vec::new();
            data_guard.payload_into(&mut payload)?;
            Ok((data_offset, payload))
        });

        if result.is_err() {
            self.current_data_offset = None;
        }
        Some(result)
    }
}
