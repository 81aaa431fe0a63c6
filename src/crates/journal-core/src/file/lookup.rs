//! Entry lookups.
//!
//! Every lookup is a partition point query over an entry array chain: the
//! global chain for whole-file lookups, or the per-DATA chain of one field
//! value for the `_for_data` variants.
//!
//! `Direction::Forward` yields the first entry whose key is at least the
//! target, `Direction::Backward` the last entry whose key is at most the
//! target. Entries sharing a key are ordered by offset, so a forward lookup
//! returns the earliest of them and a backward lookup the latest.

use crate::error::Result;
use crate::file::file::JournalFile;
use crate::file::mmap::MemoryMap;
use crate::file::object::EntryObjectHeader;
use crate::file::offset_array::Direction;
use journal_common::id128;
use std::num::NonZeroU64;

/// Predicate over a key for a lookup of `target` in `direction`.
fn key_predicate(target: u64, direction: Direction) -> impl Fn(u64) -> bool {
    move |key| match direction {
        Direction::Forward => key < target,
        Direction::Backward => key <= target,
    }
}

/// Predicate over an entry offset for stepping from `from` in `direction`.
fn step_predicate(from: NonZeroU64, direction: Direction) -> impl Fn(NonZeroU64) -> Result<bool> {
    move |offset| {
        Ok(match direction {
            Direction::Forward => offset <= from,
            Direction::Backward => offset < from,
        })
    }
}

impl<M: MemoryMap> JournalFile<M> {
    fn entry_key(&self, offset: NonZeroU64, key: fn(&EntryObjectHeader) -> u64) -> Result<u64> {
        let entry = self.entry_ref(offset)?;
        Ok(key(&*entry.header))
    }

    fn entry_list_partition_point<F>(
        &self,
        predicate: F,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>>
    where
        F: Fn(NonZeroU64) -> Result<bool>,
    {
        let Some(list) = self.entry_list() else {
            return Ok(None);
        };

        match list.directed_partition_point(self, predicate, direction)? {
            Some(cursor) => cursor.value(self).map(Some),
            None => Ok(None),
        }
    }

    /// Lookup over the global chain by an entry header field.
    fn move_to_entry_by_key(
        &self,
        target: u64,
        key: fn(&EntryObjectHeader) -> u64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        let holds = key_predicate(target, direction);
        self.entry_list_partition_point(
            |offset| Ok(holds(self.entry_key(offset, key)?)),
            direction,
        )
    }

    /// Lookup over the entries of one DATA object by an entry header field.
    fn move_to_entry_by_key_for_data(
        &self,
        data_offset: NonZeroU64,
        target: u64,
        key: fn(&EntryObjectHeader) -> u64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        let holds = key_predicate(target, direction);
        self.data_object_directed_partition_point(
            data_offset,
            |offset| Ok(holds(self.entry_key(offset, key)?)),
            direction,
        )
    }

    /// The entry after (or before) `from`, or the first (or last) entry when
    /// `from` is `None`.
    pub fn next_entry(
        &self,
        from: Option<NonZeroU64>,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        let Some(from) = from else {
            let Some(list) = self.entry_list() else {
                return Ok(None);
            };
            return match direction {
                Direction::Forward => list.cursor_head().value(self).map(Some),
                Direction::Backward => list.cursor_tail(self)?.value(self).map(Some),
            };
        };

        self.entry_list_partition_point(step_predicate(from, direction), direction)
    }

    /// Like [`next_entry`](Self::next_entry), restricted to the entries that
    /// reference the DATA object at `data_offset`.
    pub fn next_entry_for_data(
        &self,
        data_offset: NonZeroU64,
        from: Option<NonZeroU64>,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        let Some(from) = from else {
            let Some(cursor) = self.data_ref(data_offset)?.inlined_cursor() else {
                return Ok(None);
            };
            return match direction {
                Direction::Forward => cursor.head().value(self).map(Some),
                Direction::Backward => cursor.tail(self)?.value(self).map(Some),
            };
        };

        self.data_object_directed_partition_point(
            data_offset,
            step_predicate(from, direction),
            direction,
        )
    }

    pub fn move_to_entry_by_offset(
        &self,
        offset: NonZeroU64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        let holds = key_predicate(offset.get(), direction);
        self.entry_list_partition_point(|o| Ok(holds(o.get())), direction)
    }

    pub fn move_to_entry_by_seqnum(
        &self,
        seqnum: u64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        self.move_to_entry_by_key(seqnum, |h| h.seqnum, direction)
    }

    pub fn move_to_entry_by_realtime(
        &self,
        realtime: u64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        self.move_to_entry_by_key(realtime, |h| h.realtime, direction)
    }

    /// Offset of the `_BOOT_ID=` DATA object for `boot_id`.
    pub fn boot_id_data_offset(&self, boot_id: uuid::Uuid) -> Result<Option<NonZeroU64>> {
        let payload = format!("_BOOT_ID={}", id128::to_hex(&boot_id));
        self.find_data(payload.as_bytes())
    }

    /// Monotonic timestamps only compare within one boot, so the search
    /// runs over the entries of that boot.
    pub fn move_to_entry_by_monotonic(
        &self,
        boot_id: uuid::Uuid,
        monotonic: u64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        let Some(boot_offset) = self.boot_id_data_offset(boot_id)? else {
            return Ok(None);
        };
        self.move_to_entry_by_key_for_data(boot_offset, monotonic, |h| h.monotonic, direction)
    }

    pub fn move_to_entry_by_offset_for_data(
        &self,
        data_offset: NonZeroU64,
        offset: NonZeroU64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        let holds = key_predicate(offset.get(), direction);
        self.data_object_directed_partition_point(data_offset, |o| Ok(holds(o.get())), direction)
    }

    pub fn move_to_entry_by_seqnum_for_data(
        &self,
        data_offset: NonZeroU64,
        seqnum: u64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        self.move_to_entry_by_key_for_data(data_offset, seqnum, |h| h.seqnum, direction)
    }

    pub fn move_to_entry_by_realtime_for_data(
        &self,
        data_offset: NonZeroU64,
        realtime: u64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        self.move_to_entry_by_key_for_data(data_offset, realtime, |h| h.realtime, direction)
    }

    /// Entries of the DATA object at `data_offset` that also belong to boot
    /// `boot_id`, searched by monotonic time.
    ///
    /// Alternates between the boot's chain and the data object's chain until
    /// both agree on an entry.
    pub fn move_to_entry_by_monotonic_for_data(
        &self,
        data_offset: NonZeroU64,
        boot_id: uuid::Uuid,
        monotonic: u64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        let Some(boot_offset) = self.boot_id_data_offset(boot_id)? else {
            return Ok(None);
        };

        let mut candidate =
            self.move_to_entry_by_key_for_data(boot_offset, monotonic, |h| h.monotonic, direction)?;

        while let Some(boot_entry) = candidate {
            let Some(data_entry) =
                self.move_to_entry_by_offset_for_data(data_offset, boot_entry, direction)?
            else {
                return Ok(None);
            };

            if data_entry == boot_entry {
                return Ok(Some(data_entry));
            }

            candidate =
                self.move_to_entry_by_offset_for_data(boot_offset, data_entry, direction)?;
            if candidate == Some(data_entry) {
                return Ok(candidate);
            }
        }

        Ok(None)
    }
}
