use super::mmap::MemoryMap;
use crate::error::{JournalError, Result};
use crate::file::{file::JournalFile, filter::FilterExpr, offset_array::Direction};
use std::num::NonZeroU64;

/// Where the next step of a [`JournalCursor`] starts from.
///
/// Seek locations are inclusive: stepping from `Seqnum(n)` forward yields
/// the entry with sequence number `n` when it exists. Stepping from a
/// `ResolvedEntry` moves past it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Location {
    #[default]
    Head,
    Tail,
    Realtime(u64),
    Monotonic(u64, uuid::Uuid),
    Seqnum(u64),
    Offset(NonZeroU64),
    ResolvedEntry(NonZeroU64),
}

/// Position within one journal file, optionally restricted by a filter.
#[derive(Debug, Default)]
pub struct JournalCursor {
    location: Location,
    filter_expr: Option<FilterExpr>,
}

impl JournalCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn set_location(&mut self, location: Location) {
        self.location = location;
    }

    pub fn set_filter(&mut self, filter_expr: Option<FilterExpr>) {
        self.filter_expr = filter_expr;
    }

    pub fn clear_filter(&mut self) {
        self.filter_expr = None;
        self.set_location(Location::Head);
    }

    /// Moves to the next entry in `direction`. Returns `false`, leaving the
    /// location unchanged, when there is none.
    pub fn step<M: MemoryMap>(
        &mut self,
        journal_file: &JournalFile<M>,
        direction: Direction,
    ) -> Result<bool> {
        let candidate = self.resolve_unfiltered(journal_file, direction)?;

        let resolved = match (candidate, self.filter_expr.as_mut()) {
            (None, _) => None,
            (Some(offset), None) => Some(offset),
            (Some(offset), Some(filter_expr)) => filter_expr.lookup(journal_file, offset, direction)?,
        };

        match resolved {
            Some(offset) => {
                self.location = Location::ResolvedEntry(offset);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn position(&self) -> Result<NonZeroU64> {
        match self.location {
            Location::ResolvedEntry(entry_offset) => Ok(entry_offset),
            _ => Err(JournalError::UnsetCursor),
        }
    }

    /// The entry the unfiltered walk would land on. With a filter this is a
    /// lower (forward) or upper (backward) bound for the filtered result.
    fn resolve_unfiltered<M: MemoryMap>(
        &self,
        journal_file: &JournalFile<M>,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        let filtered = self.filter_expr.is_some();

        match (self.location, direction) {
            (Location::Head, Direction::Backward) | (Location::Tail, Direction::Forward) => {
                Ok(None)
            }
            (Location::Head, Direction::Forward) if filtered => Ok(Some(NonZeroU64::MIN)),
            (Location::Tail, Direction::Backward) if filtered => Ok(Some(NonZeroU64::MAX)),
            (Location::Head | Location::Tail, _) => journal_file.next_entry(None, direction),
            (Location::Realtime(realtime), _) => {
                journal_file.move_to_entry_by_realtime(realtime, direction)
            }
            (Location::Monotonic(monotonic, boot_id), _) => {
                journal_file.move_to_entry_by_monotonic(boot_id, monotonic, direction)
            }
            (Location::Seqnum(seqnum), _) => journal_file.move_to_entry_by_seqnum(seqnum, direction),
            (Location::Offset(offset), _) => journal_file.move_to_entry_by_offset(offset, direction),
            (Location::ResolvedEntry(offset), _) if filtered => Ok(match direction {
                Direction::Forward => offset.checked_add(1),
                Direction::Backward => NonZeroU64::new(offset.get() - 1),
            }),
            (Location::ResolvedEntry(offset), _) => journal_file.next_entry(Some(offset), direction),
        }
    }
}
