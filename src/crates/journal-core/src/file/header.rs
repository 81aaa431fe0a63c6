use crate::error::{JournalError, Result};
use journal_common::time::{valid_monotonic, valid_realtime};
use std::mem::{offset_of, size_of};
use std::num::NonZeroU64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const SIGNATURE: [u8; 8] = *b"LPKSHHRH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IncompatibleFlag {
    CompressedXz = 1 << 0,
    CompressedLz4 = 1 << 1,
    KeyedHash = 1 << 2,
    CompressedZstd = 1 << 3,
    Compact = 1 << 4,
}

impl IncompatibleFlag {
    /// Every incompatible bit this implementation knows how to read.
    pub const SUPPORTED: u32 = 0x1f;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CompatibleFlag {
    Sealed = 1 << 0,
    TailEntryBootId = 1 << 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    Offline = 0,
    Online = 1,
    Archived = 2,
}

impl TryFrom<u8> for JournalState {
    type Error = JournalError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(JournalState::Offline),
            1 => Ok(JournalState::Online),
            2 => Ok(JournalState::Archived),
            _ => Err(JournalError::InvalidJournalFileState),
        }
    }
}

impl std::fmt::Display for JournalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalState::Offline => write!(f, "OFFLINE"),
            JournalState::Online => write!(f, "ONLINE"),
            JournalState::Archived => write!(f, "ARCHIVED"),
        }
    }
}

/// The file header. Older files may carry a shorter header; `header_size`
/// says which of the trailing fields are present.
#[derive(Default, Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct JournalHeader {
    pub signature: [u8; 8],
    pub compatible_flags: u32,
    pub incompatible_flags: u32,
    pub state: u8,
    pub reserved: [u8; 7],
    pub file_id: [u8; 16],
    pub machine_id: [u8; 16],
    pub tail_entry_boot_id: [u8; 16],
    pub seqnum_id: [u8; 16],
    pub header_size: u64,
    pub arena_size: u64,
    pub data_hash_table_offset: Option<NonZeroU64>,
    pub data_hash_table_size: Option<NonZeroU64>,
    pub field_hash_table_offset: Option<NonZeroU64>,
    pub field_hash_table_size: Option<NonZeroU64>,
    pub tail_object_offset: Option<NonZeroU64>,
    pub n_objects: u64,
    pub n_entries: u64,
    pub tail_entry_seqnum: u64,
    pub head_entry_seqnum: u64,
    pub entry_array_offset: Option<NonZeroU64>,
    pub head_entry_realtime: u64,
    pub tail_entry_realtime: u64,
    pub tail_entry_monotonic: u64,
    pub n_data: u64,
    pub n_fields: u64,
    pub n_tags: u64,
    pub n_entry_arrays: u64,
    pub data_hash_chain_depth: u64,
    pub field_hash_chain_depth: u64,
    pub tail_entry_array_offset: u32,
    pub tail_entry_array_n_entries: u32,
    pub tail_entry_offset: u64,
}

static_assertions::const_assert_eq!(size_of::<JournalHeader>(), 272);

/// Size of the oldest header layout we still read.
pub const HEADER_SIZE_MIN: u64 = offset_of!(JournalHeader, n_data) as u64;

/// Size of the header layout this implementation writes.
pub const HEADER_SIZE: u64 = size_of::<JournalHeader>() as u64;

/// True when the header of `$header` is large enough to contain `$field`.
macro_rules! header_contains {
    ($header:expr, $field:ident) => {{
        let header = &$header;
        header.contains_field(
            ::std::mem::offset_of!($crate::file::header::JournalHeader, $field),
            ::std::mem::size_of_val(&header.$field),
        )
    }};
}
pub(crate) use header_contains;

impl JournalHeader {
    pub fn contains_field(&self, offset: usize, size: usize) -> bool {
        self.header_size >= (offset + size) as u64
    }

    pub fn has_incompatible_flag(&self, flag: IncompatibleFlag) -> bool {
        (self.incompatible_flags & flag as u32) != 0
    }

    pub fn has_compatible_flag(&self, flag: CompatibleFlag) -> bool {
        (self.compatible_flags & flag as u32) != 0
    }

    pub fn is_compact(&self) -> bool {
        self.has_incompatible_flag(IncompatibleFlag::Compact)
    }

    pub fn state(&self) -> Result<JournalState> {
        JournalState::try_from(self.state)
    }

    pub fn file_id(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.file_id)
    }

    pub fn machine_id(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.machine_id)
    }

    pub fn seqnum_id(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.seqnum_id)
    }

    pub fn tail_entry_boot_id(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.tail_entry_boot_id)
    }

    /// End of the arena, i.e. the logical size of the file.
    pub fn arena_end(&self) -> u64 {
        self.header_size.saturating_add(self.arena_size)
    }

    fn check_region(&self, offset: Option<NonZeroU64>, size: Option<NonZeroU64>) -> Result<()> {
        match (offset, size) {
            (None, None) => Ok(()),
            (Some(offset), Some(size)) => {
                let offset = offset.get();
                if offset % 8 != 0 || offset < self.header_size + 16 {
                    return Err(JournalError::InvalidObjectLocation);
                }
                match offset.checked_add(size.get()) {
                    Some(end) if end <= self.arena_end() => Ok(()),
                    _ => Err(JournalError::ObjectExceedsFile),
                }
            }
            _ => Err(JournalError::MissingHashTable),
        }
    }

    /// Structural checks performed on every open, before any object is read.
    pub fn validate(&self, file_size: u64) -> Result<()> {
        if self.signature != SIGNATURE {
            return Err(JournalError::InvalidMagicNumber);
        }

        let unknown = self.incompatible_flags & !IncompatibleFlag::SUPPORTED;
        if unknown != 0 {
            return Err(JournalError::UnsupportedFeature(unknown));
        }

        self.state()?;

        if self.header_size < HEADER_SIZE_MIN || self.header_size % 8 != 0 {
            return Err(JournalError::InvalidHeader);
        }
        if self.arena_end() > file_size {
            return Err(JournalError::ObjectExceedsFile);
        }

        self.check_region(self.data_hash_table_offset, self.data_hash_table_size)?;
        self.check_region(self.field_hash_table_offset, self.field_hash_table_size)?;

        for offset in [self.tail_object_offset, self.entry_array_offset]
            .into_iter()
            .flatten()
        {
            let offset = offset.get();
            if offset % 8 != 0 || offset < self.header_size || offset >= self.arena_end() {
                return Err(JournalError::InvalidObjectLocation);
            }
        }

        if self.n_entries > 0 {
            if self.entry_array_offset.is_none() {
                return Err(JournalError::EmptyOffsetArrayList);
            }
            if !valid_realtime(self.head_entry_realtime)
                || !valid_realtime(self.tail_entry_realtime)
                || !valid_monotonic(self.tail_entry_monotonic)
            {
                return Err(JournalError::InvalidTimestamp);
            }
            if self.head_entry_seqnum > self.tail_entry_seqnum {
                return Err(JournalError::InvalidHeader);
            }
        }

        Ok(())
    }

    /// Extra checks for a file we are about to append to.
    pub fn validate_for_writing(&self, machine_id: Option<uuid::Uuid>) -> Result<()> {
        match self.state()? {
            JournalState::Offline => {}
            JournalState::Online => return Err(JournalError::UncleanShutdown),
            JournalState::Archived => return Err(JournalError::FileArchived),
        }

        if self.header_size != HEADER_SIZE {
            return Err(JournalError::LegacyHeader);
        }

        if self.is_compact() {
            return Err(JournalError::UnsupportedFeature(IncompatibleFlag::Compact as u32));
        }
        if self.has_compatible_flag(CompatibleFlag::Sealed) {
            return Err(JournalError::UnsupportedFeature(0));
        }

        if let Some(machine_id) = machine_id {
            if self.machine_id != *machine_id.as_bytes() {
                return Err(JournalError::ForeignLineage);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_header() -> JournalHeader {
        JournalHeader {
            signature: SIGNATURE,
            header_size: HEADER_SIZE,
            arena_size: 64,
            ..Default::default()
        }
    }

    #[test]
    fn optional_fields_follow_header_size() {
        let mut header = fresh_header();
        assert!(header_contains!(header, tail_entry_offset));

        header.header_size = HEADER_SIZE_MIN;
        assert!(header_contains!(header, tail_entry_monotonic));
        assert!(!header_contains!(header, n_data));
        assert!(!header_contains!(header, tail_entry_offset));
    }

    #[test]
    fn rejects_bad_signature_and_unknown_flags() {
        let mut header = fresh_header();
        header.signature = *b"XXXXXXXX";
        assert!(matches!(
            header.validate(4096),
            Err(JournalError::InvalidMagicNumber)
        ));

        let mut header = fresh_header();
        header.incompatible_flags = 1 << 7;
        assert!(matches!(
            header.validate(4096),
            Err(JournalError::UnsupportedFeature(0x80))
        ));
    }

    #[test]
    fn rejects_arena_past_end_of_file() {
        let header = fresh_header();
        assert!(header.validate(HEADER_SIZE + 64).is_ok());
        assert!(matches!(
            header.validate(HEADER_SIZE),
            Err(JournalError::ObjectExceedsFile)
        ));
    }

    #[test]
    fn writing_requires_an_offline_current_layout() {
        let mut header = fresh_header();
        assert!(header.validate_for_writing(None).is_ok());

        header.state = JournalState::Online as u8;
        assert!(matches!(
            header.validate_for_writing(None),
            Err(JournalError::UncleanShutdown)
        ));

        header.state = JournalState::Offline as u8;
        header.header_size = HEADER_SIZE_MIN;
        assert!(matches!(
            header.validate_for_writing(None),
            Err(JournalError::LegacyHeader)
        ));

        let mut header = fresh_header();
        header.incompatible_flags |= IncompatibleFlag::Compact as u32;
        assert!(matches!(
            header.validate_for_writing(None),
            Err(JournalError::UnsupportedFeature(f)) if f == IncompatibleFlag::Compact as u32
        ));

        let header = fresh_header();
        let other = uuid::Uuid::from_bytes([7; 16]);
        assert!(matches!(
            header.validate_for_writing(Some(other)),
            Err(JournalError::ForeignLineage)
        ));
    }
}
