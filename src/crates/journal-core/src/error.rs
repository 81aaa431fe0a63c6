use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JournalError {
    // Structural corruption
    #[error("invalid magic number")]
    InvalidMagicNumber,

    #[error("invalid journal file state")]
    InvalidJournalFileState,

    #[error("invalid journal header")]
    InvalidHeader,

    #[error("invalid object type")]
    InvalidObjectType,

    #[error("invalid object location")]
    InvalidObjectLocation,

    #[error("object size exceeds the file bounds")]
    ObjectExceedsFile,

    #[error("invalid object size")]
    InvalidObjectSize,

    #[error("invalid zerocopy size")]
    InvalidZeroCopySize,

    #[error("timestamp out of the valid range")]
    InvalidTimestamp,

    #[error("hash chain is too long or cyclic")]
    HashChainCycle,

    #[error("missing hash table")]
    MissingHashTable,

    #[error("object is not reachable through its hash")]
    HashMismatch,

    #[error("invalid offset array offset")]
    InvalidOffsetArrayOffset,

    #[error("invalid offset array index")]
    InvalidOffsetArrayIndex,

    #[error("empty offset array list")]
    EmptyOffsetArrayList,

    #[error("empty offset array node")]
    EmptyOffsetArrayNode,

    #[error("invalid offset")]
    InvalidOffset,

    #[error("decompressor error")]
    DecompressorError,

    #[error("unknown compression method")]
    UnknownCompressionMethod,

    // Features this implementation can't handle
    #[error("unsupported incompatible flags {0:#x}")]
    UnsupportedFeature(u32),

    #[error("journal header uses a legacy layout")]
    LegacyHeader,

    // Capacity and quota
    #[error("journal file reached its size limit")]
    FileFull,

    #[error("not enough free disk space")]
    OutOfSpace,

    #[error("entry too large")]
    EntryTooLarge,

    // Lineage
    #[error("journal file belongs to another machine or sequence lineage")]
    ForeignLineage,

    // File state
    #[error("journal file was not closed cleanly")]
    UncleanShutdown,

    #[error("journal file is archived")]
    FileArchived,

    #[error("journal file is not writable")]
    ReadOnly,

    // API misuse
    #[error("previous object is still in use")]
    ValueGuardInUse,

    #[error("invalid field")]
    InvalidField,

    #[error("unset cursor")]
    UnsetCursor,

    #[error("malformed filter")]
    MalformedFilter,

    #[error("i/o error during object operation: {0}")]
    Io(#[from] io::Error),
}

static_assertions::const_assert!(std::mem::size_of::<JournalError>() <= 16);

impl<T: zerocopy::KnownLayout> From<zerocopy::SizeError<&[u8], T>> for JournalError {
    fn from(_: zerocopy::SizeError<&[u8], T>) -> Self {
        JournalError::InvalidZeroCopySize
    }
}

impl JournalError {
    /// Errors that mean the file content can't be trusted.
    pub fn is_corruption(&self) -> bool {
        use JournalError::*;

        matches!(
            self,
            InvalidMagicNumber
                | InvalidJournalFileState
                | InvalidHeader
                | InvalidObjectType
                | InvalidObjectLocation
                | ObjectExceedsFile
                | InvalidObjectSize
                | InvalidZeroCopySize
                | InvalidTimestamp
                | HashChainCycle
                | MissingHashTable
                | HashMismatch
                | InvalidOffsetArrayOffset
                | InvalidOffsetArrayIndex
                | EmptyOffsetArrayList
                | EmptyOffsetArrayNode
                | InvalidOffset
                | DecompressorError
                | UnknownCompressionMethod
        )
    }

    /// Errors after which a writer should rotate to a fresh file and retry.
    pub fn is_retryable_by_rotation(&self) -> bool {
        use JournalError::*;

        match self {
            FileFull | OutOfSpace | EntryTooLarge | ForeignLineage | UncleanShutdown
            | FileArchived | UnsupportedFeature(_) | LegacyHeader => true,
            JournalError::Io(e) => matches!(
                e.raw_os_error(),
                Some(
                    libc::E2BIG
                        | libc::EFBIG
                        | libc::EDQUOT
                        | libc::ENOSPC
                        | libc::EHOSTDOWN
                        | libc::EBUSY
                        | libc::EPROTONOSUPPORT
                        | libc::EBADMSG
                        | libc::ENODATA
                        | libc::ESHUTDOWN
                )
            ),
            e => e.is_corruption(),
        }
    }
}

pub type Result<T> = std::result::Result<T, JournalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_retryable() {
        assert!(JournalError::FileFull.is_retryable_by_rotation());
        assert!(JournalError::OutOfSpace.is_retryable_by_rotation());
        assert!(JournalError::ForeignLineage.is_retryable_by_rotation());
        assert!(JournalError::UnsupportedFeature(0x20).is_retryable_by_rotation());
    }

    #[test]
    fn corruption_is_retryable() {
        assert!(JournalError::InvalidObjectLocation.is_corruption());
        assert!(JournalError::InvalidObjectLocation.is_retryable_by_rotation());
        assert!(!JournalError::FileFull.is_corruption());
    }

    #[test]
    fn io_errors_are_classified_by_errno() {
        let enospc = JournalError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        let eacces = JournalError::Io(io::Error::from_raw_os_error(libc::EACCES));
        assert!(enospc.is_retryable_by_rotation());
        assert!(!eacces.is_retryable_by_rotation());
        assert!(!JournalError::ValueGuardInUse.is_retryable_by_rotation());
    }
}
