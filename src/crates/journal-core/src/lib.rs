//! Storage engine for append-only journal files.
//!
//! The [`file`] module implements the on-disk format: the header, the
//! object arena, the data and field hash tables and the entry array
//! chains, together with the writer that appends entries and the lookups
//! that read them back.
//!
//! Rotation policy, retention and rate limiting live in `journal-writer`;
//! iteration across the files of a directory lives in `journal-session`.

// Core error types used throughout the crate
pub mod error;

// Low-level journal file format I/O
pub mod file;

// Re-export repository types from journal-registry for convenience
pub mod repository {
    pub use journal_registry::repository::*;
}

pub use error::{JournalError, Result};

pub use file::{
    BucketUtilization, Compression, Direction, JournalCursor, JournalFile, JournalFileOptions,
    JournalFilter, JournalMetrics, JournalWriter, Location, Mmap, MmapCache, MmapMut,
    ResolvedMetrics, VerifyReport, verify,
};
