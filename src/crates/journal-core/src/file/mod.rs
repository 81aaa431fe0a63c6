// Modules - keep some public for advanced usage
pub mod compress;
pub mod cursor;
#[allow(clippy::module_inception)]
pub mod file;
pub mod filter;
mod guard;
pub mod hash;
pub mod header;
mod lookup;
pub mod metrics;
pub mod mmap;
pub mod object;
pub mod offset_array;
pub mod verify;
pub mod writer;

// Core functionality
pub use file::{BucketUtilization, ChainCacheItem, JournalFile, JournalFileOptions};
pub use verify::{VerifyReport, verify};
pub use writer::JournalWriter;

// Positioning and filtering
pub use cursor::{JournalCursor, Location};
pub use filter::{FilterExpr, JournalFilter};
pub use offset_array::Direction;

// Format details callers inspect
pub use compress::Compression;
pub use header::{JournalHeader, JournalState};
pub use metrics::{FilesystemSpace, JournalMetrics, ResolvedMetrics};
pub use object::HashableObject;

pub use guard::ValueGuard;
pub use mmap::{Mmap, MmapCache, MmapMut};

pub type JournalFileMap = JournalFile<Mmap>;
