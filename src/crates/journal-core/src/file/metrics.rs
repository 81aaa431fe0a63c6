//! Size policy for the files of one journal directory.

use crate::error::Result;
use std::path::Path;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Smallest file we ever create. Also the floor for `max_size`.
pub const FILE_SIZE_MIN: u64 = 64 * 1024;

const DEFAULT_MIN_SIZE: u64 = 512 * 1024;
const DEFAULT_MIN_USE: u64 = MIB;
const DEFAULT_MAX_USE_UPPER: u64 = 4 * GIB;
const DEFAULT_MAX_SIZE_UPPER: u64 = 128 * MIB;
const DEFAULT_KEEP_FREE_UPPER: u64 = 4 * GIB;
const DEFAULT_N_MAX_FILES: u64 = 100;

/// Per-directory sizing policy consulted by allocation, rotation and vacuum.
///
/// Fields left as `None` are derived from the size of the backing
/// filesystem by [`JournalMetrics::resolve`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalMetrics {
    pub max_use: Option<u64>,
    pub min_use: Option<u64>,
    pub max_size: Option<u64>,
    pub min_size: Option<u64>,
    pub keep_free: Option<u64>,
    pub n_max_files: Option<u64>,
}

/// Metrics with every limit filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMetrics {
    pub max_use: u64,
    pub min_use: u64,
    pub max_size: u64,
    pub min_size: u64,
    pub keep_free: u64,
    pub n_max_files: u64,
}

impl JournalMetrics {
    /// Fills in unset limits for a filesystem of `fs_size` bytes.
    pub fn resolve(&self, fs_size: u64) -> ResolvedMetrics {
        let max_use = self.max_use.unwrap_or_else(|| {
            (fs_size / 10).clamp(DEFAULT_MIN_USE, DEFAULT_MAX_USE_UPPER)
        });
        let max_use = max_use.max(FILE_SIZE_MIN * 2);

        let max_size = self
            .max_size
            .unwrap_or_else(|| (max_use / 8).min(DEFAULT_MAX_SIZE_UPPER))
            .max(FILE_SIZE_MIN);
        let max_use = max_use.max(max_size * 2);

        let min_size = self
            .min_size
            .unwrap_or(DEFAULT_MIN_SIZE)
            .clamp(FILE_SIZE_MIN, max_size);

        let keep_free = self
            .keep_free
            .unwrap_or_else(|| (fs_size * 15 / 100).min(DEFAULT_KEEP_FREE_UPPER));

        let min_use = self.min_use.unwrap_or(DEFAULT_MIN_USE).min(max_use);

        ResolvedMetrics {
            max_use,
            min_use,
            max_size,
            min_size,
            keep_free,
            n_max_files: self.n_max_files.unwrap_or(DEFAULT_N_MAX_FILES),
        }
    }

    /// Resolves against the filesystem holding `path`.
    pub fn resolve_for(&self, path: impl AsRef<Path>) -> Result<ResolvedMetrics> {
        let fs = FilesystemSpace::of(path)?;
        Ok(self.resolve(fs.size))
    }
}

impl std::fmt::Display for ResolvedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "max_use={} min_use={} max_size={} min_size={} keep_free={} n_max_files={}",
            self.max_use, self.min_use, self.max_size, self.min_size, self.keep_free, self.n_max_files
        )
    }
}

/// Size and free space of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemSpace {
    pub size: u64,
    pub available: u64,
}

impl FilesystemSpace {
    pub fn of(path: impl AsRef<Path>) -> Result<Self> {
        let stat = nix::sys::statvfs::statvfs(path.as_ref())
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;

        #[allow(clippy::unnecessary_cast)]
        Ok(Self {
            size: stat.blocks() as u64 * stat.fragment_size() as u64,
            available: stat.blocks_available() as u64 * stat.block_size() as u64,
        })
    }
}
