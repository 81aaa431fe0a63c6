use crate::error::{JournalError, Result};
use std::fs::File;
use std::io;
use std::ops::{Deref, DerefMut};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub use memmap2::{Mmap, MmapMut, MmapOptions};

const PAGE_SIZE: u64 = 4096;

pub trait MemoryMap: Deref<Target = [u8]> {
    /// Whether creating a mapping may extend the file.
    const GROWS_FILE: bool;

    fn create(file: &File, offset: u64, size: u64) -> Result<Self>
    where
        Self: Sized;
}

pub trait MemoryMapMut: MemoryMap + DerefMut {
    /// Flushes outstanding memory map modifications to disk
    fn flush(&self) -> Result<()>;
}

impl MemoryMap for Mmap {
    const GROWS_FILE: bool = false;

    fn create(file: &File, offset: u64, size: u64) -> Result<Self> {
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(size as usize)
                .map(file)?
        };

        Ok(mmap)
    }
}

/// Reserves disk blocks for `offset..offset + size` so that writes through
/// the mapping can't fault on a full disk.
fn allocate(file: &File, offset: u64, size: u64) -> Result<()> {
    let r = unsafe { libc::posix_fallocate(file.as_raw_fd(), offset as i64, size as i64) };
    match r {
        0 => Ok(()),
        libc::EOPNOTSUPP | libc::EINVAL => {
            if offset + size > file.metadata()?.len() {
                file.set_len(offset + size)?;
            }
            Ok(())
        }
        errno => Err(io::Error::from_raw_os_error(errno).into()),
    }
}

impl MemoryMap for MmapMut {
    const GROWS_FILE: bool = true;

    fn create(file: &File, offset: u64, size: u64) -> Result<Self> {
        let file_size = file.metadata()?.len();
        if offset + size > file_size {
            allocate(file, file_size, offset + size - file_size)?;
        }

        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(size as usize)
                .map_mut(file)?
        };

        Ok(mmap)
    }
}

impl MemoryMapMut for MmapMut {
    fn flush(&self) -> Result<()> {
        MmapMut::flush(self)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CacheStats {
    windows: AtomicUsize,
    mapped_bytes: AtomicU64,
}

/// Mapping policy and accounting shared by every journal file of a process.
///
/// Each window holds a handle to the cache for as long as it is mapped; the
/// mapping goes away with the last handle of its window.
#[derive(Debug, Clone)]
pub struct MmapCache {
    window_size: u64,
    max_windows: usize,
    stats: Arc<CacheStats>,
}

impl Default for MmapCache {
    fn default() -> Self {
        Self::new(8 * 1024 * 1024, 16)
    }
}

impl MmapCache {
    pub fn new(window_size: u64, max_windows: usize) -> Self {
        debug_assert!(window_size != 0 && window_size % PAGE_SIZE == 0);
        debug_assert!(max_windows != 0);

        Self {
            window_size,
            max_windows,
            stats: Arc::default(),
        }
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    /// Windows currently mapped across all files.
    pub fn windows(&self) -> usize {
        self.stats.windows.load(Ordering::Relaxed)
    }

    /// Bytes currently mapped across all files.
    pub fn mapped_bytes(&self) -> u64 {
        self.stats.mapped_bytes.load(Ordering::Relaxed)
    }

    fn lease(&self, size: u64) -> Lease {
        self.stats.windows.fetch_add(1, Ordering::Relaxed);
        self.stats.mapped_bytes.fetch_add(size, Ordering::Relaxed);
        Lease {
            stats: Arc::clone(&self.stats),
            size,
        }
    }
}

struct Lease {
    stats: Arc<CacheStats>,
    size: u64,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.stats.windows.fetch_sub(1, Ordering::Relaxed);
        self.stats.mapped_bytes.fetch_sub(self.size, Ordering::Relaxed);
    }
}

struct Window<M: MemoryMap> {
    offset: u64,
    size: u64,
    mmap: M,
    _lease: Lease,
}

impl<M: MemoryMap> std::fmt::Debug for Window<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl<M: MemoryMap> Window<M> {
    fn end_offset(&self) -> u64 {
        self.offset + self.size
    }

    fn contains(&self, position: u64) -> bool {
        position >= self.offset && position < self.end_offset()
    }

    fn contains_range(&self, position: u64, size: u64) -> bool {
        position >= self.offset && position + size <= self.end_offset()
    }

    fn slice(&self, position: u64, size: u64) -> &[u8] {
        let offset = (position - self.offset) as usize;
        &self.mmap[offset..offset + size as usize]
    }
}

impl<M: MemoryMapMut> Window<M> {
    fn slice_mut(&mut self, position: u64, size: u64) -> &mut [u8] {
        let offset = (position - self.offset) as usize;
        &mut self.mmap[offset..offset + size as usize]
    }
}

/// Maps a file through a small set of chunk-aligned windows.
///
/// Ranges are checked against the file size before they are mapped, so a
/// truncated file produces an error instead of a fault.
pub struct WindowManager<M: MemoryMap> {
    file: File,
    file_size: u64,
    chunk_size: u64,
    max_windows: usize,
    active_window_idx: Option<usize>,
    windows: Vec<Window<M>>,
    cache: MmapCache,
}

impl<M: MemoryMap> WindowManager<M> {
    pub fn new(file: File, cache: MmapCache) -> Result<Self> {
        let file_size = file.metadata()?.len();

        Ok(WindowManager {
            file,
            file_size,
            chunk_size: cache.window_size,
            max_windows: cache.max_windows,
            active_window_idx: None,
            windows: Vec::new(),
            cache,
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Re-reads the file size, picking up data appended by another writer.
    pub fn refresh_file_size(&mut self) -> Result<u64> {
        self.file_size = self.file.metadata()?.len();
        Ok(self.file_size)
    }

    fn check_bounds(&mut self, position: u64, size: u64) -> Result<()> {
        let end = position
            .checked_add(size)
            .ok_or(JournalError::ObjectExceedsFile)?;

        if end <= self.file_size || M::GROWS_FILE {
            return Ok(());
        }

        if end <= self.refresh_file_size()? {
            Ok(())
        } else {
            Err(JournalError::ObjectExceedsFile)
        }
    }

    fn chunk_aligned_start(&self, position: u64) -> u64 {
        (position / self.chunk_size) * self.chunk_size
    }

    fn chunk_aligned_end(&self, position: u64) -> u64 {
        position.div_ceil(self.chunk_size) * self.chunk_size
    }

    fn create_window(&mut self, start: u64, end: u64) -> Result<Window<M>> {
        debug_assert!(start < end);

        let size = end - start;
        let mmap = M::create(&self.file, start, size)?;
        if M::GROWS_FILE {
            self.file_size = self.file_size.max(end);
        }

        Ok(Window {
            offset: start,
            size,
            mmap,
            _lease: self.cache.lease(size),
        })
    }

    fn find_window_to_evict(&self) -> usize {
        if self.active_window_idx == Some(0) && self.windows.len() > 1 {
            1
        } else {
            0
        }
    }

    fn lookup(&self, matches: impl Fn(&Window<M>) -> bool) -> Option<usize> {
        if let Some(idx) = self.active_window_idx {
            if matches(&self.windows[idx]) {
                return Some(idx);
            }
        }

        self.windows.iter().position(matches)
    }

    fn window_index(&mut self, position: u64, size: u64) -> Result<usize> {
        self.check_bounds(position, size)?;

        if let Some(idx) = self.lookup(|w| w.contains_range(position, size)) {
            self.active_window_idx = Some(idx);
            return Ok(idx);
        }

        let start = match self.lookup(|w| w.contains(position)) {
            // Extend the window that holds the start of the range
            Some(idx) => self.windows.remove(idx).offset,
            None => {
                if self.windows.len() >= self.max_windows {
                    self.windows.remove(self.find_window_to_evict());
                }
                self.chunk_aligned_start(position)
            }
        };

        let end = self.chunk_aligned_end(position + size);
        let window = self.create_window(start, end)?;
        self.windows.push(window);

        let idx = self.windows.len() - 1;
        self.active_window_idx = Some(idx);
        Ok(idx)
    }

    pub fn get_slice(&mut self, position: u64, size: u64) -> Result<&[u8]> {
        let idx = self.window_index(position, size)?;
        Ok(self.windows[idx].slice(position, size))
    }

    /// Unmaps every window.
    pub fn release(&mut self) {
        self.windows.clear();
        self.active_window_idx = None;
    }
}

impl<M: MemoryMapMut> WindowManager<M> {
    pub fn get_slice_mut(&mut self, position: u64, size: u64) -> Result<&mut [u8]> {
        let idx = self.window_index(position, size)?;
        Ok(self.windows[idx].slice_mut(position, size))
    }

    /// Flushes every window and syncs file data to disk.
    pub fn sync(&self) -> Result<()> {
        for window in &self.windows {
            window.mmap.flush()?;
        }
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(len: usize) -> (tempfile::NamedTempFile, File) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0xab; len]).unwrap();
        tmp.flush().unwrap();
        let file = File::open(tmp.path()).unwrap();
        (tmp, file)
    }

    #[test]
    fn reads_within_file() {
        let (_tmp, file) = file_with(10_000);
        let cache = MmapCache::new(4096, 2);
        let mut wm = WindowManager::<Mmap>::new(file, cache.clone()).unwrap();

        assert_eq!(wm.get_slice(4000, 200).unwrap(), &[0xab; 200][..]);
        assert_eq!(cache.windows(), 1);
        assert_eq!(cache.mapped_bytes(), 8192);
    }

    #[test]
    fn rejects_ranges_past_end_of_file() {
        let (_tmp, file) = file_with(100);
        let mut wm = WindowManager::<Mmap>::new(file, MmapCache::new(4096, 2)).unwrap();

        assert!(matches!(
            wm.get_slice(96, 16),
            Err(JournalError::ObjectExceedsFile)
        ));
        assert!(matches!(
            wm.get_slice(u64::MAX - 4, 16),
            Err(JournalError::ObjectExceedsFile)
        ));
    }

    #[test]
    fn sees_data_appended_after_open() {
        let (mut tmp, file) = file_with(100);
        let mut wm = WindowManager::<Mmap>::new(file, MmapCache::new(4096, 2)).unwrap();
        assert!(wm.get_slice(100, 50).is_err());

        tmp.write_all(&[1; 50]).unwrap();
        tmp.flush().unwrap();
        assert_eq!(wm.get_slice(100, 50).unwrap(), &[1; 50][..]);
    }

    #[test]
    fn evicts_and_unmaps_windows() {
        let (_tmp, file) = file_with(5 * 4096);
        let cache = MmapCache::new(4096, 2);
        let mut wm = WindowManager::<Mmap>::new(file, cache.clone()).unwrap();

        for page in 0..5 {
            wm.get_slice(page * 4096, 8).unwrap();
        }
        assert_eq!(cache.windows(), 2);

        drop(wm);
        assert_eq!(cache.windows(), 0);
        assert_eq!(cache.mapped_bytes(), 0);
    }

    #[test]
    fn writable_windows_grow_the_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = File::options().read(true).write(true).open(tmp.path()).unwrap();
        let mut wm = WindowManager::<MmapMut>::new(file, MmapCache::new(4096, 4)).unwrap();

        wm.get_slice_mut(5000, 8).unwrap().copy_from_slice(b"journal!");
        wm.sync().unwrap();

        assert!(std::fs::metadata(tmp.path()).unwrap().len() >= 5008);
        assert_eq!(wm.get_slice(5000, 8).unwrap(), b"journal!");
    }
}
