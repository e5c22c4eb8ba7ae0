use ahash::RandomState;
use lru::LruCache;

use super::disk_manager::DiskManager;
use super::error::{FileError, FileResult};
use super::{BUFFER_POOL_SIZE, PAGE_SIZE, PageId};

/// Entry in the buffer pool
struct BufferEntry {
    /// The actual page data
    data: Vec<u8>,
    /// Whether this page has been modified since it was loaded or flushed
    dirty: bool,
    /// Number of outstanding pins; pinned pages are never evicted
    pin_count: u32,
}

/// Manages a buffer pool with pin counts and LRU eviction of unpinned pages
pub struct BufferManager {
    /// Underlying disk manager
    disk_manager: DiskManager,
    /// Combined buffer pool and LRU tracker
    buffer_pool: LruCache<PageId, BufferEntry, RandomState>,
    /// Maximum number of frames
    max_pool_size: usize,
    /// Reusable buffer for loading pages (avoids allocation on every load)
    load_buffer: Vec<u8>,
}

impl BufferManager {
    /// Create a new buffer manager
    pub fn new(disk_manager: DiskManager) -> Self {
        Self::with_capacity(disk_manager, BUFFER_POOL_SIZE)
    }

    /// Create a new buffer manager with specified number of frames
    pub fn with_capacity(disk_manager: DiskManager, capacity: usize) -> Self {
        Self {
            disk_manager,
            // Capacity is enforced by load_page so that pinned pages are never
            // pushed out by the cache itself
            buffer_pool: LruCache::unbounded_with_hasher(RandomState::new()),
            max_pool_size: capacity.max(1),
            load_buffer: vec![0u8; PAGE_SIZE],
        }
    }

    /// Get a reference to the disk manager
    pub fn disk_manager(&self) -> &DiskManager {
        &self.disk_manager
    }

    /// Get a mutable reference to the disk manager
    pub fn disk_manager_mut(&mut self) -> &mut DiskManager {
        &mut self.disk_manager
    }

    /// Pin a page, loading it from disk if necessary.
    /// With `empty` set the page is not read but zero-filled, for pages
    /// whose old contents are about to be overwritten.
    pub fn pin_page(&mut self, page_id: PageId, empty: bool) -> FileResult<()> {
        if let Some(entry) = self.buffer_pool.get_mut(&page_id) {
            entry.pin_count += 1;
            return Ok(());
        }
        self.load_page(page_id, empty)
    }

    /// Release one pin on a page, marking it dirty if the caller modified it
    pub fn unpin_page(&mut self, page_id: PageId, dirty: bool) -> FileResult<()> {
        let entry = self
            .buffer_pool
            .peek_mut(&page_id)
            .filter(|entry| entry.pin_count > 0)
            .ok_or(FileError::PageNotPinned(page_id))?;

        entry.pin_count -= 1;
        entry.dirty |= dirty;
        Ok(())
    }

    /// Bytes of a pinned page
    pub fn page(&self, page_id: PageId) -> FileResult<&[u8]> {
        self.buffer_pool
            .peek(&page_id)
            .filter(|entry| entry.pin_count > 0)
            .map(|entry| entry.data.as_slice())
            .ok_or(FileError::PageNotPinned(page_id))
    }

    /// Mutable bytes of a pinned page. Dirtiness is declared on unpin.
    pub fn page_mut(&mut self, page_id: PageId) -> FileResult<&mut [u8]> {
        self.buffer_pool
            .peek_mut(&page_id)
            .filter(|entry| entry.pin_count > 0)
            .map(|entry| entry.data.as_mut_slice())
            .ok_or(FileError::PageNotPinned(page_id))
    }

    /// Pin a page for the duration of `f` and unpin it clean afterwards,
    /// on the error path as well
    pub fn with_page<T, E>(
        &mut self,
        page_id: PageId,
        f: impl FnOnce(&[u8]) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<FileError>,
    {
        self.pin_page(page_id, false)?;
        let result = match self.page(page_id) {
            Ok(data) => f(data),
            Err(err) => Err(err.into()),
        };
        let unpinned = self.unpin_page(page_id, false);

        let value = result?;
        unpinned?;
        Ok(value)
    }

    /// Pin a page for the duration of `f`; it is unpinned dirty if `f`
    /// succeeded and clean if it failed
    pub fn with_page_mut<T, E>(
        &mut self,
        page_id: PageId,
        f: impl FnOnce(&mut [u8]) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<FileError>,
    {
        self.pin_page(page_id, false)?;
        let result = match self.page_mut(page_id) {
            Ok(data) => f(data),
            Err(err) => Err(err.into()),
        };
        let unpinned = self.unpin_page(page_id, result.is_ok());

        let value = result?;
        unpinned?;
        Ok(value)
    }

    /// Allocate `count` contiguous pages on disk and return the first one,
    /// pinned and zero-filled
    pub fn new_page(&mut self, count: usize) -> FileResult<PageId> {
        let page_id = self.disk_manager.allocate_pages(count)?;

        if let Err(err) = self.pin_page(page_id, true) {
            for id in page_id.as_u32()..page_id.as_u32() + count as u32 {
                self.disk_manager.deallocate_page(PageId::new(id))?;
            }
            return Err(err);
        }

        Ok(page_id)
    }

    /// Drop a page from the pool without writing it back and return it to
    /// the allocator. Fails if the page is still pinned.
    pub fn free_page(&mut self, page_id: PageId) -> FileResult<()> {
        if let Some(entry) = self.buffer_pool.peek(&page_id)
            && entry.pin_count > 0
        {
            return Err(FileError::PagePinned(page_id, entry.pin_count));
        }

        self.buffer_pool.pop(&page_id);
        self.disk_manager.deallocate_page(page_id)
    }

    /// Flush a specific page to disk if it's dirty
    pub fn flush_page(&mut self, page_id: PageId) -> FileResult<()> {
        // Peek so flushing does not count as a use
        if let Some(entry) = self.buffer_pool.peek_mut(&page_id)
            && entry.dirty
        {
            self.disk_manager.write_page(page_id, &entry.data)?;
            entry.dirty = false;
        }

        Ok(())
    }

    /// Flush all dirty pages and persist the allocator state
    pub fn flush_all(&mut self) -> FileResult<()> {
        let dirty_pages: Vec<PageId> = self
            .buffer_pool
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(page_id, _)| *page_id)
            .collect();

        for page_id in dirty_pages {
            self.flush_page(page_id)?;
        }

        self.disk_manager.sync()?;

        Ok(())
    }

    /// Load a page into the buffer pool with one pin
    fn load_page(&mut self, page_id: PageId, empty: bool) -> FileResult<()> {
        if !self.disk_manager.is_allocated(page_id) {
            return Err(FileError::PageNotAllocated(page_id));
        }

        // Make room first, only unpinned pages are candidates
        while self.buffer_pool.len() >= self.max_pool_size {
            self.evict_lru_page()?;
        }

        if self.load_buffer.len() != PAGE_SIZE {
            self.load_buffer = vec![0u8; PAGE_SIZE];
        }

        if empty {
            self.load_buffer.fill(0);
        } else {
            self.disk_manager
                .read_page(page_id, &mut self.load_buffer)?;
        }

        // Move the loaded data into the pool without copying
        let data = std::mem::take(&mut self.load_buffer);
        self.buffer_pool.put(
            page_id,
            BufferEntry {
                data,
                dirty: false,
                pin_count: 1,
            },
        );

        Ok(())
    }

    /// Evict the least recently used unpinned page
    fn evict_lru_page(&mut self) -> FileResult<()> {
        let victim = self
            .buffer_pool
            .iter()
            .rev()
            .find(|(_, entry)| entry.pin_count == 0)
            .map(|(page_id, _)| *page_id)
            .ok_or(FileError::BufferPoolFull(self.max_pool_size))?;

        // Write back while the frame is still cached, a failed write keeps it
        self.flush_page(victim)?;

        if let Some(entry) = self.buffer_pool.pop(&victim) {
            // Recycle the evicted buffer for future page loads
            self.load_buffer = entry.data;
        }

        Ok(())
    }

    /// Get the number of pages currently in the buffer pool
    pub fn buffer_pool_size(&self) -> usize {
        self.buffer_pool.len()
    }

    /// Check if a page is in the buffer pool
    pub fn is_page_cached(&self, page_id: PageId) -> bool {
        self.buffer_pool.contains(&page_id)
    }

    /// Get the number of dirty pages in the buffer pool
    pub fn dirty_page_count(&self) -> usize {
        self.buffer_pool.iter().filter(|(_, e)| e.dirty).count()
    }

    /// Outstanding pins on a page (0 if it is not cached)
    pub fn pin_count(&self, page_id: PageId) -> u32 {
        self.buffer_pool
            .peek(&page_id)
            .map_or(0, |entry| entry.pin_count)
    }

    /// Number of pages with at least one outstanding pin
    pub fn pinned_page_count(&self) -> usize {
        self.buffer_pool
            .iter()
            .filter(|(_, e)| e.pin_count > 0)
            .count()
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        // Flush all dirty pages when the buffer manager is dropped
        if let Err(err) = self.flush_all() {
            log::warn!("failed to flush buffer pool on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_env(capacity: usize) -> (TempDir, BufferManager) {
        let temp_dir = tempfile::tempdir().unwrap();
        let test_file = temp_dir.path().join("test.db");

        let disk_manager = DiskManager::create(&test_file).unwrap();
        let buffer_manager = BufferManager::with_capacity(disk_manager, capacity);

        (temp_dir, buffer_manager)
    }

    /// Allocate `n` pages and leave them unpinned
    fn allocate(bm: &mut BufferManager, n: usize) -> Vec<PageId> {
        (0..n)
            .map(|_| {
                let page_id = bm.new_page(1).unwrap();
                bm.unpin_page(page_id, false).unwrap();
                page_id
            })
            .collect()
    }

    #[test]
    fn test_pin_and_read_page() {
        let (_temp_dir, mut bm) = setup_test_env(8);
        let page_id = bm.disk_manager_mut().allocate_pages(1).unwrap();

        // Write a page directly through the disk manager
        let mut write_buffer = vec![0u8; PAGE_SIZE];
        write_buffer[0] = 42;
        bm.disk_manager_mut()
            .write_page(page_id, &write_buffer)
            .unwrap();

        bm.pin_page(page_id, false).unwrap();
        assert_eq!(bm.page(page_id).unwrap()[0], 42);
        assert_eq!(bm.pin_count(page_id), 1);
        bm.unpin_page(page_id, false).unwrap();
        assert_eq!(bm.pin_count(page_id), 0);
        assert_eq!(bm.buffer_pool_size(), 1);
    }

    #[test]
    fn test_access_requires_pin() {
        let (_temp_dir, mut bm) = setup_test_env(8);
        let page_id = allocate(&mut bm, 1)[0];

        assert!(matches!(bm.page(page_id), Err(FileError::PageNotPinned(_))));
        assert!(matches!(
            bm.page_mut(page_id),
            Err(FileError::PageNotPinned(_))
        ));
        assert!(matches!(
            bm.unpin_page(page_id, false),
            Err(FileError::PageNotPinned(_))
        ));
    }

    #[test]
    fn test_pin_unallocated_page() {
        let (_temp_dir, mut bm) = setup_test_env(8);

        let result = bm.pin_page(PageId::new(3), false);
        assert!(matches!(result, Err(FileError::PageNotAllocated(_))));
        assert_eq!(bm.buffer_pool_size(), 0);
    }

    #[test]
    fn test_nested_pins() {
        let (_temp_dir, mut bm) = setup_test_env(8);
        let page_id = allocate(&mut bm, 1)[0];

        bm.pin_page(page_id, false).unwrap();
        bm.pin_page(page_id, false).unwrap();
        assert_eq!(bm.pin_count(page_id), 2);
        assert_eq!(bm.pinned_page_count(), 1);

        bm.unpin_page(page_id, true).unwrap();
        bm.unpin_page(page_id, false).unwrap();
        assert_eq!(bm.pinned_page_count(), 0);
        // A dirty unpin is not undone by a later clean one
        assert_eq!(bm.dirty_page_count(), 1);
    }

    #[test]
    fn test_new_page_is_pinned_and_zeroed() {
        let (_temp_dir, mut bm) = setup_test_env(8);

        let page_id = bm.new_page(1).unwrap();
        assert_eq!(bm.pin_count(page_id), 1);
        assert!(bm.page(page_id).unwrap().iter().all(|&b| b == 0));
        bm.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_with_page_mut_dirty_only_on_success() {
        let (_temp_dir, mut bm) = setup_test_env(8);
        let pages = allocate(&mut bm, 2);

        let failed: Result<(), FileError> = bm.with_page_mut(pages[0], |data| {
            data[0] = 1;
            Err(FileError::InvalidPageCount(0))
        });
        assert!(failed.is_err());
        assert_eq!(bm.dirty_page_count(), 0);
        assert_eq!(bm.pin_count(pages[0]), 0);

        bm.with_page_mut(pages[1], |data| {
            data[0] = 9;
            Ok::<_, FileError>(())
        })
        .unwrap();
        assert_eq!(bm.dirty_page_count(), 1);
        assert_eq!(bm.pin_count(pages[1]), 0);

        let first = bm.with_page(pages[1], |data| Ok::<_, FileError>(data[0])).unwrap();
        assert_eq!(first, 9);
    }

    #[test]
    fn test_flush_page() {
        let (_temp_dir, mut bm) = setup_test_env(8);
        let page_id = allocate(&mut bm, 1)[0];

        bm.pin_page(page_id, false).unwrap();
        bm.page_mut(page_id).unwrap()[0] = 55;
        bm.unpin_page(page_id, true).unwrap();
        assert_eq!(bm.dirty_page_count(), 1);

        bm.flush_page(page_id).unwrap();
        assert_eq!(bm.dirty_page_count(), 0);

        let mut buffer = vec![0u8; PAGE_SIZE];
        bm.disk_manager_mut()
            .read_page(page_id, &mut buffer)
            .unwrap();
        assert_eq!(buffer[0], 55);
    }

    #[test]
    fn test_lru_eviction_skips_pinned_pages() {
        let (_temp_dir, mut bm) = setup_test_env(3);
        let pages = allocate(&mut bm, 5);
        for &page_id in &pages[..3] {
            bm.pin_page(page_id, false).unwrap();
            bm.unpin_page(page_id, false).unwrap();
        }

        // Pin page 0, then touch the others so page 0 is the LRU entry again
        bm.pin_page(pages[0], false).unwrap();
        for &page_id in &pages[1..3] {
            bm.pin_page(page_id, false).unwrap();
            bm.unpin_page(page_id, false).unwrap();
        }

        bm.pin_page(pages[3], false).unwrap();
        bm.unpin_page(pages[3], false).unwrap();

        assert_eq!(bm.buffer_pool_size(), 3);
        assert!(bm.is_page_cached(pages[0]));
        assert!(!bm.is_page_cached(pages[1]));
        assert!(bm.is_page_cached(pages[2]));
        assert!(bm.is_page_cached(pages[3]));
        bm.unpin_page(pages[0], false).unwrap();
    }

    #[test]
    fn test_pool_full_when_everything_pinned() {
        let (_temp_dir, mut bm) = setup_test_env(2);
        let pages = allocate(&mut bm, 3);

        bm.pin_page(pages[0], false).unwrap();
        bm.pin_page(pages[1], false).unwrap();
        let result = bm.pin_page(pages[2], false);
        assert!(matches!(result, Err(FileError::BufferPoolFull(2))));

        bm.unpin_page(pages[1], false).unwrap();
        bm.pin_page(pages[2], false).unwrap();
        assert!(!bm.is_page_cached(pages[1]));
    }

    #[test]
    fn test_dirty_page_flushed_on_eviction() {
        let (_temp_dir, mut bm) = setup_test_env(2);
        let pages = allocate(&mut bm, 3);

        bm.pin_page(pages[0], false).unwrap();
        bm.page_mut(pages[0]).unwrap()[0] = 77;
        bm.unpin_page(pages[0], true).unwrap();

        // Touch enough pages to push page 0 out
        for &page_id in &pages[1..] {
            bm.pin_page(page_id, false).unwrap();
            bm.unpin_page(page_id, false).unwrap();
        }
        assert!(!bm.is_page_cached(pages[0]));

        let value = bm.with_page(pages[0], |data| Ok::<_, FileError>(data[0])).unwrap();
        assert_eq!(value, 77);
    }

    #[test]
    fn test_failed_write_back_keeps_victim_cached() {
        let (_temp_dir, mut bm) = setup_test_env(1);
        let victim = bm.new_page(1).unwrap();
        bm.page_mut(victim).unwrap()[0] = 42;
        bm.unpin_page(victim, true).unwrap();
        let other = bm.disk_manager_mut().allocate_pages(1).unwrap();

        // Pull the page out from under the pool so its write-back fails
        bm.disk_manager_mut().deallocate_page(victim).unwrap();

        let result = bm.pin_page(other, false);
        assert!(matches!(result, Err(FileError::PageNotAllocated(id)) if id == victim));
        assert!(bm.is_page_cached(victim));
        assert!(!bm.is_page_cached(other));
        assert_eq!(bm.dirty_page_count(), 1);

        // Restore the allocation so the drop-time flush succeeds
        assert_eq!(bm.disk_manager_mut().allocate_pages(1).unwrap(), victim);
        bm.flush_all().unwrap();
        assert_eq!(bm.dirty_page_count(), 0);
    }

    #[test]
    fn test_free_page() {
        let (_temp_dir, mut bm) = setup_test_env(8);
        let page_id = allocate(&mut bm, 1)[0];

        bm.pin_page(page_id, false).unwrap();
        let result = bm.free_page(page_id);
        assert!(matches!(result, Err(FileError::PagePinned(_, 1))));

        bm.unpin_page(page_id, true).unwrap();
        bm.free_page(page_id).unwrap();
        assert!(!bm.is_page_cached(page_id));
        assert!(!bm.disk_manager().is_allocated(page_id));

        let result = bm.free_page(page_id);
        assert!(matches!(result, Err(FileError::PageNotAllocated(_))));
    }

    #[test]
    fn test_drop_flushes_dirty_pages() {
        let temp_dir = tempfile::tempdir().unwrap();
        let test_file = temp_dir.path().join("test.db");

        let page_id = {
            let mut bm = BufferManager::new(DiskManager::create(&test_file).unwrap());
            let page_id = bm.new_page(1).unwrap();
            bm.page_mut(page_id).unwrap()[0] = 88;
            bm.unpin_page(page_id, true).unwrap();
            page_id
            // bm is dropped here, should flush
        };

        let mut bm = BufferManager::new(DiskManager::open(&test_file).unwrap());
        let value = bm.with_page(page_id, |data| Ok::<_, FileError>(data[0])).unwrap();
        assert_eq!(value, 88);
    }
}
