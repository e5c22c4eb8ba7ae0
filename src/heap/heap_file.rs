use ahash::AHashMap;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::{HeapError, HeapResult};
use super::page::{HeapPage, MAX_RECORD_SIZE};
use super::record::RecordId;
use super::scan::HeapScan;
use crate::file::{BufferManager, FileError, PageId};

/// Buffer pool shared between heap files and their scans
pub type SharedBufferManager = Arc<Mutex<BufferManager>>;

pub(super) fn lock_pool(pool: &SharedBufferManager) -> HeapResult<MutexGuard<'_, BufferManager>> {
    pool.lock().map_err(|_| HeapError::File(FileError::PoolPoisoned))
}

/// A page of the file with the free space it had after the last write
#[derive(Debug, Clone, Copy)]
struct PageEntry {
    page_id: PageId,
    free_space: usize,
}

/// Unordered collection of records spread over a chain of heap pages.
///
/// The file only knows the ids of its pages; page bytes are pinned from the
/// buffer pool for the duration of each operation.
pub struct HeapFile {
    pool: SharedBufferManager,
    /// `None` for a temporary file without a directory entry
    name: Option<String>,
    /// Pages in chain order, the first one is the anchor
    pages: Vec<PageEntry>,
    /// Page id -> position in `pages`
    page_index: AHashMap<PageId, usize>,
    record_count: usize,
    /// Cleared by `delete_file`, shared with every scan over this file
    live: Arc<AtomicBool>,
}

impl HeapFile {
    /// Open the named heap file, creating it if the directory has no entry
    /// for it. Without a name a temporary file is created, which deletes
    /// itself when dropped.
    pub fn open(pool: SharedBufferManager, name: Option<&str>) -> HeapResult<Self> {
        let mut file = Self {
            pool,
            name: name.map(str::to_string),
            pages: Vec::new(),
            page_index: AHashMap::new(),
            record_count: 0,
            live: Arc::new(AtomicBool::new(true)),
        };

        let pool = Arc::clone(&file.pool);
        let mut bm = lock_pool(&pool)?;

        let anchor = name.and_then(|name| bm.disk_manager().file_entry(name));
        match (name, anchor) {
            (Some(name), Some(anchor)) => {
                file.load_chain(&mut bm, anchor)?;
                info!(
                    "opened heap file {name}: {} page(s), {} record(s)",
                    file.pages.len(),
                    file.record_count
                );
            }
            (Some(name), None) => {
                let page_id = allocate_page(&mut bm, None)?;
                if let Err(err) = bm.disk_manager_mut().add_file_entry(name, page_id) {
                    bm.free_page(page_id)?;
                    return Err(err.into());
                }
                file.push_page(page_id);
                info!("created heap file {name} at page {page_id}");
            }
            (None, _) => {
                let page_id = allocate_page(&mut bm, None)?;
                file.push_page(page_id);
                debug!("created temporary heap file at page {page_id}");
            }
        }

        drop(bm);
        Ok(file)
    }

    /// Create a temporary heap file
    pub fn temporary(pool: SharedBufferManager) -> HeapResult<Self> {
        Self::open(pool, None)
    }

    /// Open a named heap file that must already have a directory entry.
    /// Nothing is allocated when the name is unknown.
    pub fn open_existing(pool: SharedBufferManager, name: &str) -> HeapResult<Self> {
        let exists = lock_pool(&pool)?.disk_manager().file_entry(name).is_some();
        if !exists {
            return Err(FileError::FileEntryNotFound(name.to_string()).into());
        }
        Self::open(pool, Some(name))
    }

    /// Adopt an existing chain by walking next links from the anchor
    fn load_chain(&mut self, bm: &mut BufferManager, anchor: PageId) -> HeapResult<()> {
        let mut prev = None;
        let mut next = Some(anchor);

        while let Some(page_id) = next {
            if self.page_index.contains_key(&page_id) {
                return Err(HeapError::Corrupted {
                    page_id,
                    reason: "page chain loops back".to_string(),
                });
            }

            let (own_id, prev_link, free_space, records, following) =
                bm.with_page(page_id, |data| {
                    let page = HeapPage::from_buffer(data)?;
                    Ok::<_, HeapError>((
                        page.page_id(),
                        page.prev_page(),
                        page.free_space(),
                        page.record_count(),
                        page.next_page(),
                    ))
                })?;

            if own_id != page_id || prev_link != prev {
                return Err(HeapError::Corrupted {
                    page_id,
                    reason: format!("page links out of sync (prev {prev_link:?}, expected {prev:?})"),
                });
            }

            self.push_page(page_id);
            if let Some(entry) = self.pages.last_mut() {
                entry.free_space = free_space;
            }
            self.record_count += records;
            prev = Some(page_id);
            next = following;
        }

        Ok(())
    }

    fn push_page(&mut self, page_id: PageId) {
        self.page_index.insert(page_id, self.pages.len());
        self.pages.push(PageEntry {
            page_id,
            free_space: MAX_RECORD_SIZE,
        });
    }

    fn is_deleted(&self) -> bool {
        !self.live.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> HeapResult<()> {
        if self.is_deleted() {
            return Err(HeapError::FileDeleted);
        }
        Ok(())
    }

    /// Position of a page in this file
    fn page_position(&self, page_id: PageId) -> HeapResult<usize> {
        self.ensure_live()?;
        self.page_index
            .get(&page_id)
            .copied()
            .ok_or(HeapError::PageNotInFile(page_id))
    }

    /// Position of the record's page in this file
    fn locate(&self, rid: RecordId) -> HeapResult<usize> {
        self.page_position(rid.page_id)
    }

    /// Insert a record into the first page with room for it, growing the
    /// chain by one page if none has
    pub fn insert_record(&mut self, record: &[u8]) -> HeapResult<RecordId> {
        self.ensure_live()?;
        if record.len() > MAX_RECORD_SIZE {
            return Err(HeapError::RecordTooLarge {
                len: record.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let pool = Arc::clone(&self.pool);
        let mut bm = lock_pool(&pool)?;

        let index = match self
            .pages
            .iter()
            .position(|entry| entry.free_space >= record.len())
        {
            Some(index) => index,
            None => {
                self.append_page(&mut bm)?;
                self.pages.len() - 1
            }
        };

        let page_id = self.pages[index].page_id;
        let (slot_id, free_space) = bm.with_page_mut(page_id, |data| {
            let mut page = HeapPage::from_buffer(data)?;
            let slot_id = page.insert_record(record)?;
            Ok::<_, HeapError>((slot_id, page.free_space()))
        })?;

        self.pages[index].free_space = free_space;
        self.record_count += 1;
        Ok(RecordId::new(page_id, slot_id))
    }

    /// Allocate a page and link it behind the current tail
    fn append_page(&mut self, bm: &mut BufferManager) -> HeapResult<()> {
        let tail = self.pages.last().map(|entry| entry.page_id);
        let page_id = allocate_page(bm, tail)?;

        if let Some(tail) = tail {
            let linked = bm.with_page_mut(tail, |data| {
                let mut page = HeapPage::from_buffer(data)?;
                page.set_next_page(Some(page_id));
                Ok::<_, HeapError>(())
            });
            if let Err(err) = linked {
                if let Err(free_err) = bm.free_page(page_id) {
                    warn!("failed to release unlinked page {page_id}: {free_err}");
                }
                return Err(err);
            }
        }

        debug!("linked page {page_id} after {tail:?}");
        self.push_page(page_id);
        Ok(())
    }

    /// Read a record
    pub fn get_record(&self, rid: RecordId) -> HeapResult<Vec<u8>> {
        self.locate(rid)?;
        lock_pool(&self.pool)?.with_page(rid.page_id, |data| {
            let page = HeapPage::from_buffer(data)?;
            Ok::<_, HeapError>(page.select_record(rid.slot_id)?.to_vec())
        })
    }

    /// Overwrite a record in place; the new record may not be longer than
    /// the current one
    pub fn update_record(&mut self, rid: RecordId, record: &[u8]) -> HeapResult<()> {
        self.locate(rid)?;
        if record.len() > MAX_RECORD_SIZE {
            return Err(HeapError::RecordTooLarge {
                len: record.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        lock_pool(&self.pool)?.with_page_mut(rid.page_id, |data| {
            let mut page = HeapPage::from_buffer(data)?;
            page.update_record(rid.slot_id, record)
        })
    }

    /// Delete a record. Its slot is tombstoned, other RIDs stay valid.
    pub fn delete_record(&mut self, rid: RecordId) -> HeapResult<()> {
        let index = self.locate(rid)?;

        let free_space = lock_pool(&self.pool)?.with_page_mut(rid.page_id, |data| {
            let mut page = HeapPage::from_buffer(data)?;
            page.delete_record(rid.slot_id)?;
            Ok::<_, HeapError>(page.free_space())
        })?;

        self.pages[index].free_space = free_space;
        self.record_count -= 1;
        Ok(())
    }

    /// Number of live records, no I/O
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Start a sequential scan. Nothing is pinned until the scan advances,
    /// and the scan fails with `FileDeleted` once the file is deleted.
    pub fn open_scan(&self) -> HeapScan {
        HeapScan::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.live),
            self.page_ids(),
        )
    }

    /// Free every page of the file and drop its directory entry.
    ///
    /// All pages are attempted even if some fail; the failures are reported
    /// together. Afterwards the file is empty and rejects further operations.
    /// A page still pinned by an open scan is freed when that scan lets go
    /// of it.
    pub fn delete_file(&mut self) -> HeapResult<()> {
        self.ensure_live()?;

        let mut failures = Vec::new();
        {
            let mut bm = lock_pool(&self.pool)?;
            // Cleared under the pool lock so a scan cannot pin a page in between
            self.live.store(false, Ordering::Release);
            for entry in &self.pages {
                if let Err(err) = bm.free_page(entry.page_id) {
                    warn!("failed to free page {}: {err}", entry.page_id);
                    failures.push((entry.page_id, err));
                }
            }

            if let Some(name) = &self.name {
                let anchor = self.pages.first().map_or(PageId::INVALID, |e| e.page_id);
                if let Err(err) = bm.disk_manager_mut().delete_file_entry(name) {
                    failures.push((anchor, err));
                }
            }
        }

        info!(
            "deleted heap file {self}: {} page(s), {} failure(s)",
            self.pages.len(),
            failures.len()
        );

        self.pages.clear();
        self.page_index.clear();
        self.record_count = 0;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HeapError::DeleteFailed(failures))
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_temporary(&self) -> bool {
        self.name.is_none()
    }

    /// Page ids in chain order
    pub fn page_ids(&self) -> Vec<PageId> {
        self.pages.iter().map(|entry| entry.page_id).collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Previous and next links stored in one of the file's pages
    pub fn page_links(&self, page_id: PageId) -> HeapResult<(Option<PageId>, Option<PageId>)> {
        self.page_position(page_id)?;
        lock_pool(&self.pool)?.with_page(page_id, |data| {
            let page = HeapPage::from_buffer(data)?;
            Ok::<_, HeapError>((page.prev_page(), page.next_page()))
        })
    }
}

/// Allocate and format an empty heap page linked to `prev`
fn allocate_page(bm: &mut BufferManager, prev: Option<PageId>) -> HeapResult<PageId> {
    let page_id = bm.new_page(1)?;

    let formatted = bm
        .page_mut(page_id)
        .map_err(HeapError::from)
        .and_then(|data| {
            let mut page = HeapPage::new(data, page_id)?;
            page.set_prev_page(prev);
            Ok(())
        });
    bm.unpin_page(page_id, formatted.is_ok())?;

    if let Err(err) = formatted {
        bm.free_page(page_id)?;
        return Err(err);
    }

    debug!("allocated heap page {page_id}");
    Ok(page_id)
}

impl fmt::Display for HeapFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "<temporary>"),
        }
    }
}

impl Drop for HeapFile {
    fn drop(&mut self) {
        // Temporary files have no directory entry, nobody could reopen them
        if self.is_temporary() && !self.is_deleted() {
            if let Err(err) = self.delete_file() {
                warn!("failed to delete temporary heap file: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::DiskManager;
    use crate::heap::ErrorKind;
    use tempfile::TempDir;

    fn setup_test_env() -> (TempDir, SharedBufferManager) {
        let temp_dir = tempfile::tempdir().unwrap();
        let disk_manager = DiskManager::create(temp_dir.path().join("test.db")).unwrap();
        let buffer_manager = BufferManager::new(disk_manager);
        (temp_dir, Arc::new(Mutex::new(buffer_manager)))
    }

    fn pinned_pages(pool: &SharedBufferManager) -> usize {
        pool.lock().unwrap().pinned_page_count()
    }

    #[test]
    fn test_create_temporary_file() {
        let (_temp_dir, pool) = setup_test_env();

        let file = HeapFile::temporary(pool.clone()).unwrap();
        assert!(file.is_temporary());
        assert_eq!(file.page_count(), 1);
        assert_eq!(file.record_count(), 0);
        assert_eq!(file.to_string(), "<temporary>");
        assert_eq!(pinned_pages(&pool), 0);
    }

    #[test]
    fn test_insert_and_get_record() {
        let (_temp_dir, pool) = setup_test_env();
        let mut file = HeapFile::temporary(pool.clone()).unwrap();

        let rid = file.insert_record(b"alpha").unwrap();
        assert_eq!(file.get_record(rid).unwrap(), b"alpha");
        assert_eq!(file.record_count(), 1);
        assert_eq!(pinned_pages(&pool), 0);
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let (_temp_dir, pool) = setup_test_env();
        let mut file = HeapFile::temporary(pool.clone()).unwrap();

        let result = file.insert_record(&vec![0u8; MAX_RECORD_SIZE + 1]);
        let err = result.unwrap_err();
        assert!(matches!(err, HeapError::RecordTooLarge { .. }));
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(file.record_count(), 0);
        assert_eq!(pool.lock().unwrap().dirty_page_count(), 1); // only the formatted anchor

        // Exactly the maximum still fits
        file.insert_record(&vec![0u8; MAX_RECORD_SIZE]).unwrap();
        assert_eq!(file.page_count(), 1);
    }

    #[test]
    fn test_foreign_rid_is_rejected() {
        let (_temp_dir, pool) = setup_test_env();
        let mut file = HeapFile::temporary(pool.clone()).unwrap();
        let mut other = HeapFile::temporary(pool.clone()).unwrap();
        let foreign = other.insert_record(b"elsewhere").unwrap();

        let err = file.get_record(foreign).unwrap_err();
        assert!(matches!(err, HeapError::PageNotInFile(_)));
        assert!(matches!(
            file.update_record(foreign, b"x"),
            Err(HeapError::PageNotInFile(_))
        ));
        assert!(matches!(
            file.delete_record(foreign),
            Err(HeapError::PageNotInFile(_))
        ));
        assert_eq!(other.record_count(), 1);
    }

    #[test]
    fn test_foreign_page_links_are_rejected() {
        let (_temp_dir, pool) = setup_test_env();
        let file = HeapFile::temporary(pool.clone()).unwrap();
        let other = HeapFile::temporary(pool.clone()).unwrap();
        let foreign = other.page_ids()[0];

        let err = file.page_links(foreign).unwrap_err();
        assert!(matches!(err, HeapError::PageNotInFile(page_id) if page_id == foreign));
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[test]
    fn test_open_existing_never_creates() {
        let (_temp_dir, pool) = setup_test_env();

        let result = HeapFile::open_existing(pool.clone(), "typo");
        assert!(matches!(
            result,
            Err(HeapError::File(FileError::FileEntryNotFound(ref name))) if name == "typo"
        ));
        {
            let bm = pool.lock().unwrap();
            assert_eq!(bm.disk_manager().file_entry("typo"), None);
            assert_eq!(bm.disk_manager().allocated_page_count(), 0);
        }

        let rid = {
            let mut file = HeapFile::open(pool.clone(), Some("ledger")).unwrap();
            file.insert_record(b"entry").unwrap()
        };
        let file = HeapFile::open_existing(pool.clone(), "ledger").unwrap();
        assert_eq!(file.name(), Some("ledger"));
        assert_eq!(file.get_record(rid).unwrap(), b"entry");
    }

    #[test]
    fn test_update_record() {
        let (_temp_dir, pool) = setup_test_env();
        let mut file = HeapFile::temporary(pool.clone()).unwrap();
        let rid = file.insert_record(b"original").unwrap();

        file.update_record(rid, b"replaced").unwrap();
        assert_eq!(file.get_record(rid).unwrap(), b"replaced");

        let err = file.update_record(rid, b"much longer record").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(file.get_record(rid).unwrap(), b"replaced");
        assert_eq!(pinned_pages(&pool), 0);
    }

    #[test]
    fn test_delete_record() {
        let (_temp_dir, pool) = setup_test_env();
        let mut file = HeapFile::temporary(pool.clone()).unwrap();
        let rid = file.insert_record(b"doomed").unwrap();

        file.delete_record(rid).unwrap();
        assert_eq!(file.record_count(), 0);

        let err = file.get_record(rid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRecord);

        // Deleting twice fails and does not touch the count
        assert!(matches!(
            file.delete_record(rid),
            Err(HeapError::InvalidSlot(_))
        ));
        assert_eq!(file.record_count(), 0);
    }

    #[test]
    fn test_new_page_is_linked_as_tail() {
        let (_temp_dir, pool) = setup_test_env();
        let mut file = HeapFile::temporary(pool.clone()).unwrap();

        let record = vec![1u8; 1000];
        let mut rids = Vec::new();
        while file.page_count() < 3 {
            rids.push(file.insert_record(&record).unwrap());
        }

        let pages = file.page_ids();
        assert_eq!(file.page_links(pages[0]).unwrap(), (None, Some(pages[1])));
        assert_eq!(
            file.page_links(pages[1]).unwrap(),
            (Some(pages[0]), Some(pages[2]))
        );
        assert_eq!(file.page_links(pages[2]).unwrap(), (Some(pages[1]), None));

        // 4 records of 1000 bytes fit a page
        assert_eq!(rids.len(), 9);
        assert!(rids[..4].iter().all(|rid| rid.page_id == pages[0]));
        assert!(rids[4..8].iter().all(|rid| rid.page_id == pages[1]));
        assert_eq!(rids[8].page_id, pages[2]);
    }

    #[test]
    fn test_first_fit_reuses_space_in_earlier_pages() {
        let (_temp_dir, pool) = setup_test_env();
        let mut file = HeapFile::temporary(pool.clone()).unwrap();

        let mut rids = Vec::new();
        for _ in 0..5 {
            rids.push(file.insert_record(&[7u8; 1000]).unwrap());
        }
        assert_eq!(file.page_count(), 2);

        // The last record on the first page borders its free space
        file.delete_record(rids[3]).unwrap();
        let rid = file.insert_record(&[8u8; 900]).unwrap();
        assert_eq!(rid.page_id, file.page_ids()[0]);
        assert_eq!(rid.slot_id, 4);
        assert_eq!(file.record_count(), 5);
    }

    #[test]
    fn test_allocation_failure_keeps_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let disk_manager =
            DiskManager::create_with_limit(temp_dir.path().join("test.db"), 1).unwrap();
        let pool = Arc::new(Mutex::new(BufferManager::new(disk_manager)));
        let mut file = HeapFile::temporary(pool.clone()).unwrap();

        file.insert_record(&vec![0u8; 3000]).unwrap();
        let err = file.insert_record(&vec![0u8; 3000]).unwrap_err();
        assert!(matches!(err, HeapError::File(FileError::DiskFull(1))));
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(file.record_count(), 1);
        assert_eq!(file.page_count(), 1);
        assert_eq!(pinned_pages(&pool), 0);
    }

    #[test]
    fn test_named_file_reopen() {
        let (_temp_dir, pool) = setup_test_env();

        let (rid_a, rid_b, pages) = {
            let mut file = HeapFile::open(pool.clone(), Some("students")).unwrap();
            assert!(!file.is_temporary());
            let rid_a = file.insert_record(&[1u8; 3000]).unwrap();
            let rid_b = file.insert_record(&[2u8; 3000]).unwrap();
            let rid_c = file.insert_record(b"gone").unwrap();
            file.delete_record(rid_c).unwrap();
            (rid_a, rid_b, file.page_ids())
        };
        assert_eq!(pages.len(), 2);

        // Named files survive drop
        let file = HeapFile::open(pool.clone(), Some("students")).unwrap();
        assert_eq!(file.to_string(), "students");
        assert_eq!(file.page_ids(), pages);
        assert_eq!(file.record_count(), 2);
        assert_eq!(file.get_record(rid_a).unwrap(), vec![1u8; 3000]);
        assert_eq!(file.get_record(rid_b).unwrap(), vec![2u8; 3000]);
    }

    #[test]
    fn test_delete_named_file() {
        let (_temp_dir, pool) = setup_test_env();
        let mut file = HeapFile::open(pool.clone(), Some("orders")).unwrap();
        file.insert_record(b"order").unwrap();
        let pages = file.page_ids();

        file.delete_file().unwrap();
        assert_eq!(file.record_count(), 0);
        assert_eq!(file.page_count(), 0);

        let bm = pool.lock().unwrap();
        assert_eq!(bm.disk_manager().file_entry("orders"), None);
        assert!(!bm.disk_manager().is_allocated(pages[0]));
        drop(bm);

        assert!(matches!(
            file.insert_record(b"late"),
            Err(HeapError::FileDeleted)
        ));
        assert!(matches!(file.delete_file(), Err(HeapError::FileDeleted)));
    }

    #[test]
    fn test_temporary_file_freed_on_drop() {
        let (_temp_dir, pool) = setup_test_env();

        {
            let mut file = HeapFile::temporary(pool.clone()).unwrap();
            for _ in 0..3 {
                file.insert_record(&[0u8; 3000]).unwrap();
            }
            assert_eq!(pool.lock().unwrap().disk_manager().allocated_page_count(), 3);
        }

        assert_eq!(pool.lock().unwrap().disk_manager().allocated_page_count(), 0);
    }

    #[test]
    fn test_corrupted_chain_is_detected() {
        let (_temp_dir, pool) = setup_test_env();
        let anchor = {
            let mut file = HeapFile::open(pool.clone(), Some("loop")).unwrap();
            file.insert_record(&[0u8; 3000]).unwrap();
            file.insert_record(&[0u8; 3000]).unwrap();
            file.page_ids()[0]
        };

        // Point the anchor's next link back at itself
        pool.lock()
            .unwrap()
            .with_page_mut(anchor, |data| {
                let mut page = HeapPage::from_buffer(data)?;
                page.set_next_page(Some(anchor));
                Ok::<_, HeapError>(())
            })
            .unwrap();

        let result = HeapFile::open(pool.clone(), Some("loop"));
        assert!(matches!(result, Err(HeapError::Corrupted { .. })));
        assert_eq!(pinned_pages(&pool), 0);
    }
}
