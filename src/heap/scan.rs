use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::error::{HeapError, HeapResult};
use super::heap_file::{SharedBufferManager, lock_pool};
use super::page::HeapPage;
use super::record::{RecordId, SlotId};
use crate::file::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    NotStarted,
    /// `page_id` is pinned, slots before `next_slot` have been returned
    Positioned {
        page_index: usize,
        page_id: PageId,
        next_slot: usize,
    },
    Exhausted,
}

/// Sequential scan over a heap file, in page order and slot order within a
/// page.
///
/// The scan pins at most one page at a time and keeps it pinned between
/// calls. It is released when the scan runs off the end of the file, on
/// `close`, on an error, or when the scan is dropped. Once the file is
/// deleted the scan only fails with `FileDeleted`.
pub struct HeapScan {
    pool: SharedBufferManager,
    /// Liveness flag of the scanned file
    live: Arc<AtomicBool>,
    /// Pages of the file when the scan was opened
    page_ids: Vec<PageId>,
    state: ScanState,
}

impl HeapScan {
    pub(super) fn new(
        pool: SharedBufferManager,
        live: Arc<AtomicBool>,
        page_ids: Vec<PageId>,
    ) -> Self {
        Self {
            pool,
            live,
            page_ids,
            state: ScanState::NotStarted,
        }
    }

    /// Whether another live record is reachable. May move the pin forward
    /// past pages that have nothing left.
    pub fn has_next(&mut self) -> HeapResult<bool> {
        match self.seek() {
            Ok(found) => Ok(found.is_some()),
            Err(err) => {
                self.close_after_error();
                Err(err)
            }
        }
    }

    /// Return the next record with its id, or `None` once the file is
    /// exhausted (at which point nothing is pinned any more)
    pub fn get_next(&mut self) -> HeapResult<Option<(RecordId, Vec<u8>)>> {
        match self.advance() {
            Ok(next) => Ok(next),
            Err(err) => {
                self.close_after_error();
                Err(err)
            }
        }
    }

    /// Release the pinned page, if any. Safe to call repeatedly.
    pub fn close(&mut self) -> HeapResult<()> {
        let state = std::mem::replace(&mut self.state, ScanState::Exhausted);
        if let ScanState::Positioned { page_id, .. } = state {
            let mut bm = lock_pool(&self.pool)?;
            bm.unpin_page(page_id, false)?;

            // delete_file could not free the page while it was pinned
            if !self.live.load(Ordering::Acquire) && bm.pin_count(page_id) == 0 {
                bm.free_page(page_id)?;
                debug!("freed page {page_id} of a deleted heap file");
            }
        }
        Ok(())
    }

    /// Page currently held by the scan
    pub fn pinned_page(&self) -> Option<PageId> {
        match self.state {
            ScanState::Positioned { page_id, .. } => Some(page_id),
            _ => None,
        }
    }

    fn close_after_error(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close heap scan: {err}");
        }
    }

    fn advance(&mut self) -> HeapResult<Option<(RecordId, Vec<u8>)>> {
        let Some(slot_id) = self.seek()? else {
            return Ok(None);
        };
        let ScanState::Positioned {
            page_index,
            page_id,
            ..
        } = self.state
        else {
            return Ok(None);
        };

        let record = {
            let bm = lock_pool(&self.pool)?;
            HeapPage::from_buffer(bm.page(page_id)?)?
                .select_record(slot_id)?
                .to_vec()
        };

        self.state = ScanState::Positioned {
            page_index,
            page_id,
            next_slot: slot_id as usize + 1,
        };
        Ok(Some((RecordId::new(page_id, slot_id), record)))
    }

    /// Position the cursor on the next live slot, walking to later pages
    /// as needed. The old page is unpinned before the next one is pinned.
    fn seek(&mut self) -> HeapResult<Option<SlotId>> {
        let mut bm = lock_pool(&self.pool)?;
        if self.state != ScanState::Exhausted && !self.live.load(Ordering::Acquire) {
            return Err(HeapError::FileDeleted);
        }

        loop {
            match self.state {
                ScanState::Exhausted => return Ok(None),
                ScanState::NotStarted => {
                    let Some(&page_id) = self.page_ids.first() else {
                        self.state = ScanState::Exhausted;
                        return Ok(None);
                    };
                    bm.pin_page(page_id, false)?;
                    self.state = ScanState::Positioned {
                        page_index: 0,
                        page_id,
                        next_slot: 0,
                    };
                }
                ScanState::Positioned {
                    page_index,
                    page_id,
                    next_slot,
                } => {
                    let found = HeapPage::from_buffer(bm.page(page_id)?)?.next_live_slot(next_slot);
                    if let Some(slot_id) = found {
                        self.state = ScanState::Positioned {
                            page_index,
                            page_id,
                            next_slot: slot_id as usize,
                        };
                        return Ok(Some(slot_id));
                    }

                    self.state = ScanState::Exhausted;
                    bm.unpin_page(page_id, false)?;

                    let Some(&next_page) = self.page_ids.get(page_index + 1) else {
                        debug!("scan finished after page {page_id}");
                        return Ok(None);
                    };
                    bm.pin_page(next_page, false)?;
                    debug!("scan moved from page {page_id} to {next_page}");
                    self.state = ScanState::Positioned {
                        page_index: page_index + 1,
                        page_id: next_page,
                        next_slot: 0,
                    };
                }
            }
        }
    }
}

/// Streaming form of the scan; an error ends the iteration
impl Iterator for HeapScan {
    type Item = HeapResult<(RecordId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().transpose()
    }
}

impl Drop for HeapScan {
    fn drop(&mut self) {
        self.close_after_error();
    }
}
