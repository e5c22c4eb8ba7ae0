//! Slotted layout of a heap page.
//!
//! ```text
//! +--------------------+ 0
//! | header (20 bytes)  |
//! +--------------------+ 20
//! | slot directory     |  4 bytes per slot, grows towards the end
//! +--------------------+ 20 + 4 * slot_count
//! | free space         |
//! +--------------------+ free_ptr
//! | record data        |  grows towards the header
//! +--------------------+ PAGE_SIZE
//! ```
//!
//! Deleted slots stay in the directory as tombstones so the slot numbers of
//! live records never change.

use super::error::{HeapError, HeapResult};
use super::record::{RecordId, SlotId};
use crate::file::{PAGE_SIZE, PageId};

/// Size of the page header in bytes
pub const PAGE_HEADER_SIZE: usize = 20;

/// Size of one slot directory entry (offset: 2, length: 2)
pub const SLOT_SIZE: usize = 4;

/// Largest record that fits into an empty page
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE;

/// Slot length marking a deleted record
const EMPTY_SLOT: u16 = u16::MAX;

/// "HF", distinguishes formatted heap pages from garbage
const HEAP_PAGE_MAGIC: u16 = 0x4846;

/// Page header stored at the beginning of each heap page
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub prev_page: u32,  // 4 bytes - previous page in the chain
    pub next_page: u32,  // 4 bytes - next page in the chain
    pub page_id: u32,    // 4 bytes - id of this page
    pub slot_count: u16, // 2 bytes - entries in the slot directory, tombstones included
    pub free_ptr: u16,   // 2 bytes - start of the record data region
    pub free_space: u16, // 2 bytes - bytes between slot directory and record data
    magic: u16,          // 2 bytes
}

impl PageHeader {
    const SIZE: usize = PAGE_HEADER_SIZE;

    pub fn new(page_id: PageId) -> Self {
        Self {
            prev_page: PageId::INVALID.as_u32(),
            next_page: PageId::INVALID.as_u32(),
            page_id: page_id.as_u32(),
            slot_count: 0,
            free_ptr: PAGE_SIZE as u16,
            free_space: (PAGE_SIZE - Self::SIZE) as u16,
            magic: HEAP_PAGE_MAGIC,
        }
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut result = [0u8; Self::SIZE];
        result[0..4].copy_from_slice(&self.prev_page.to_le_bytes());
        result[4..8].copy_from_slice(&self.next_page.to_le_bytes());
        result[8..12].copy_from_slice(&self.page_id.to_le_bytes());
        result[12..14].copy_from_slice(&self.slot_count.to_le_bytes());
        result[14..16].copy_from_slice(&self.free_ptr.to_le_bytes());
        result[16..18].copy_from_slice(&self.free_space.to_le_bytes());
        result[18..20].copy_from_slice(&self.magic.to_le_bytes());
        result
    }

    pub fn deserialize(data: &[u8]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let u16_at = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);

        Self {
            prev_page: u32_at(0),
            next_page: u32_at(4),
            page_id: u32_at(8),
            slot_count: u16_at(12),
            free_ptr: u16_at(14),
            free_space: u16_at(16),
            magic: u16_at(18),
        }
    }

    /// End of the slot directory
    fn directory_end(&self) -> usize {
        Self::SIZE + self.slot_count as usize * SLOT_SIZE
    }
}

/// Entry of the slot directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    offset: u16,
    length: u16,
}

impl Slot {
    const EMPTY: Slot = Slot {
        offset: 0,
        length: EMPTY_SLOT,
    };

    fn is_empty(&self) -> bool {
        self.length == EMPTY_SLOT
    }

    /// Whether the record lies inside the data region starting at `free_ptr`.
    /// Empty records are only bounded by the page end.
    fn fits(&self, free_ptr: usize) -> bool {
        let range = self.range();
        range.end <= PAGE_SIZE && (range.is_empty() || range.start >= free_ptr)
    }

    fn range(&self) -> std::ops::Range<usize> {
        let start = self.offset as usize;
        start..start + self.length as usize
    }
}

/// Heap page view over a page buffer, borrowed from the buffer pool.
/// Reads work on any byte buffer, writes need a mutable one.
pub struct HeapPage<B> {
    buffer: B,
    header: PageHeader, // Cached header for fast access
}

impl<B: AsRef<[u8]>> HeapPage<B> {
    /// Wrap an existing heap page
    pub fn from_buffer(buffer: B) -> HeapResult<Self> {
        let data = buffer.as_ref();
        if data.len() != PAGE_SIZE {
            return Err(HeapError::Corrupted {
                page_id: PageId::INVALID,
                reason: format!("invalid page size: {} bytes", data.len()),
            });
        }

        let header = PageHeader::deserialize(&data[..PageHeader::SIZE]);
        let page_id = PageId::new(header.page_id);
        let corrupted = |reason: &str| HeapError::Corrupted {
            page_id,
            reason: reason.to_string(),
        };

        if header.magic != HEAP_PAGE_MAGIC {
            return Err(corrupted("not a heap page"));
        }

        let free_ptr = header.free_ptr as usize;
        let directory_end = header.directory_end();
        if free_ptr > PAGE_SIZE || directory_end > free_ptr {
            return Err(corrupted("slot directory overlaps record data"));
        }
        if header.free_space as usize != free_ptr - directory_end {
            return Err(corrupted("free space count out of sync"));
        }

        let page = Self { buffer, header };
        for slot_id in 0..header.slot_count {
            if let Some(slot) = page.live_slot(slot_id)
                && !slot.fits(free_ptr)
            {
                return Err(corrupted(&format!(
                    "slot {slot_id} points outside the record data"
                )));
            }
        }

        Ok(page)
    }

    pub fn page_id(&self) -> PageId {
        PageId::new(self.header.page_id)
    }

    pub fn prev_page(&self) -> Option<PageId> {
        PageId::from_link(self.header.prev_page)
    }

    pub fn next_page(&self) -> Option<PageId> {
        PageId::from_link(self.header.next_page)
    }

    /// Number of slot directory entries, tombstones included
    pub fn slot_count(&self) -> usize {
        self.header.slot_count as usize
    }

    /// Bytes available for the data of one more record, after reserving its
    /// slot directory entry
    pub fn free_space(&self) -> usize {
        (self.header.free_space as usize).saturating_sub(SLOT_SIZE)
    }

    /// Number of live records
    pub fn record_count(&self) -> usize {
        (0..self.header.slot_count)
            .filter(|&slot_id| self.live_slot(slot_id).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.first_record().is_none()
    }

    fn rid(&self, slot_id: SlotId) -> RecordId {
        RecordId::new(self.page_id(), slot_id)
    }

    fn slot(&self, slot_id: SlotId) -> Option<Slot> {
        if slot_id >= self.header.slot_count {
            return None;
        }
        let at = PageHeader::SIZE + slot_id as usize * SLOT_SIZE;
        let data = self.buffer.as_ref();
        Some(Slot {
            offset: u16::from_le_bytes([data[at], data[at + 1]]),
            length: u16::from_le_bytes([data[at + 2], data[at + 3]]),
        })
    }

    fn live_slot(&self, slot_id: SlotId) -> Option<Slot> {
        self.slot(slot_id).filter(|slot| !slot.is_empty())
    }

    fn checked_slot(&self, slot_id: SlotId) -> HeapResult<Slot> {
        self.live_slot(slot_id)
            .ok_or_else(|| HeapError::InvalidSlot(self.rid(slot_id)))
    }

    /// Bytes of a live record
    pub fn select_record(&self, slot_id: SlotId) -> HeapResult<&[u8]> {
        let slot = self.checked_slot(slot_id)?;
        Ok(&self.buffer.as_ref()[slot.range()])
    }

    /// First live slot at or after `from`
    pub fn next_live_slot(&self, from: usize) -> Option<SlotId> {
        (from..self.slot_count())
            .map(|slot_id| slot_id as SlotId)
            .find(|&slot_id| self.live_slot(slot_id).is_some())
    }

    /// First live record on the page
    pub fn first_record(&self) -> Option<RecordId> {
        self.next_live_slot(0).map(|slot_id| self.rid(slot_id))
    }

    /// Live record following `rid` on this page
    pub fn next_record(&self, rid: RecordId) -> Option<RecordId> {
        if rid.page_id != self.page_id() {
            return None;
        }
        self.next_live_slot(rid.slot_id as usize + 1)
            .map(|slot_id| self.rid(slot_id))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> HeapPage<B> {
    /// Format an empty heap page in the provided buffer
    pub fn new(mut buffer: B, page_id: PageId) -> HeapResult<Self> {
        let len = buffer.as_ref().len();
        if len != PAGE_SIZE {
            return Err(HeapError::Corrupted {
                page_id,
                reason: format!("invalid page size: {len} bytes"),
            });
        }

        let header = PageHeader::new(page_id);
        let data = buffer.as_mut();
        data.fill(0);
        data[..PageHeader::SIZE].copy_from_slice(&header.serialize());

        Ok(Self { buffer, header })
    }

    /// Recompute the free space count and write the header back
    fn write_header(&mut self) {
        self.header.free_space = (self.header.free_ptr as usize - self.header.directory_end()) as u16;
        self.buffer.as_mut()[..PageHeader::SIZE].copy_from_slice(&self.header.serialize());
    }

    fn write_slot(&mut self, slot_id: SlotId, slot: Slot) {
        let at = PageHeader::SIZE + slot_id as usize * SLOT_SIZE;
        let data = self.buffer.as_mut();
        data[at..at + 2].copy_from_slice(&slot.offset.to_le_bytes());
        data[at + 2..at + 4].copy_from_slice(&slot.length.to_le_bytes());
    }

    pub fn set_prev_page(&mut self, page_id: Option<PageId>) {
        self.header.prev_page = PageId::to_link(page_id);
        self.write_header();
    }

    pub fn set_next_page(&mut self, page_id: Option<PageId>) {
        self.header.next_page = PageId::to_link(page_id);
        self.write_header();
    }

    /// Append a record, returning its new slot. Deleted slots are not reused.
    pub fn insert_record(&mut self, record: &[u8]) -> HeapResult<SlotId> {
        let available = self.free_space();
        if record.len() > available {
            return Err(HeapError::PageFull {
                page_id: self.page_id(),
                needed: record.len(),
                available,
            });
        }

        let offset = self.header.free_ptr as usize - record.len();
        self.buffer.as_mut()[offset..offset + record.len()].copy_from_slice(record);

        let slot_id = self.header.slot_count;
        self.header.slot_count += 1;
        self.header.free_ptr = offset as u16;
        self.write_slot(
            slot_id,
            Slot {
                offset: offset as u16,
                length: record.len() as u16,
            },
        );
        self.write_header();

        Ok(slot_id)
    }

    /// Overwrite a record in place. The new record may not be longer than
    /// the one it replaces.
    pub fn update_record(&mut self, slot_id: SlotId, record: &[u8]) -> HeapResult<()> {
        let slot = self.checked_slot(slot_id)?;
        if record.len() > slot.length as usize {
            return Err(HeapError::RecordTooLargeForSlot {
                rid: self.rid(slot_id),
                needed: record.len(),
                capacity: slot.length as usize,
            });
        }

        let updated = Slot {
            offset: slot.offset,
            length: record.len() as u16,
        };
        self.buffer.as_mut()[updated.range()].copy_from_slice(record);
        self.write_slot(slot_id, updated);

        Ok(())
    }

    /// Tombstone a record. Its bytes are only returned to free space when
    /// they border the free region; nothing else moves.
    pub fn delete_record(&mut self, slot_id: SlotId) -> HeapResult<()> {
        let slot = self.checked_slot(slot_id)?;

        if slot.offset == self.header.free_ptr {
            self.header.free_ptr += slot.length;
        }
        self.write_slot(slot_id, Slot::EMPTY);
        self.write_header();

        Ok(())
    }
}
