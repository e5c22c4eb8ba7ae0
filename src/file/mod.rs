mod buffer_manager;
mod disk_manager;
mod error;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use buffer_manager::BufferManager;
pub use disk_manager::DiskManager;
pub use error::{FileError, FileResult};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Number of frames in the buffer pool
/// 1024 frames × 4KB = 4MB, enough for a scan plus the pages a single
/// heap file operation touches
pub const BUFFER_POOL_SIZE: usize = 1024;

/// Identifier of a physical page in the database file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(u32);

impl PageId {
    /// On-page marker for "no page" (end of a chain)
    pub const INVALID: PageId = PageId(u32::MAX);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Byte offset of this page inside the database file
    pub(crate) fn file_offset(&self) -> u64 {
        self.0 as u64 * PAGE_SIZE as u64
    }

    /// Decode an on-page link, mapping the sentinel to `None`
    pub fn from_link(raw: u32) -> Option<PageId> {
        let id = PageId(raw);
        id.is_valid().then_some(id)
    }

    /// Encode an optional page as an on-page link
    pub fn to_link(page: Option<PageId>) -> u32 {
        page.unwrap_or(Self::INVALID).0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<invalid>")
        }
    }
}
