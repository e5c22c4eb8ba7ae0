mod error;
mod heap_file;
mod page;
mod record;
mod scan;


pub use error::{ErrorKind, HeapError, HeapResult};
pub use heap_file::{HeapFile, SharedBufferManager};
pub use page::{HeapPage, MAX_RECORD_SIZE, PAGE_HEADER_SIZE, PageHeader, SLOT_SIZE};
pub use record::{RecordId, SlotId};
pub use scan::HeapScan;

use crate::file::{BufferManager, DiskManager};
use std::sync::{Arc, Mutex};

/// Wrap a disk manager in a buffer pool that heap files can share
pub fn shared_pool(disk_manager: DiskManager, frames: usize) -> SharedBufferManager {
    Arc::new(Mutex::new(BufferManager::with_capacity(disk_manager, frames)))
}
