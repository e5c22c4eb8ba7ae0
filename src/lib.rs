pub mod file;
pub mod heap;

pub use file::{
    BUFFER_POOL_SIZE, BufferManager, DiskManager, FileError, FileResult, PAGE_SIZE, PageId,
};
pub use heap::{
    ErrorKind, HeapError, HeapFile, HeapResult, HeapScan, MAX_RECORD_SIZE, RecordId,
    SharedBufferManager, SlotId, shared_pool,
};
